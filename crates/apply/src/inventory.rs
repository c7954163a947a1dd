//! The ResourceGroup object recording what a package applied.

use kpt_core::inventory::INVENTORY_ID_LABEL;
use kpt_core::{generate_id, Error, ResId, Result};
use kpt_pkg::Inventory;
use serde_json::{json, Value as Json};

pub const RESOURCE_GROUP_GROUP: &str = "kpt.dev";
pub const RESOURCE_GROUP_API_VERSION: &str = "kpt.dev/v1alpha1";
pub const RESOURCE_GROUP_KIND: &str = "ResourceGroup";
/// Set on every applied object; its value is the owning inventory ID.
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";
pub const ON_REMOVE_ANNOTATION: &str = "cli-utils.sigs.k8s.io/on-remove";
pub const ON_REMOVE_KEEP: &str = "keep";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRef {
    pub namespace: String,
    pub name: String,
    pub id: String,
}

impl InventoryRef {
    /// Resolves the Kptfile's `inventory` block; the ID is derived when unset.
    pub fn from_kptfile(inv: Option<&Inventory>) -> Result<Self> {
        let inv = inv
            .filter(|i| i.is_set())
            .ok_or_else(|| Error::missing_param("package has no inventory; run `kpt live init` first"))?;
        let namespace = inv.namespace.clone().ok_or_else(|| Error::missing_param("inventory.namespace is not set"))?;
        let name = inv.name.clone().ok_or_else(|| Error::missing_param("inventory.name is not set"))?;
        let id = inv.inventory_id.clone().unwrap_or_else(|| generate_id(&namespace, &name));
        Ok(Self { namespace, name, id })
    }

    pub fn res_id(&self) -> ResId {
        ResId::new(RESOURCE_GROUP_GROUP, RESOURCE_GROUP_KIND, Some(&self.namespace), self.name.clone())
    }

    /// ResourceGroup manifest listing `members`.
    pub fn object<'a>(&self, members: impl IntoIterator<Item = &'a ResId>) -> Json {
        let resources: Vec<Json> = members
            .into_iter()
            .map(|m| {
                json!({
                    "group": m.group,
                    "kind": m.kind,
                    "namespace": m.namespace_str(),
                    "name": m.name,
                })
            })
            .collect();
        json!({
            "apiVersion": RESOURCE_GROUP_API_VERSION,
            "kind": RESOURCE_GROUP_KIND,
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": { INVENTORY_ID_LABEL: self.id },
            },
            "spec": { "resources": resources },
        })
    }

    /// Fails when a live inventory object carries another inventory ID.
    pub fn check_live(&self, live: &Json) -> Result<()> {
        let live_id = live
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(INVENTORY_ID_LABEL))
            .and_then(Json::as_str);
        match live_id {
            Some(id) if id != self.id => Err(Error::already_exists(format!(
                "inventory object {}/{} belongs to inventory {}, not {}",
                self.namespace, self.name, id, self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Members recorded in a live ResourceGroup.
pub fn members(obj: &Json) -> Result<Vec<ResId>> {
    let Some(list) = obj.get("spec").and_then(|s| s.get("resources")) else {
        return Ok(Vec::new());
    };
    let items = list.as_array().ok_or_else(|| Error::parse("ResourceGroup spec.resources is not a list"))?;
    items
        .iter()
        .map(|item| {
            let field = |k: &str| item.get(k).and_then(Json::as_str).unwrap_or("");
            if field("kind").is_empty() || field("name").is_empty() {
                return Err(Error::parse(format!("ResourceGroup entry without kind or name: {}", item)));
            }
            Ok(ResId::new(field("group"), field("kind"), Some(field("namespace")), field("name")))
        })
        .collect()
}

pub fn owner_of(obj: &Json) -> Option<&str> {
    annotation(obj, OWNING_INVENTORY_ANNOTATION)
}

pub fn keep_on_remove(obj: &Json) -> bool {
    annotation(obj, ON_REMOVE_ANNOTATION) == Some(ON_REMOVE_KEEP)
}

fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get("annotations")?.get(key)?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(ns: &str, name: &str) -> Inventory {
        Inventory { namespace: Some(ns.into()), name: Some(name.into()), ..Default::default() }
    }

    #[test]
    fn derives_id_and_round_trips_members() {
        let r = InventoryRef::from_kptfile(Some(&inv("test-namespace", "inventory-obj-name"))).unwrap();
        assert_eq!(r.id, "b71156e872dad0b8efe1ce0303da20ef583453d6");
        let ids = vec![
            ResId::new("", "Namespace", None, "prod"),
            ResId::new("apps", "Deployment", Some("prod"), "web"),
        ];
        let obj = r.object(&ids);
        assert_eq!(obj["metadata"]["labels"][INVENTORY_ID_LABEL], r.id.as_str());
        assert_eq!(members(&obj).unwrap(), ids);
    }

    #[test]
    fn missing_inventory_is_reported() {
        let err = InventoryRef::from_kptfile(None).unwrap_err();
        assert!(err.is(kpt_core::ErrorKind::MissingParam));
        let err = InventoryRef::from_kptfile(Some(&Inventory { name: Some("x".into()), ..Default::default() })).unwrap_err();
        assert!(err.message().contains("namespace"));
    }

    #[test]
    fn live_object_with_other_id_is_rejected() {
        let r = InventoryRef::from_kptfile(Some(&inv("ns", "a"))).unwrap();
        let other = InventoryRef { id: "other".into(), ..r.clone() };
        assert!(r.check_live(&other.object([])).is_err());
        assert!(r.check_live(&r.object([])).is_ok());
    }
}
