//! [`Cluster`] over a live API server using server-side apply.

use async_trait::async_trait;
use kpt_core::{ResId, Result};
use kpt_kubehub::{get_kube_client, map_anyhow, map_kube_error, ApiCatalog};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::DynamicObject,
    Client,
};
use serde_json::Value as Json;
use tracing::debug;

use crate::cluster::{object_id, Cluster};

pub const FIELD_MANAGER: &str = "kpt";

pub struct KubeCluster {
    catalog: ApiCatalog,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { catalog: ApiCatalog::new(client) }
    }

    /// Connects with the ambient kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = get_kube_client().await.map_err(|e| map_anyhow("live.connect", e))?;
        Ok(Self::new(client))
    }

    async fn api(&self, id: &ResId, op: &str) -> Result<Api<DynamicObject>> {
        let (api, _) = self
            .catalog
            .dynamic_api(&id.group, &id.kind, id.namespace.as_deref())
            .await
            .map_err(|e| map_anyhow(op, e))?;
        Ok(api)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, id: &ResId) -> Result<Option<Json>> {
        let api = self.api(id, "live.get").await?;
        match api.get_opt(&id.name).await.map_err(|e| map_kube_error("live.get", e))? {
            Some(obj) => Ok(Some(serde_json::to_value(&obj)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, obj: &Json, dry_run: bool) -> Result<Json> {
        let id = object_id(obj)?;
        let api = self.api(&id, "live.apply").await?;
        let mut pp = PatchParams::apply(FIELD_MANAGER).force();
        if dry_run {
            pp = pp.dry_run();
        }
        let applied = api
            .patch(&id.name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| map_kube_error("live.apply", e))?;
        debug!(object = %id, dry_run, "server-side applied");
        Ok(serde_json::to_value(&applied)?)
    }

    async fn delete(&self, id: &ResId) -> Result<bool> {
        let api = self.api(id, "live.delete").await?;
        match api.delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(map_kube_error("live.delete", e)),
        }
    }

    async fn is_namespaced(&self, group: &str, kind: &str) -> Result<bool> {
        let (_, namespaced) = self.catalog.resolve(group, kind).await.map_err(|e| map_anyhow("live.discover", e))?;
        Ok(namespaced)
    }
}
