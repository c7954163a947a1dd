use sha1::{Digest, Sha1};

/// Label placed on ResourceGroup inventories; its value is the inventory id.
pub const INVENTORY_ID_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

/// Deterministic inventory id for `(namespace, name)`.
///
/// The hashed string is length-prefixed (`"{len(ns)}:{ns}:{len(name)}:{name}"`)
/// so that `("a", "bcd")` and `("abc", "d")` never collide. The result is
/// always 40 lowercase hex characters.
pub fn generate_id(namespace: &str, name: &str) -> String {
    let input = format!("{}:{}:{}:{}", namespace.len(), namespace, name.len(), name);
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values() {
        assert_eq!(generate_id("test-namespace", "inventory-obj-name"), "b71156e872dad0b8efe1ce0303da20ef583453d6");
        assert_eq!(generate_id("a", "bcd"), "a1724ac2a61ec038d055881eb4403c74ab4256e9");
        assert_eq!(generate_id("abc", "d"), "f99cca29ebcfd3bca8c3605d253e4fec27b917ae");
    }

    #[test]
    fn shape_and_determinism() {
        for (ns, name) in [("", ""), ("default", "x"), ("kube-system", "a-very-long-inventory-name")] {
            let id = generate_id(ns, name);
            assert_eq!(id.len(), 40);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            assert_eq!(id, generate_id(ns, name));
        }
        assert_ne!(generate_id("a", "bcd"), generate_id("abc", "d"));
    }
}
