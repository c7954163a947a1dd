//! kpt kubehub: kube client acquisition, API discovery and error mapping
//! shared by the apply driver and the pod function runner.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kpt_core::ErrorKind;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::histogram;
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig")
}

/// Served resources, discovered once per catalog and looked up by group
/// and kind. The recommended version of each group wins.
pub struct ApiCatalog {
    client: Client,
    resources: OnceCell<Vec<(ApiResource, bool)>>,
}

impl ApiCatalog {
    pub fn new(client: Client) -> Self {
        Self { client, resources: OnceCell::new() }
    }

    async fn resources(&self) -> Result<&Vec<(ApiResource, bool)>> {
        self.resources
            .get_or_try_init(|| async {
                let t0 = Instant::now();
                let discovery = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
                let mut out = Vec::new();
                for group in discovery.groups() {
                    for (ar, caps) in group.recommended_resources() {
                        out.push((ar, matches!(caps.scope, Scope::Namespaced)));
                    }
                }
                histogram!("kpt_kube_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(resources = out.len(), took_ms = %t0.elapsed().as_millis(), "api discovery complete");
                Ok::<_, anyhow::Error>(out)
            })
            .await
    }

    /// API resource for `group`/`kind` and whether it is namespaced.
    pub async fn resolve(&self, group: &str, kind: &str) -> Result<(ApiResource, bool)> {
        self.resources()
            .await?
            .iter()
            .find(|(ar, _)| ar.group == group && ar.kind == kind)
            .cloned()
            .ok_or_else(|| anyhow!("kind {} in group {:?} is not served by the cluster", kind, group))
    }

    /// Dynamic API for a kind; namespaced kinds without a namespace use `default`.
    pub async fn dynamic_api(&self, group: &str, kind: &str, namespace: Option<&str>) -> Result<(Api<DynamicObject>, bool)> {
        let (ar, namespaced) = self.resolve(group, kind).await?;
        let api = if namespaced {
            Api::namespaced_with(self.client.clone(), namespace.unwrap_or("default"), &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        debug!(group, kind, namespaced, "resolved dynamic api");
        Ok((api, namespaced))
    }
}

/// Drops server-populated fields that should not count as differences.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for key in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Error kind for an API status code.
pub fn kind_for_status(code: u16) -> ErrorKind {
    match code {
        404 => ErrorKind::NotFound,
        401 | 403 => ErrorKind::AuthError,
        409 => ErrorKind::AlreadyExists,
        400 | 422 => ErrorKind::InvalidParam,
        _ => ErrorKind::TransportError,
    }
}

/// Maps a kube client failure to a typed error.
pub fn map_kube_error(op: &str, e: kube::Error) -> kpt_core::Error {
    let kind = match &e {
        kube::Error::Api(ae) => kind_for_status(ae.code),
        _ => ErrorKind::TransportError,
    };
    kpt_core::Error::new(kind, e.to_string()).with_op(op).with_source(e)
}

/// Maps glue-level failures; kube errors inside keep their status mapping.
pub fn map_anyhow(op: &str, e: anyhow::Error) -> kpt_core::Error {
    let kind = match e.downcast_ref::<kube::Error>() {
        Some(kube::Error::Api(ae)) => kind_for_status(ae.code),
        _ if e.to_string().contains("not served") => ErrorKind::NotFound,
        _ => ErrorKind::TransportError,
    };
    kpt_core::Error::new(kind, format!("{:#}", e)).with_op(op)
}
