//! Runs functions in long-lived evaluator pods reached by port-forward.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kpt_core::{CancellationToken, Error, ImageRef, Result};
use kpt_kubehub::map_kube_error;
use kube::{
    api::{Api, ListParams},
    Client,
};
use tracing::{debug, info};

use crate::grpc::evaluate;
use crate::{FunctionRunner, FunctionSpec};

pub const FUNCTION_LABEL_PREFIX: &str = "functions.porch.kpt.dev/";
/// Full image reference the pod serves.
pub const FUNCTION_IMAGE_ANNOTATION: &str = "functions.porch.kpt.dev/image";

pub struct PodRunner {
    client: Client,
    namespace: String,
    port: u16,
}

impl PodRunner {
    pub fn new(client: Client, namespace: &str, port: u16) -> Self {
        Self { client, namespace: namespace.to_string(), port }
    }

    /// Label selector for pods serving `image`.
    pub fn selector(image: &str) -> Result<String> {
        let parsed = ImageRef::parse(image)?;
        Ok(format!("{}{}", FUNCTION_LABEL_PREFIX, parsed.short_name()))
    }

    /// A running pod whose image annotation is exactly `image`.
    async fn find_pod(&self, image: &str) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&Self::selector(image)?);
        let pods = api.list(&lp).await.map_err(|e| map_kube_error("fn.pod", e))?;
        pods.items
            .into_iter()
            .filter(|p| serves(p, image))
            .filter_map(|p| p.metadata.name)
            .next()
            .ok_or_else(|| Error::not_found(format!("no running evaluator pod for {} in {}", image, self.namespace)))
    }
}

fn serves(pod: &Pod, image: &str) -> bool {
    let annotated = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(FUNCTION_IMAGE_ANNOTATION))
        .map(|v| v == image)
        .unwrap_or(false);
    let running = pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
    annotated && running
}

#[async_trait]
impl FunctionRunner for PodRunner {
    async fn run(&self, func: &FunctionSpec, input: &[u8], cancel: &CancellationToken) -> Result<Vec<u8>> {
        let image = func
            .image
            .as_deref()
            .ok_or_else(|| Error::unsupported_function("evaluator pods run image functions only").with_op("fn.pod"))?;
        let pod = self.find_pod(image).await.map_err(|e| e.with_op("fn.pod"))?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut pf = api.portforward(&pod, &[self.port]).await.map_err(|e| map_kube_error("fn.pod", e))?;
        let stream = pf
            .take_stream(self.port)
            .ok_or_else(|| Error::transport(format!("port {} of pod {} is not forwarded", self.port, pod)).with_op("fn.pod"))?;
        debug!(pod = %pod, image, port = self.port, "forwarded evaluator port");
        let out = tokio::select! {
            out = evaluate(stream, "localhost", image, input) => out.map_err(|e| e.with_op("fn.pod")),
            _ = cancel.cancelled() => Err(Error::internal("cancelled").with_op("fn.pod")),
        };
        pf.abort();
        if out.is_ok() {
            info!(pod = %pod, image, "evaluated function in pod");
        }
        out
    }
}
