//! kpt core types shared by the client toolchain and the orchestrator.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod identity;
pub mod image;
pub mod inventory;

pub use error::{Conflict, Error, ErrorKind, Result, ResultExt};
pub use identity::ResId;
pub use image::ImageRef;
pub use inventory::generate_id;

/// Cooperative cancellation context threaded through long-running operations.
pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use super::{CancellationToken, Conflict, Error, ErrorKind, ImageRef, ResId, Result, ResultExt};
}

/// Returns `Internal("cancelled")` once the token has fired.
pub fn check_cancelled(token: &CancellationToken, op: &str) -> Result<()> {
    if token.is_cancelled() {
        return Err(Error::internal("cancelled").with_op(op));
    }
    Ok(())
}

/// Annotation recording the package-relative file a resource was read from.
pub const PATH_ANNOTATION: &str = "internal.config.kubernetes.io/path";
/// Annotation recording the in-file document index of a resource.
pub const INDEX_ANNOTATION: &str = "internal.config.kubernetes.io/index";
pub const LEGACY_PATH_ANNOTATION: &str = "config.kubernetes.io/path";
pub const LEGACY_INDEX_ANNOTATION: &str = "config.kubernetes.io/index";
/// Resources carrying this annotation with value "true" are never applied to a cluster.
pub const LOCAL_CONFIG_ANNOTATION: &str = "config.kubernetes.io/local-config";

pub const KPTFILE_NAME: &str = "Kptfile";
pub const KPTFILE_API_VERSION: &str = "kpt.dev/v1";
pub const KPTFILE_KIND: &str = "Kptfile";
