//! Typed errors carried across every kpt crate.
//!
//! An [`Error`] always has a kind, a human message and the name of the
//! operation that produced it; the package path, a byte offset (for parse
//! failures), merge conflict hunks and a cause chain are optional.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidParam,
    MissingParam,
    NotFound,
    AlreadyExists,
    ConflictingEdits,
    TransportError,
    AuthError,
    ParseError,
    PathNotFound,
    LifecycleForbidden,
    UnsupportedFunction,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidParam => "invalid parameter",
            ErrorKind::MissingParam => "missing parameter",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::ConflictingEdits => "conflicting edits",
            ErrorKind::TransportError => "transport error",
            ErrorKind::AuthError => "authentication error",
            ErrorKind::ParseError => "parse error",
            ErrorKind::PathNotFound => "path not found",
            ErrorKind::LifecycleForbidden => "lifecycle transition forbidden",
            ErrorKind::UnsupportedFunction => "unsupported function",
            ErrorKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conflicting file in a refused merge, with a unified diff of the local edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub file: String,
    pub diff: String,
}

#[derive(thiserror::Error)]
#[error("{}", self.describe())]
pub struct Error {
    kind: ErrorKind,
    message: String,
    op: String,
    path: Option<PathBuf>,
    offset: Option<usize>,
    conflicts: Vec<Conflict>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

macro_rules! kind_ctor {
    ($($fn_name:ident => $kind:ident),* $(,)?) => {
        $(
            pub fn $fn_name(message: impl Into<String>) -> Self {
                Self::new(ErrorKind::$kind, message)
            }
        )*
    };
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            op: String::new(),
            path: None,
            offset: None,
            conflicts: Vec::new(),
            source: None,
        }
    }

    kind_ctor! {
        invalid_param => InvalidParam,
        missing_param => MissingParam,
        not_found => NotFound,
        already_exists => AlreadyExists,
        transport => TransportError,
        auth => AuthError,
        parse => ParseError,
        path_not_found => PathNotFound,
        lifecycle_forbidden => LifecycleForbidden,
        unsupported_function => UnsupportedFunction,
        internal => Internal,
    }

    /// A refused merge; `conflicts` holds the hunks shown to the user.
    pub fn conflicting_edits(message: impl Into<String>, conflicts: Vec<Conflict>) -> Self {
        let mut e = Self::new(ErrorKind::ConflictingEdits, message);
        e.conflicts = conflicts;
        e
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind { self.kind }
    pub fn is(&self, kind: ErrorKind) -> bool { self.kind == kind }
    pub fn message(&self) -> &str { &self.message }
    pub fn op(&self) -> &str { &self.op }
    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }
    pub fn offset(&self) -> Option<usize> { self.offset }
    pub fn conflicts(&self) -> &[Conflict] { &self.conflicts }

    /// Transport failures are the only kind worth retrying automatically.
    pub fn is_retryable(&self) -> bool { self.kind == ErrorKind::TransportError }

    /// Shift a parse offset by the start of the enclosing chunk.
    pub fn shift_offset(mut self, base: usize) -> Self {
        if let Some(off) = self.offset.as_mut() {
            *off += base;
        } else if self.kind == ErrorKind::ParseError {
            self.offset = Some(base);
        }
        self
    }
}

impl Error {
    /// `op: kind: message at byte N (path): cause`, each part only when set.
    fn describe(&self) -> String {
        let mut out = String::new();
        if !self.op.is_empty() {
            out.push_str(&self.op);
            out.push_str(": ");
        }
        out.push_str(&format!("{}: {}", self.kind, self.message));
        if let Some(off) = self.offset {
            out.push_str(&format!(" at byte {}", off));
        }
        if let Some(p) = &self.path {
            out.push_str(&format!(" ({})", p.display()));
        }
        if let Some(src) = &self.source {
            out.push_str(&format!(": {}", src));
        }
        out
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("op", &self.op)
            .field("message", &self.message)
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("conflicts", &self.conflicts.len())
            .field("source", &self.source)
            .finish()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::AuthError,
            _ => ErrorKind::Internal,
        };
        Error::new(kind, "i/o failure").with_source(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        let offset = e.location().map(|l| l.index());
        let mut err = Error::parse(e.to_string());
        err.offset = offset;
        err
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::parse(e.to_string())
    }
}

/// Stamps operation names and paths onto errors flowing out of a call.
pub trait ResultExt<T> {
    /// Sets the operation name unless an inner call already named it.
    fn op(self, op: &str) -> Result<T>;
    fn at_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn op(self, op: &str) -> Result<T> {
        self.map_err(|e| {
            let e: Error = e.into();
            if e.op.is_empty() { e.with_op(op) } else { e }
        })
    }

    fn at_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| {
            let e: Error = e.into();
            if e.path.is_none() { e.with_path(path) } else { e }
        })
    }
}
