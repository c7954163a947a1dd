//! kpt document model: KRM resources as comment-preserving node trees.
//!
//! Values come from `serde_yaml`; a line scanner recovers comments, scalar
//! styles and indentation so edited documents keep their look and untouched
//! documents are written back byte-for-byte.

#![forbid(unsafe_code)]

pub mod emit;
pub mod node;
mod parse;
pub mod path;
pub mod resource;
mod scan;

pub use emit::EmitOptions;
pub use node::{Meta, Node, Scalar, Style, Value};
pub use path::{parse_path, Step};
pub use resource::{parse_file, parse_json, parse_stream, serialize_stream, Format, Resource};
