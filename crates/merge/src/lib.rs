//! Three-way merge of kpt packages.
//!
//! `tree` merges single documents, `resource` joins documents by identity,
//! `strategy` runs the update strategies over whole package trees.

#![forbid(unsafe_code)]

pub mod diff;
pub mod kptfile;
pub mod resource;
pub mod strategy;
pub mod tree;

pub use diff::{apply_patch, diff_packages, merge_text, unified_diff, DiffKind, FileDiff};
pub use resource::merge_resources;
pub use strategy::{local_edits, merge_packages, MergeOutcome};
pub use tree::{TreeMerger, ASSOCIATIVE_KEYS};
