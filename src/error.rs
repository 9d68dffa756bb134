//! Typed errors for conditions callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached at the
//! operation boundary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolboxError {
    #[error("More than one mha file was found in {dir:?} ({count} files)")]
    AmbiguousResource { dir: PathBuf, count: usize },

    #[error("No mha file was found in {dir:?}")]
    ResourceNotFound { dir: PathBuf },

    #[error("Value with interface {slug} not found")]
    InterfaceNotFound { slug: String },

    #[error("Image name {name:?} does not contain enough `_` separated tokens for a batch id")]
    MalformedImageName { name: String },

    #[error("Batch id mismatch: {slug} resolves to {found:?} but T1 resolves to {expected:?}")]
    BatchIdMismatch {
        expected: String,
        found: String,
        slug: String,
    },

    #[error("Unsupported MetaImage element type: {0}")]
    UnsupportedElementType(String),

    #[error("Malformed MetaImage header: {0}")]
    MalformedHeader(String),

    #[error("Prediction size {prediction:?} does not match ground truth size {ground_truth:?}")]
    GeometryMismatch {
        prediction: [usize; 3],
        ground_truth: [usize; 3],
    },
}
