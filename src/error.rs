//! Error types for the schema registry

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::compatibility::CompatibilityResult;
use crate::coordination::NodeIdentity;
use crate::formats::FormatError;
use crate::graph::GraphError;
use crate::log::LogError;
use crate::schema::{SchemaId, Version};

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Schema registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Malformed input, rejected before any compatibility check.
    #[error("Invalid schema: {0}")]
    Validation(String),

    #[error("Schema being registered is incompatible with an earlier schema for subject '{subject}': {}", .result.summary)]
    IncompatibleSchema {
        subject: String,
        result: CompatibilityResult,
    },

    #[error("This node is not the master{}", leader_hint(.leader))]
    NotMaster { leader: Option<NodeIdentity> },

    #[error("Log unavailable: {0}")]
    LogUnavailable(#[from] LogError),

    /// The record may already be durable; registering again is safe.
    #[error("Timed out after {timeout:?} waiting for offset {offset} to be applied")]
    CatchUpTimeout { offset: u64, timeout: Duration },

    /// Replay skipped the record because another write got there first.
    #[error("Record at offset {offset} conflicted with an earlier write and was not applied")]
    WriteConflict { offset: u64 },

    #[error("Subject '{subject}' not found")]
    SubjectNotFound { subject: String },

    #[error("Version {version} not found for subject '{subject}'")]
    VersionNotFound { subject: String, version: Version },

    #[error("Schema {id} not found")]
    SchemaNotFound { id: SchemaId },

    #[error("{}", deleted_message(.subject, .version))]
    DeletedEntity {
        subject: String,
        version: Option<Version>,
    },

    #[error("Subject '{subject}' version {version} must be soft deleted before it can be permanently deleted")]
    VersionNotSoftDeleted { subject: String, version: Version },

    #[error("Subject '{subject}' version {version} is referenced by schemas {referenced_by:?}")]
    ReferenceExists {
        subject: String,
        version: Version,
        referenced_by: Vec<SchemaId>,
    },

    #[error("Schema store has not finished replaying the log")]
    StoreNotReady,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl RegistryError {
    /// The structured compatibility diff, when this is an incompatibility.
    pub fn compatibility(&self) -> Option<&CompatibilityResult> {
        match self {
            RegistryError::IncompatibleSchema { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Whether repeating the same request may succeed without changes.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RegistryError::CatchUpTimeout { .. }
                | RegistryError::WriteConflict { .. }
                | RegistryError::LogUnavailable(_)
                | RegistryError::StoreNotReady
                | RegistryError::NotMaster { .. }
        )
    }
}

impl From<FormatError> for RegistryError {
    fn from(err: FormatError) -> Self {
        RegistryError::Validation(err.to_string())
    }
}

impl From<GraphError> for RegistryError {
    fn from(err: GraphError) -> Self {
        RegistryError::Validation(err.to_string())
    }
}

fn leader_hint(leader: &Option<NodeIdentity>) -> String {
    match leader {
        Some(node) => format!(", current master is {}", node.url()),
        None => ", no master is currently elected".to_string(),
    }
}

fn deleted_message(subject: &str, version: &Option<Version>) -> String {
    match version {
        Some(version) => format!("Subject '{}' version {} was soft deleted", subject, version),
        None => format!("Subject '{}' was soft deleted", subject),
    }
}
