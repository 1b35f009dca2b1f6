//! schemalog
//!
//! The core of a log-replicated schema registry: Avro, JSON Schema and
//! Protobuf schemas versioned under subjects, with compatibility checks
//! gating every write.
//!
//! ## Features
//!
//! - **Log as source of truth**: every change is a record in an ordered log;
//!   each node replays it into the same state
//! - **Single writer**: leadership comes from group membership, and fencing
//!   generations keep a deposed writer's appends out of the state
//! - **Content addressing**: SHA-256 fingerprints of canonical text give
//!   identical schemas the same id across subjects
//! - **Compatibility checking**: per-format evolution rules under seven modes
//! - **References**: schemas may import other registered versions
//!
//! ## Architecture
//!
//! ```text
//! register ─► Registrar ─► LeaderGate ─► LogTransport (append)
//!                │                              │
//!                │ check                        ▼
//!                ├─► CompatibilityChecker   SchemaReader (tail)
//!                │                              │ apply
//!                └── wait for watermark ◄── ReplicatedStore ◄── reads
//! ```

pub mod codec;
pub mod compatibility;
pub mod config;
pub mod coordination;
pub mod error;
pub mod fingerprint;
pub mod formats;
pub mod graph;
pub mod log;
pub mod registrar;
pub mod schema;
pub mod state;
pub mod store;
pub mod version;

pub use codec::{Operation, SchemaRecord};
pub use compatibility::{ChangeType, CompatibilityChecker, CompatibilityMode, CompatibilityResult, SchemaChange};
pub use config::RegistryConfig;
pub use coordination::{ElectionStrategy, FencingToken, GroupCoordinator, LeaderGate, LeadershipProvider, NodeIdentity};
pub use error::{RegistryError, Result};
pub use fingerprint::Fingerprint;
pub use log::{LogTransport, MemoryLog};
pub use registrar::{Registered, Registrar, RegistrationOutcome};
pub use schema::{NewSchema, Schema, SchemaFormat, SchemaId, SchemaReference, SubjectVersion, Version};
pub use state::RegistryState;
pub use store::{ReaderSettings, ReplicatedStore, SchemaReader};
pub use version::VersionSpec;
