//! Write path
//!
//! The [`Registrar`] turns client writes into log records. Writes on one node
//! are serialized; each one validates against the current snapshot, appends
//! through the [`LeaderGate`] and then waits until the local store has
//! applied its own record, so a successful write is visible to the next read
//! on this node.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{Operation, SchemaRecord};
use crate::compatibility::{previous_for_mode, CompatibilityChecker, CompatibilityMode, CompatibilityResult};
use crate::config::RegistryConfig;
use crate::coordination::{FencingToken, GroupCoordinator, LeaderGate};
use crate::error::{RegistryError, Result};
use crate::formats::{self, ParsedSchema};
use crate::graph;
use crate::log::LogTransport;
use crate::schema::{validate_subject, NewSchema, SchemaId, Version};
use crate::state::{Rejection, RegistryState};
use crate::store::{ReplicatedStore, SchemaReader};
use crate::version::VersionSpec;

/// Whether a registration created a new version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Created,
    /// The subject already had a live version with the same content
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Registered {
    pub id: SchemaId,
    pub version: Version,
    pub outcome: RegistrationOutcome,
}

/// Per-node writer bookkeeping, guarded by the write lock
#[derive(Debug, Default)]
struct WriterState {
    /// Generation whose fence record this node has already applied
    fenced_generation: Option<u64>,
    /// Highest offset this node appended, applied or not
    last_appended: Option<u64>,
}

pub struct Registrar {
    gate: LeaderGate,
    store: Arc<ReplicatedStore>,
    log: Arc<dyn LogTransport>,
    checker: CompatibilityChecker,
    timeout: Duration,
    writer: Mutex<WriterState>,
}

impl Registrar {
    pub fn new(gate: LeaderGate, store: Arc<ReplicatedStore>, log: Arc<dyn LogTransport>) -> Self {
        Self {
            gate,
            store,
            log,
            checker: CompatibilityChecker::new(),
            timeout: Duration::from_secs(5),
            writer: Mutex::new(WriterState::default()),
        }
    }

    /// Start replaying `log` as the configured node, then join `group`.
    ///
    /// Returns once the local store has caught up with the log, along with
    /// the reader that keeps it current.
    pub async fn from_config(
        config: &RegistryConfig,
        group: Arc<GroupCoordinator>,
        log: Arc<dyn LogTransport>,
    ) -> Result<(Self, SchemaReader)> {
        let store = Arc::new(ReplicatedStore::new(config.registry.default_compatibility));
        let reader = SchemaReader::start(store.clone(), log.clone(), config.reader_settings());
        if let Err(err) = store.wait_for_ready(config.catch_up_timeout()).await {
            reader.shutdown().await;
            return Err(err);
        }

        let identity = config.node_identity();
        let generation = group.join(identity.clone(), config.node.master_eligibility);
        info!(
            node = %identity.url(),
            topic = %config.registry.topic,
            generation,
            master_eligible = config.node.master_eligibility,
            "Registry node joined"
        );

        let gate = LeaderGate::new(identity, group);
        let registrar = Self::new(gate, store, log)
            .with_checker(config.checker())
            .with_timeout(config.catch_up_timeout());
        Ok((registrar, reader))
    }

    pub fn with_checker(mut self, checker: CompatibilityChecker) -> Self {
        self.checker = checker;
        self
    }

    /// Bound on the append and, separately, on the wait for it to apply
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    pub fn gate(&self) -> &LeaderGate {
        &self.gate
    }

    /// Register `candidate` under `subject`.
    ///
    /// Re-registering content the subject already holds as a live version
    /// returns that version without writing. Content registered under
    /// another subject keeps its id.
    pub async fn register(&self, subject: &str, candidate: NewSchema) -> Result<Registered> {
        validate_subject(subject).map_err(RegistryError::Validation)?;
        let token = self.gate.acquire()?;
        let mut writer = self.writer.lock().await;
        self.fence(&mut writer, &token).await?;

        let state = self.store.snapshot();
        let dependencies = graph::resolve(&candidate.references, &*state)?;
        let (schema, parsed) = formats::prepare(&candidate, &dependencies)?;

        if let Some((version, id)) = state.find_live(subject, &schema.fingerprint) {
            debug!(subject, %id, %version, "Schema already registered under subject");
            return Ok(Registered {
                id,
                version,
                outcome: RegistrationOutcome::Existing,
            });
        }

        let mode = state.compatibility(subject, self.store.default_compatibility());
        let live: Vec<(Version, SchemaId)> = state
            .subject(subject)
            .map(|s| s.live_versions().collect())
            .unwrap_or_default();
        let result = self.check_against(&state, &parsed, previous_for_mode(mode, &live), mode)?;
        if !result.is_compatible {
            info!(subject, %mode, reason = %result.summary, "Rejected incompatible schema");
            return Err(RegistryError::IncompatibleSchema {
                subject: subject.to_string(),
                result,
            });
        }

        let id = state
            .id_for_fingerprint(&schema.fingerprint)
            .unwrap_or_else(|| state.next_schema_id());
        let version = state.next_version(subject);
        let offset = self
            .append(
                &mut writer,
                &token,
                Operation::Register {
                    subject: subject.to_string(),
                    version,
                    id,
                    schema,
                },
            )
            .await?;

        info!(subject, %id, %version, offset, "Registered schema");
        Ok(Registered {
            id,
            version,
            outcome: RegistrationOutcome::Created,
        })
    }

    /// Check `candidate` without registering it. Works on any node.
    ///
    /// `Latest` checks against the versions the subject's mode selects,
    /// an exact version against that version alone.
    pub fn check_compatibility(
        &self,
        subject: &str,
        candidate: &NewSchema,
        against: VersionSpec,
    ) -> Result<CompatibilityResult> {
        if !self.store.is_ready() {
            return Err(RegistryError::StoreNotReady);
        }
        let state = self.store.snapshot();
        let dependencies = graph::resolve(&candidate.references, &*state)?;
        let (_, parsed) = formats::prepare(candidate, &dependencies)?;
        let mode = state.compatibility(subject, self.store.default_compatibility());

        let live: Vec<(Version, SchemaId)> = state
            .subject(subject)
            .map(|s| s.live_versions().collect())
            .unwrap_or_default();
        if live.is_empty() {
            return Err(subject_not_found(subject));
        }
        let selected: Vec<(Version, SchemaId)> = match against {
            VersionSpec::Latest => previous_for_mode(mode, &live).to_vec(),
            VersionSpec::Exact(version) => match live.iter().find(|(v, _)| *v == version) {
                Some(found) => vec![*found],
                None => {
                    return Err(RegistryError::VersionNotFound {
                        subject: subject.to_string(),
                        version,
                    })
                }
            },
        };
        self.check_against(&state, &parsed, &selected, mode)
    }

    /// Delete one version. A permanent delete needs a prior soft delete.
    pub async fn delete_version(&self, subject: &str, version: VersionSpec, permanent: bool) -> Result<Version> {
        let token = self.gate.acquire()?;
        let mut writer = self.writer.lock().await;
        self.fence(&mut writer, &token).await?;

        let state = self.store.snapshot();
        let Some(subject_state) = state.subject(subject).filter(|s| !s.versions.is_empty()) else {
            return Err(subject_not_found(subject));
        };
        let version = match version {
            VersionSpec::Exact(version) => version,
            VersionSpec::Latest if permanent => match subject_state.versions.keys().next_back() {
                Some(version) => *version,
                None => return Err(subject_not_found(subject)),
            },
            VersionSpec::Latest => match subject_state.latest_live() {
                Some((version, _)) => version,
                None => {
                    return Err(RegistryError::DeletedEntity {
                        subject: subject.to_string(),
                        version: None,
                    })
                }
            },
        };
        let Some(entry) = subject_state.versions.get(&version) else {
            return Err(RegistryError::VersionNotFound {
                subject: subject.to_string(),
                version,
            });
        };
        match (permanent, entry.deleted) {
            (true, false) => {
                return Err(RegistryError::VersionNotSoftDeleted {
                    subject: subject.to_string(),
                    version,
                })
            }
            (false, true) => {
                return Err(RegistryError::DeletedEntity {
                    subject: subject.to_string(),
                    version: Some(version),
                })
            }
            _ => {}
        }
        ensure_unreferenced(&state, subject, version)?;

        let offset = self
            .append(
                &mut writer,
                &token,
                Operation::DeleteVersion {
                    subject: subject.to_string(),
                    version,
                    permanent,
                },
            )
            .await?;
        info!(subject, %version, permanent, offset, "Deleted schema version");
        Ok(version)
    }

    /// Delete every version of `subject`, returning the versions affected.
    pub async fn delete_subject(&self, subject: &str, permanent: bool) -> Result<Vec<Version>> {
        let token = self.gate.acquire()?;
        let mut writer = self.writer.lock().await;
        self.fence(&mut writer, &token).await?;

        let state = self.store.snapshot();
        let Some(subject_state) = state.subject(subject).filter(|s| !s.versions.is_empty()) else {
            return Err(subject_not_found(subject));
        };
        let live: Vec<Version> = subject_state.live_versions().map(|(v, _)| v).collect();
        let targets: Vec<Version> = if permanent {
            if let Some(first_live) = live.first() {
                return Err(RegistryError::VersionNotSoftDeleted {
                    subject: subject.to_string(),
                    version: *first_live,
                });
            }
            subject_state.versions.keys().copied().collect()
        } else {
            if live.is_empty() {
                return Err(RegistryError::DeletedEntity {
                    subject: subject.to_string(),
                    version: None,
                });
            }
            live
        };
        for version in &targets {
            ensure_unreferenced(&state, subject, *version)?;
        }

        let offset = self
            .append(
                &mut writer,
                &token,
                Operation::DeleteSubject {
                    subject: subject.to_string(),
                    up_to: targets.last().copied(),
                    permanent,
                },
            )
            .await?;
        info!(subject, versions = targets.len(), permanent, offset, "Deleted subject");
        Ok(targets)
    }

    /// Set the mode of `subject`, or the global mode when `None`.
    pub async fn set_compatibility(&self, subject: Option<&str>, mode: CompatibilityMode) -> Result<()> {
        self.write_config(subject, Some(mode)).await
    }

    /// Drop the subject's own mode so it falls back to the global one.
    pub async fn clear_compatibility(&self, subject: &str) -> Result<()> {
        self.write_config(Some(subject), None).await
    }

    async fn write_config(&self, subject: Option<&str>, compatibility: Option<CompatibilityMode>) -> Result<()> {
        if let Some(subject) = subject {
            validate_subject(subject).map_err(RegistryError::Validation)?;
        }
        let token = self.gate.acquire()?;
        let mut writer = self.writer.lock().await;
        self.fence(&mut writer, &token).await?;

        let offset = self
            .append(
                &mut writer,
                &token,
                Operation::ConfigUpdate {
                    subject: subject.map(str::to_string),
                    compatibility,
                },
            )
            .await?;
        info!(subject = subject.unwrap_or("<global>"), mode = ?compatibility, offset, "Updated compatibility");
        Ok(())
    }

    fn check_against(
        &self,
        state: &RegistryState,
        candidate: &ParsedSchema,
        selected: &[(Version, SchemaId)],
        mode: CompatibilityMode,
    ) -> Result<CompatibilityResult> {
        let mut parsed = Vec::with_capacity(selected.len());
        for (version, id) in selected {
            let schema = state.schema(*id).ok_or(RegistryError::SchemaNotFound { id: *id })?;
            let dependencies = graph::resolve(&schema.references, state)?;
            parsed.push((*version, formats::parse(schema, &dependencies)?));
        }
        let previous: Vec<(Version, &ParsedSchema)> = parsed.iter().map(|(v, p)| (*v, p)).collect();
        Ok(self.checker.check(candidate, &previous, mode))
    }

    /// Make sure every record this node or an earlier generation appended is
    /// applied locally before the next write reads the snapshot.
    ///
    /// A write that timed out or was cancelled while waiting leaves its record
    /// behind in `last_appended`; the next write waits for it first. The first
    /// write under a new token appends a fence record and waits for it, since
    /// everything before the fence comes from previous owners.
    async fn fence(&self, writer: &mut WriterState, token: &FencingToken) -> Result<()> {
        if !self.store.is_ready() {
            return Err(RegistryError::StoreNotReady);
        }
        if let Some(offset) = writer.last_appended {
            self.store.wait_for_offset(offset, self.timeout).await?;
        }
        if writer.fenced_generation == Some(token.generation) {
            return Ok(());
        }
        let offset = self
            .append(
                writer,
                token,
                Operation::Noop {
                    node: token.node_id.clone(),
                },
            )
            .await?;
        writer.fenced_generation = Some(token.generation);
        info!(generation = token.generation, offset, "Writer fenced previous generations");
        Ok(())
    }

    /// Append through the gate and wait until the record is applied.
    async fn append(&self, writer: &mut WriterState, token: &FencingToken, operation: Operation) -> Result<u64> {
        let payload = SchemaRecord::new(operation, token.generation).encode()?;
        let offset = self
            .gate
            .fenced_append(token, self.log.as_ref(), payload, self.timeout)
            .await?;
        writer.last_appended = Some(offset);
        self.store.wait_for_offset(offset, self.timeout).await?;
        match self.store.snapshot().rejection(offset) {
            None => Ok(offset),
            Some(Rejection::Fenced) => Err(RegistryError::NotMaster {
                leader: self.gate.leader(),
            }),
            Some(Rejection::Conflict) => {
                warn!(offset, "Own record was rejected on replay");
                Err(RegistryError::WriteConflict { offset })
            }
        }
    }
}

fn ensure_unreferenced(state: &RegistryState, subject: &str, version: Version) -> Result<()> {
    let referenced_by = state.referenced_by(subject, version);
    if referenced_by.is_empty() {
        Ok(())
    } else {
        Err(RegistryError::ReferenceExists {
            subject: subject.to_string(),
            version,
            referenced_by,
        })
    }
}

fn subject_not_found(subject: &str) -> RegistryError {
    RegistryError::SubjectNotFound {
        subject: subject.to_string(),
    }
}
