//! Replayed registry state
//!
//! [`RegistryState`] is a pure function of the log prefix applied to it:
//! [`RegistryState::apply`] folds one record in, touches nothing outside the
//! state, and never fails. Records that cannot be applied (stale writers,
//! conflicting ids, unknown operations) are skipped the same way on every
//! node, so all replicas converge on the same state for the same offset.
//!
//! The large indexes sit behind `Arc` so publishing a snapshot per batch only
//! copies the maps a batch actually touches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::{Operation, SchemaRecord};
use crate::compatibility::CompatibilityMode;
use crate::fingerprint::Fingerprint;
use crate::graph::ReferenceLookup;
use crate::schema::{Schema, SchemaId, SubjectVersion, Version};

/// Recently rejected offsets kept for writers waiting on them
const REJECTED_WINDOW: usize = 1024;

/// Why a decoded record left the state unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// Written under a generation older than one already applied
    Fenced,
    /// Assigned an id or version that the state had already given out
    Conflict,
}

/// One version slot of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VersionEntry {
    pub id: SchemaId,
    pub deleted: bool,
}

/// Versions and settings of one subject
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SubjectState {
    pub versions: BTreeMap<Version, VersionEntry>,
    /// Highest version ever assigned, kept across permanent deletes
    pub max_version: Option<Version>,
    pub compatibility: Option<CompatibilityMode>,
}

impl SubjectState {
    pub fn live_versions(&self) -> impl Iterator<Item = (Version, SchemaId)> + '_ {
        self.versions
            .iter()
            .filter(|(_, entry)| !entry.deleted)
            .map(|(version, entry)| (*version, entry.id))
    }

    pub fn latest_live(&self) -> Option<(Version, SchemaId)> {
        self.live_versions().last()
    }

    pub fn has_live_versions(&self) -> bool {
        self.versions.values().any(|entry| !entry.deleted)
    }

    pub fn next_version(&self) -> Version {
        self.max_version.map_or(Version::FIRST, Version::next)
    }
}

/// The whole registry as of `applied_offset`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RegistryState {
    subjects: Arc<BTreeMap<String, SubjectState>>,
    schemas: Arc<BTreeMap<SchemaId, Arc<Schema>>>,
    fingerprints: Arc<BTreeMap<Fingerprint, SchemaId>>,
    /// Global mode set through the log; the configured default applies when unset
    global_compatibility: Option<CompatibilityMode>,
    max_schema_id: Option<SchemaId>,
    /// Highest writer generation observed
    generation: u64,
    /// Referenced subject -> version -> schemas referencing it
    referenced_by: Arc<BTreeMap<String, BTreeMap<Version, BTreeSet<SchemaId>>>>,
    /// Latest rejected offsets, at most `REJECTED_WINDOW` of them
    rejected: BTreeMap<u64, Rejection>,
    applied_offset: Option<u64>,
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record into the state.
    pub fn apply(mut self, record: &SchemaRecord) -> Self {
        self.applied_offset = Some(record.offset);

        if record.generation < self.generation {
            warn!(
                offset = record.offset,
                generation = record.generation,
                current = self.generation,
                op = record.operation.kind(),
                "Ignoring record from a fenced writer"
            );
            self.reject(record.offset, Rejection::Fenced);
            return self;
        }
        self.generation = record.generation;

        match &record.operation {
            Operation::Register {
                subject,
                version,
                id,
                schema,
            } => {
                if !self.register(record.offset, subject, *version, *id, schema) {
                    self.reject(record.offset, Rejection::Conflict);
                }
            }
            Operation::DeleteVersion {
                subject,
                version,
                permanent,
            } => self.delete_version(subject, *version, *permanent),
            Operation::DeleteSubject {
                subject,
                up_to,
                permanent,
            } => {
                let versions: Vec<Version> = match self.subjects.get(subject.as_str()) {
                    Some(state) => state
                        .versions
                        .keys()
                        .copied()
                        .filter(|v| up_to.map_or(true, |limit| *v <= limit))
                        .collect(),
                    None => Vec::new(),
                };
                for version in versions {
                    self.delete_version(subject, version, *permanent);
                }
            }
            Operation::ConfigUpdate { subject, compatibility } => match subject {
                Some(subject) => {
                    Arc::make_mut(&mut self.subjects)
                        .entry(subject.clone())
                        .or_default()
                        .compatibility = *compatibility;
                }
                None => self.global_compatibility = *compatibility,
            },
            Operation::Noop { node } => {
                debug!(offset = record.offset, node = %node, generation = record.generation, "Applied leadership fence");
            }
            Operation::Unknown => {
                debug!(offset = record.offset, "Skipping record with an unknown operation");
            }
        }
        self
    }

    /// Advance past a record that could not be decoded.
    pub fn skip(mut self, offset: u64) -> Self {
        self.applied_offset = Some(offset);
        self
    }

    fn reject(&mut self, offset: u64, reason: Rejection) {
        self.rejected.insert(offset, reason);
        while self.rejected.len() > REJECTED_WINDOW {
            self.rejected.pop_first();
        }
    }

    /// Returns false when the record conflicts with what is already applied.
    fn register(&mut self, offset: u64, subject: &str, version: Version, id: SchemaId, schema: &Schema) -> bool {
        if let Some(existing) = self.schemas.get(&id) {
            if existing.fingerprint != schema.fingerprint {
                warn!(offset, %id, subject, "Ignoring registration reusing an id for different content");
                return false;
            }
        }
        if let Some(state) = self.subjects.get(subject) {
            if let Some(entry) = state.versions.get(&version) {
                if entry.id != id {
                    warn!(offset, subject, %version, "Ignoring registration of an already used version");
                    return false;
                }
                return true;
            }
            if state.max_version.is_some_and(|max| version <= max) {
                warn!(offset, subject, %version, "Ignoring registration of a retired version");
                return false;
            }
        }

        let state = Arc::make_mut(&mut self.subjects).entry(subject.to_string()).or_default();
        state.versions.insert(version, VersionEntry { id, deleted: false });
        state.max_version = Some(version);
        self.max_schema_id = self.max_schema_id.max(Some(id));
        if !self.fingerprints.contains_key(&schema.fingerprint) {
            Arc::make_mut(&mut self.fingerprints).insert(schema.fingerprint.clone(), id);
        }
        if !self.schemas.contains_key(&id) {
            if !schema.references.is_empty() {
                let index = Arc::make_mut(&mut self.referenced_by);
                for reference in &schema.references {
                    index
                        .entry(reference.subject.clone())
                        .or_default()
                        .entry(reference.version)
                        .or_default()
                        .insert(id);
                }
            }
            Arc::make_mut(&mut self.schemas).insert(id, Arc::new(schema.clone()));
        }
        true
    }

    fn delete_version(&mut self, subject: &str, version: Version, permanent: bool) {
        if !self.subjects.get(subject).is_some_and(|s| s.versions.contains_key(&version)) {
            debug!(subject, %version, "Delete for an unknown subject version");
            return;
        }
        let Some(state) = Arc::make_mut(&mut self.subjects).get_mut(subject) else {
            return;
        };
        if permanent {
            let Some(entry) = state.versions.remove(&version) else {
                return;
            };
            let still_used = self
                .subjects
                .values()
                .any(|s| s.versions.values().any(|e| e.id == entry.id));
            if !still_used {
                self.release_references(entry.id);
            }
        } else if let Some(entry) = state.versions.get_mut(&version) {
            entry.deleted = true;
        }
    }

    /// Drop `id` from the reverse reference index once no version holds it.
    fn release_references(&mut self, id: SchemaId) {
        let Some(schema) = self.schemas.get(&id) else {
            return;
        };
        if schema.references.is_empty() {
            return;
        }
        let index = Arc::make_mut(&mut self.referenced_by);
        for reference in &schema.references {
            if let Some(versions) = index.get_mut(&reference.subject) {
                if let Some(ids) = versions.get_mut(&reference.version) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        versions.remove(&reference.version);
                    }
                }
                if versions.is_empty() {
                    index.remove(&reference.subject);
                }
            }
        }
    }

    // ===== Reads =====

    pub fn applied_offset(&self) -> Option<u64> {
        self.applied_offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Why the record at `offset` was skipped, if it was rejected recently.
    pub fn rejection(&self, offset: u64) -> Option<Rejection> {
        self.rejected.get(&offset).copied()
    }

    pub fn schema(&self, id: SchemaId) -> Option<&Arc<Schema>> {
        self.schemas.get(&id)
    }

    pub fn subject(&self, subject: &str) -> Option<&SubjectState> {
        self.subjects.get(subject)
    }

    pub fn subjects(&self) -> impl Iterator<Item = (&str, &SubjectState)> {
        self.subjects.iter().map(|(name, state)| (name.as_str(), state))
    }

    pub fn id_for_fingerprint(&self, fingerprint: &Fingerprint) -> Option<SchemaId> {
        self.fingerprints.get(fingerprint).copied()
    }

    pub fn max_schema_id(&self) -> Option<SchemaId> {
        self.max_schema_id
    }

    /// Id the next new schema gets
    pub fn next_schema_id(&self) -> SchemaId {
        self.max_schema_id.map_or(SchemaId::new(1), SchemaId::next)
    }

    pub fn next_version(&self, subject: &str) -> Version {
        self.subjects
            .get(subject)
            .map_or(Version::FIRST, SubjectState::next_version)
    }

    pub fn global_compatibility(&self) -> Option<CompatibilityMode> {
        self.global_compatibility
    }

    /// Subject setting, else global setting, else `default`.
    pub fn compatibility(&self, subject: &str, default: CompatibilityMode) -> CompatibilityMode {
        self.subjects
            .get(subject)
            .and_then(|s| s.compatibility)
            .or(self.global_compatibility)
            .unwrap_or(default)
    }

    pub fn subject_version(&self, subject: &str, version: Version) -> Option<SubjectVersion> {
        let entry = self.subjects.get(subject)?.versions.get(&version)?;
        let schema = self.schemas.get(&entry.id)?;
        Some(SubjectVersion {
            subject: subject.to_string(),
            version,
            id: entry.id,
            schema: schema.clone(),
            deleted: entry.deleted,
        })
    }

    /// Live version of `subject` whose schema has `fingerprint`.
    pub fn find_live(&self, subject: &str, fingerprint: &Fingerprint) -> Option<(Version, SchemaId)> {
        let id = self.id_for_fingerprint(fingerprint)?;
        self.subjects
            .get(subject)?
            .live_versions()
            .find(|(_, version_id)| *version_id == id)
    }

    /// Subject versions holding schema `id`.
    pub fn subjects_for_id(&self, id: SchemaId, include_deleted: bool) -> Vec<(String, Version)> {
        self.subjects
            .iter()
            .flat_map(|(name, state)| {
                state
                    .versions
                    .iter()
                    .filter(move |(_, entry)| entry.id == id && (include_deleted || !entry.deleted))
                    .map(move |(version, _)| (name.clone(), *version))
            })
            .collect()
    }

    /// Schemas referencing `subject`/`version`.
    pub fn referenced_by(&self, subject: &str, version: Version) -> Vec<SchemaId> {
        self.referenced_by
            .get(subject)
            .and_then(|versions| versions.get(&version))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl ReferenceLookup for RegistryState {
    fn lookup_version(&self, subject: &str, version: Version) -> Option<(SchemaId, Arc<Schema>, bool)> {
        let entry = self.subjects.get(subject)?.versions.get(&version)?;
        let schema = self.schemas.get(&entry.id)?;
        Some((entry.id, schema.clone(), entry.deleted))
    }
}
