//! Replicated schema store
//!
//! Every node tails the schema log and folds each record into a
//! [`RegistryState`]. Readers see immutable snapshots published through an
//! `ArcSwap`, so reads never take a lock and never observe a half-applied
//! batch. The applied offset is published on a `watch` channel; the write
//! path waits on it for read-your-write.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::SchemaRecord;
use crate::compatibility::CompatibilityMode;
use crate::error::{RegistryError, Result};
use crate::formats;
use crate::graph;
use crate::log::{LogError, LogTransport};
use crate::schema::{NewSchema, Schema, SchemaId, SubjectVersion, Version};
use crate::state::RegistryState;
use crate::version::VersionSpec;

/// Replayed registry state shared by readers and the write path
pub struct ReplicatedStore {
    snapshot: ArcSwap<RegistryState>,
    watermark: watch::Sender<Option<u64>>,
    ready: watch::Sender<bool>,
    /// Log end offset observed when replay started
    cold_start_target: SyncMutex<Option<u64>>,
    poll_lock: Mutex<()>,
    default_compatibility: CompatibilityMode,
}

impl ReplicatedStore {
    pub fn new(default_compatibility: CompatibilityMode) -> Self {
        let (watermark, _) = watch::channel(None);
        let (ready, _) = watch::channel(false);
        Self {
            snapshot: ArcSwap::from_pointee(RegistryState::new()),
            watermark,
            ready,
            cold_start_target: SyncMutex::new(None),
            poll_lock: Mutex::new(()),
            default_compatibility,
        }
    }

    /// The current snapshot, whether or not replay has caught up.
    pub fn snapshot(&self) -> Arc<RegistryState> {
        self.snapshot.load_full()
    }

    /// Highest applied offset
    pub fn watermark(&self) -> Option<u64> {
        *self.watermark.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.watermark.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn default_compatibility(&self) -> CompatibilityMode {
        self.default_compatibility
    }

    /// Read and apply one batch of up to `batch_size` records.
    ///
    /// Returns the number of log entries consumed. Undecodable entries are
    /// skipped but still advance the watermark.
    pub async fn poll(&self, log: &dyn LogTransport, batch_size: usize) -> std::result::Result<usize, LogError> {
        let _guard = self.poll_lock.lock().await;

        let known = *self.cold_start_target.lock();
        let target = match known {
            Some(target) => target,
            None => {
                let end = log.end_offset().await?;
                debug!(end_offset = end, "Captured log end offset for cold start");
                *self.cold_start_target.lock() = Some(end);
                end
            }
        };

        let current = self.snapshot.load_full();
        let start = current.applied_offset().map_or(0, |offset| offset + 1);
        let entries = log.read_from(start, batch_size.max(1)).await?;
        let consumed = entries.len();

        if consumed > 0 {
            let mut next = RegistryState::clone(&current);
            for entry in entries {
                next = match SchemaRecord::decode(&entry.payload, entry.offset) {
                    Ok(record) => next.apply(&record),
                    Err(err) => {
                        warn!(offset = entry.offset, error = %err, "Skipping undecodable schema record");
                        next.skip(entry.offset)
                    }
                };
            }
            let applied = next.applied_offset();
            self.snapshot.store(Arc::new(next));
            self.watermark.send_replace(applied);
            debug!(records = consumed, watermark = ?applied, "Applied schema records");
        }

        if !self.is_ready() {
            let applied_end = self.watermark().map_or(0, |offset| offset + 1);
            if applied_end >= target {
                self.ready.send_replace(true);
                info!(end_offset = target, "Schema store caught up with the log");
            }
        }
        Ok(consumed)
    }

    /// Apply records until the log has nothing more to give.
    pub async fn catch_up(&self, log: &dyn LogTransport, batch_size: usize) -> std::result::Result<usize, LogError> {
        let mut total = 0;
        loop {
            let consumed = self.poll(log, batch_size).await?;
            if consumed == 0 {
                return Ok(total);
            }
            total += consumed;
        }
    }

    /// Wait until the record at `offset` has been applied.
    pub async fn wait_for_offset(&self, offset: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.watermark.subscribe();
        let reached = async move {
            rx.wait_for(|applied| applied.is_some_and(|applied| applied >= offset))
                .await
                .map(|_| ())
        };
        match time::timeout(timeout, reached).await {
            Ok(Ok(_)) => Ok(()),
            // The sender lives as long as the store
            Ok(Err(_)) => Err(RegistryError::StoreNotReady),
            Err(_) => Err(RegistryError::CatchUpTimeout { offset, timeout }),
        }
    }

    /// Wait until cold-start replay has completed.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let ready = async move { rx.wait_for(|ready| *ready).await.map(|_| ()) };
        match time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(RegistryError::StoreNotReady),
        }
    }

    fn ready_snapshot(&self) -> Result<Arc<RegistryState>> {
        if !self.is_ready() {
            return Err(RegistryError::StoreNotReady);
        }
        Ok(self.snapshot.load_full())
    }

    // ===== Reads =====

    pub fn schema_by_id(&self, id: SchemaId) -> Result<Arc<Schema>> {
        self.ready_snapshot()?
            .schema(id)
            .cloned()
            .ok_or(RegistryError::SchemaNotFound { id })
    }

    /// Versions of `subject` in ascending order.
    pub fn versions(&self, subject: &str, include_deleted: bool) -> Result<Vec<Version>> {
        let state = self.ready_snapshot()?;
        let versions: Vec<Version> = state
            .subject(subject)
            .map(|s| {
                s.versions
                    .iter()
                    .filter(|(_, entry)| include_deleted || !entry.deleted)
                    .map(|(version, _)| *version)
                    .collect()
            })
            .unwrap_or_default();
        if versions.is_empty() {
            return Err(subject_not_found(subject));
        }
        Ok(versions)
    }

    pub fn subject_version(&self, subject: &str, spec: VersionSpec, include_deleted: bool) -> Result<SubjectVersion> {
        let state = self.ready_snapshot()?;
        let Some(subject_state) = state.subject(subject) else {
            return Err(subject_not_found(subject));
        };
        let version = match spec {
            VersionSpec::Latest => {
                let latest = if include_deleted {
                    subject_state.versions.keys().next_back().copied()
                } else {
                    subject_state.latest_live().map(|(version, _)| version)
                };
                latest.ok_or_else(|| subject_not_found(subject))?
            }
            VersionSpec::Exact(version) => version,
        };
        match state.subject_version(subject, version) {
            Some(found) if include_deleted || !found.deleted => Ok(found),
            _ => Err(RegistryError::VersionNotFound {
                subject: subject.to_string(),
                version,
            }),
        }
    }

    pub fn latest(&self, subject: &str) -> Result<SubjectVersion> {
        self.subject_version(subject, VersionSpec::Latest, false)
    }

    pub fn list_subjects(&self, include_deleted: bool) -> Result<Vec<String>> {
        let state = self.ready_snapshot()?;
        Ok(state
            .subjects()
            .filter(|(_, s)| if include_deleted { !s.versions.is_empty() } else { s.has_live_versions() })
            .map(|(name, _)| name.to_string())
            .collect())
    }

    /// Effective mode for `subject`, or the global mode when `None`.
    pub fn compatibility(&self, subject: Option<&str>) -> Result<CompatibilityMode> {
        let state = self.ready_snapshot()?;
        Ok(match subject {
            Some(subject) => state.compatibility(subject, self.default_compatibility),
            None => state.global_compatibility().unwrap_or(self.default_compatibility),
        })
    }

    /// The live version of `subject` holding `candidate`, if registered.
    pub fn lookup(&self, subject: &str, candidate: &NewSchema) -> Result<Option<SubjectVersion>> {
        let state = self.ready_snapshot()?;
        if !state.subject(subject).is_some_and(|s| s.has_live_versions()) {
            return Err(subject_not_found(subject));
        }
        let dependencies = graph::resolve(&candidate.references, &*state)?;
        let (schema, _) = formats::prepare(candidate, &dependencies)?;
        Ok(state
            .find_live(subject, &schema.fingerprint)
            .and_then(|(version, _)| state.subject_version(subject, version)))
    }

    /// Subject versions holding schema `id`.
    pub fn subjects_for_id(&self, id: SchemaId, include_deleted: bool) -> Result<Vec<(String, Version)>> {
        let state = self.ready_snapshot()?;
        if state.schema(id).is_none() {
            return Err(RegistryError::SchemaNotFound { id });
        }
        Ok(state.subjects_for_id(id, include_deleted))
    }

    /// Ids of schemas referencing `subject`/`version`.
    pub fn referenced_by(&self, subject: &str, version: Version) -> Result<Vec<SchemaId>> {
        let state = self.ready_snapshot()?;
        if state.subject_version(subject, version).is_none() {
            return Err(RegistryError::VersionNotFound {
                subject: subject.to_string(),
                version,
            });
        }
        Ok(state.referenced_by(subject, version))
    }
}

fn subject_not_found(subject: &str) -> RegistryError {
    RegistryError::SubjectNotFound {
        subject: subject.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct ReaderSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 500,
        }
    }
}

/// Background task tailing the log into a [`ReplicatedStore`]
pub struct SchemaReader {
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SchemaReader {
    pub fn start(store: Arc<ReplicatedStore>, log: Arc<dyn LogTransport>, settings: ReaderSettings) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            batch_size = settings.batch_size,
            "Schema reader started"
        );

        let worker = tokio::spawn(async move {
            let mut ticker = time::interval(settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = store.catch_up(log.as_ref(), settings.batch_size).await {
                            warn!(error = %err, watermark = ?store.watermark(), "Schema log read failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(watermark = ?store.watermark(), "Schema reader stopped");
        });

        Self {
            shutdown: shutdown_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            return;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                debug!(?err, "Schema reader exited with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Operation;
    use crate::log::MemoryLog;
    use crate::schema::SchemaFormat;

    fn register(subject: &str, version: u32, id: u32, text: &str) -> Vec<u8> {
        SchemaRecord::new(
            Operation::Register {
                subject: subject.into(),
                version: Version::new(version),
                id: SchemaId::new(id),
                schema: Schema::new(SchemaFormat::Avro, text, Vec::new()),
            },
            1,
        )
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn test_not_ready_until_cold_start_completes() {
        let log = MemoryLog::new();
        for i in 1..=5 {
            log.append(register("s", i, i, &format!("{{\"type\":\"fixed\",\"name\":\"f\",\"size\":{}}}", i)))
                .await
                .unwrap();
        }
        let store = ReplicatedStore::new(CompatibilityMode::Backward);
        assert!(matches!(store.list_subjects(false), Err(RegistryError::StoreNotReady)));

        assert_eq!(store.poll(&log, 2).await.unwrap(), 2);
        assert!(!store.is_ready());
        assert_eq!(store.catch_up(&log, 2).await.unwrap(), 3);
        assert!(store.is_ready());
        assert_eq!(store.watermark(), Some(4));
        assert_eq!(store.versions("s", false).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_empty_log_is_ready_immediately() {
        let log = MemoryLog::new();
        let store = ReplicatedStore::new(CompatibilityMode::Backward);
        store.catch_up(&log, 10).await.unwrap();
        assert!(store.is_ready());
        assert!(store.list_subjects(true).unwrap().is_empty());
        assert_eq!(store.compatibility(None).unwrap(), CompatibilityMode::Backward);
    }

    #[tokio::test]
    async fn test_garbage_advances_watermark() {
        let log = MemoryLog::new();
        log.append(b"not a record".to_vec()).await.unwrap();
        log.append(register("s", 1, 1, "\"int\"")).await.unwrap();
        let store = ReplicatedStore::new(CompatibilityMode::Backward);
        store.catch_up(&log, 10).await.unwrap();
        assert_eq!(store.watermark(), Some(1));
        assert_eq!(store.latest("s").unwrap().id, SchemaId::new(1));
    }

    #[tokio::test]
    async fn test_reads_and_not_found() {
        let log = MemoryLog::new();
        log.append(register("s", 1, 1, "\"int\"")).await.unwrap();
        log.append(register("s", 2, 2, "\"long\"")).await.unwrap();
        let delete = SchemaRecord::new(
            Operation::DeleteVersion {
                subject: "s".into(),
                version: Version::new(2),
                permanent: false,
            },
            1,
        );
        log.append(delete.encode().unwrap()).await.unwrap();
        let store = ReplicatedStore::new(CompatibilityMode::Backward);
        store.catch_up(&log, 10).await.unwrap();

        assert_eq!(store.latest("s").unwrap().version, Version::new(1));
        assert_eq!(store.versions("s", false).unwrap(), vec![Version::new(1)]);
        assert_eq!(store.versions("s", true).unwrap().len(), 2);
        assert!(matches!(
            store.subject_version("s", VersionSpec::Exact(Version::new(2)), false),
            Err(RegistryError::VersionNotFound { .. })
        ));
        assert!(store.subject_version("s", VersionSpec::Exact(Version::new(2)), true).unwrap().deleted);
        assert!(matches!(store.latest("missing"), Err(RegistryError::SubjectNotFound { .. })));
        assert!(matches!(
            store.schema_by_id(SchemaId::new(9)),
            Err(RegistryError::SchemaNotFound { .. })
        ));
        // Soft-deleted versions keep their schema reachable by id
        assert_eq!(store.schema_by_id(SchemaId::new(2)).unwrap().text, "\"long\"");
        assert!(store.subjects_for_id(SchemaId::new(2), false).unwrap().is_empty());
        assert_eq!(
            store.subjects_for_id(SchemaId::new(2), true).unwrap(),
            vec![("s".to_string(), Version::new(2))]
        );
    }

    #[tokio::test]
    async fn test_lookup_canonicalizes() {
        let log = MemoryLog::new();
        log.append(register("s", 1, 1, "\"int\"")).await.unwrap();
        let stored = formats::prepare(&NewSchema::avro(r#"{"type":"fixed","name":"f","size":4}"#), &[]).unwrap().0;
        log.append(register("t", 1, 2, &stored.text)).await.unwrap();
        let store = ReplicatedStore::new(CompatibilityMode::Backward);
        store.catch_up(&log, 10).await.unwrap();

        let found = store.lookup("t", &NewSchema::avro(r#"{ "name": "f", "size": 4, "type": "fixed" }"#)).unwrap();
        assert_eq!(found.unwrap().version, Version::FIRST);
        assert!(store.lookup("s", &NewSchema::avro("\"long\"")).unwrap().is_none());
        assert!(matches!(
            store.lookup("other", &NewSchema::avro("\"int\"")),
            Err(RegistryError::SubjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_offset() {
        let log = MemoryLog::new();
        let store = ReplicatedStore::new(CompatibilityMode::Backward);
        let err = store.wait_for_offset(0, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RegistryError::CatchUpTimeout { offset: 0, .. }));

        log.append(register("s", 1, 1, "\"int\"")).await.unwrap();
        store.catch_up(&log, 10).await.unwrap();
        store.wait_for_offset(0, Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_background_reader_follows_log() {
        let log: Arc<MemoryLog> = Arc::new(MemoryLog::new());
        let store = Arc::new(ReplicatedStore::new(CompatibilityMode::Backward));
        let reader = SchemaReader::start(
            store.clone(),
            log.clone(),
            ReaderSettings {
                poll_interval: Duration::from_millis(5),
                batch_size: 10,
            },
        );

        let offset = log.append(register("s", 1, 1, "\"int\"")).await.unwrap();
        store.wait_for_offset(offset, Duration::from_secs(2)).await.unwrap();
        assert!(store.is_ready());
        assert_eq!(store.latest("s").unwrap().id, SchemaId::new(1));
        reader.shutdown().await;
    }
}
