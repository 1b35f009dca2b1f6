//! Log transport
//!
//! The registry's durable state lives in an ordered, append-only log outside
//! the process. Only three capabilities are needed from it, captured by
//! [`LogTransport`]. [`MemoryLog`] is the in-process implementation used for
//! embedded single-node setups and tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("log unavailable: {0}")]
    Unavailable(String),

    #[error("append timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("offset {requested} is past the end of the log ({end})")]
    OffsetOutOfRange { requested: u64, end: u64 },
}

/// One entry as read back from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Ordered, durable log with offsets assigned on append
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Append `payload` durably, returning its offset.
    async fn append(&self, payload: Vec<u8>) -> Result<u64, LogError>;

    /// Up to `max` entries starting at `offset`, in order.
    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<LogEntry>, LogError>;

    /// Offset the next appended entry will get.
    async fn end_offset(&self) -> Result<u64, LogError>;
}

/// In-memory log
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: every call fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(LogError::Unavailable("memory log is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn append(&self, payload: Vec<u8>) -> Result<u64, LogError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.push(payload);
        Ok(entries.len() as u64 - 1)
    }

    async fn read_from(&self, offset: u64, max: usize) -> Result<Vec<LogEntry>, LogError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        let end = entries.len() as u64;
        if offset > end {
            return Err(LogError::OffsetOutOfRange { requested: offset, end });
        }
        Ok(entries
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(max)
            .map(|(i, payload)| LogEntry {
                offset: i as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn end_offset(&self) -> Result<u64, LogError> {
        self.check_available()?;
        Ok(self.entries.lock().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offsets_are_sequential() {
        let log = MemoryLog::new();
        assert_eq!(log.append(b"a".to_vec()).await.unwrap(), 0);
        assert_eq!(log.append(b"b".to_vec()).await.unwrap(), 1);
        assert_eq!(log.end_offset().await.unwrap(), 2);

        let entries = log.read_from(1, 10).await.unwrap();
        assert_eq!(entries, vec![LogEntry { offset: 1, payload: b"b".to_vec() }]);
        assert!(log.read_from(2, 10).await.unwrap().is_empty());
        assert!(log.read_from(3, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_outage() {
        let log = MemoryLog::new();
        log.set_available(false);
        assert!(matches!(log.append(Vec::new()).await, Err(LogError::Unavailable(_))));
        log.set_available(true);
        assert_eq!(log.append(Vec::new()).await.unwrap(), 0);
    }
}
