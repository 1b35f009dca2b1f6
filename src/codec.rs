//! Log record codec
//!
//! Frame layout:
//! - Magic (2 bytes): `SR`
//! - Codec version (u8)
//! - Checksum (u32 LE): CRC32 of the body
//! - Body: JSON object tagged by `op`
//!
//! Decoding is lenient in the body: unknown fields are ignored and unknown
//! operations decode to [`Operation::Unknown`], so older readers skip what
//! newer writers add. The frame itself is strict.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::compatibility::CompatibilityMode;
use crate::schema::{Schema, SchemaId, Version};

pub const MAGIC: [u8; 2] = *b"SR";
pub const CODEC_VERSION: u8 = 1;
const HEADER_LEN: usize = 7;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("record too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic bytes {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("checksum mismatch: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("malformed record body: {0}")]
    Body(String),
}

/// A state change carried by one log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Register {
        subject: String,
        version: Version,
        id: SchemaId,
        schema: Schema,
    },
    DeleteVersion {
        subject: String,
        version: Version,
        #[serde(default)]
        permanent: bool,
    },
    /// Deletes every version up to `up_to`, all versions when absent
    DeleteSubject {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        up_to: Option<Version>,
        #[serde(default)]
        permanent: bool,
    },
    /// `subject: None` targets the global setting, `compatibility: None` clears
    ConfigUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default)]
        compatibility: Option<CompatibilityMode>,
    },
    /// Leadership fence, appended by a new leader before its first write
    Noop { node: String },
    /// An operation this codec version does not know
    #[serde(other)]
    Unknown,
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Register { .. } => "register",
            Operation::DeleteVersion { .. } => "delete_version",
            Operation::DeleteSubject { .. } => "delete_subject",
            Operation::ConfigUpdate { .. } => "config_update",
            Operation::Noop { .. } => "noop",
            Operation::Unknown => "unknown",
        }
    }

    pub fn subject(&self) -> Option<&str> {
        match self {
            Operation::Register { subject, .. }
            | Operation::DeleteVersion { subject, .. }
            | Operation::DeleteSubject { subject, .. } => Some(subject),
            Operation::ConfigUpdate { subject, .. } => subject.as_deref(),
            Operation::Noop { .. } | Operation::Unknown => None,
        }
    }
}

/// One decoded log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    /// Fencing generation of the writer
    pub generation: u64,
    #[serde(flatten)]
    pub operation: Operation,
    /// Assigned by the log on read; never encoded
    #[serde(skip)]
    pub offset: u64,
}

impl SchemaRecord {
    pub fn new(operation: Operation, generation: u64) -> Self {
        Self {
            generation,
            operation,
            offset: 0,
        }
    }

    /// Encode into a checksummed frame
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = serde_json::to_vec(self).map_err(|e| CodecError::Body(e.to_string()))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend_from_slice(&MAGIC);
        buf.push(CODEC_VERSION);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a frame read at `offset`
    pub fn decode(bytes: &[u8], offset: u64) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Truncated(bytes.len()));
        }
        let magic = [bytes[0], bytes[1]];
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = bytes[2];
        if version > CODEC_VERSION {
            debug!(offset, version, "Decoding record from a newer codec version");
        }
        let stored = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);
        let body = &bytes[HEADER_LEN..];
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(CodecError::ChecksumMismatch { stored, computed });
        }

        let mut record: SchemaRecord =
            serde_json::from_slice(body).map_err(|e| CodecError::Body(e.to_string()))?;
        record.offset = offset;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaFormat;

    fn register() -> SchemaRecord {
        SchemaRecord::new(
            Operation::Register {
                subject: "orders-value".into(),
                version: Version::FIRST,
                id: SchemaId::new(1),
                schema: Schema::new(SchemaFormat::Avro, "\"string\"", Vec::new()),
            },
            3,
        )
    }

    #[test]
    fn test_frame_layout() {
        let bytes = register().encode().unwrap();
        assert_eq!(&bytes[..2], b"SR");
        assert_eq!(bytes[2], CODEC_VERSION);
        let body: serde_json::Value = serde_json::from_slice(&bytes[HEADER_LEN..]).unwrap();
        assert_eq!(body["op"], "REGISTER");
        assert_eq!(body["generation"], 3);
        assert!(body.get("offset").is_none());
    }

    #[test]
    fn test_decode_assigns_offset() {
        let decoded = SchemaRecord::decode(&register().encode().unwrap(), 42).unwrap();
        assert_eq!(decoded.offset, 42);
        assert_eq!(decoded.operation, register().operation);
        assert_eq!(decoded.operation.subject(), Some("orders-value"));
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = register().encode().unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xff;
        assert!(matches!(
            SchemaRecord::decode(&bytes, 0),
            Err(CodecError::ChecksumMismatch { .. })
        ));
        assert!(matches!(SchemaRecord::decode(b"XX\x01\0\0\0\0{}", 0), Err(CodecError::BadMagic(_))));
        assert!(matches!(SchemaRecord::decode(b"SR", 0), Err(CodecError::Truncated(2))));
    }

    #[test]
    fn test_unknown_operation_and_fields_are_tolerated() {
        let body = br#"{"generation":9,"op":"REKEY","key":"abc"}"#;
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.push(CODEC_VERSION + 1);
        frame.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
        frame.extend_from_slice(body);
        let record = SchemaRecord::decode(&frame, 7).unwrap();
        assert_eq!(record.operation, Operation::Unknown);
        assert_eq!(record.generation, 9);

        let body = br#"{"generation":1,"op":"NOOP","node":"sr-1","priority":5}"#;
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC);
        frame.push(CODEC_VERSION);
        frame.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
        frame.extend_from_slice(body);
        let record = SchemaRecord::decode(&frame, 0).unwrap();
        assert_eq!(record.operation, Operation::Noop { node: "sr-1".into() });
    }

    #[test]
    fn test_config_clear_round_trips() {
        let record = SchemaRecord::new(
            Operation::ConfigUpdate {
                subject: Some("orders-value".into()),
                compatibility: None,
            },
            1,
        );
        let decoded = SchemaRecord::decode(&record.encode().unwrap(), 0).unwrap();
        assert_eq!(decoded, record);
    }
}
