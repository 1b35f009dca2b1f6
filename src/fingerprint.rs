//! Content fingerprints used for schema deduplication

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema::{SchemaFormat, SchemaReference};

/// SHA256 fingerprint of a canonicalized schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of canonical schema content.
    ///
    /// The format tag and the ordered references take part in the hash, so the
    /// same text under two formats, or with different references, never dedups.
    pub fn of(format: SchemaFormat, canonical: &str, references: &[SchemaReference]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());
        for reference in references {
            hasher.update([0u8]);
            hasher.update(reference.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(reference.subject.as_bytes());
            hasher.update([0u8]);
            hasher.update(reference.version.get().to_be_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Version;

    #[test]
    fn test_fingerprint_consistency() {
        let text = r#"{"type":"string"}"#;
        let a = Fingerprint::of(SchemaFormat::Avro, text, &[]);
        let b = Fingerprint::of(SchemaFormat::Avro, text, &[]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_format_participates() {
        let text = r#"{"type":"string"}"#;
        let avro = Fingerprint::of(SchemaFormat::Avro, text, &[]);
        let json = Fingerprint::of(SchemaFormat::Json, text, &[]);
        assert_ne!(avro, json);
    }

    #[test]
    fn test_references_participate() {
        let text = r#"{"type":"record","name":"A","fields":[]}"#;
        let reference = SchemaReference::new("B", "b-value", Version::new(1));
        let plain = Fingerprint::of(SchemaFormat::Avro, text, &[]);
        let with_ref = Fingerprint::of(SchemaFormat::Avro, text, &[reference.clone()]);
        let bumped = Fingerprint::of(
            SchemaFormat::Avro,
            text,
            &[SchemaReference::new("B", "b-value", Version::new(2))],
        );
        assert_ne!(plain, with_ref);
        assert_ne!(with_ref, bumped);
    }
}
