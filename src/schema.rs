//! Schema types and structures

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Global schema identifier, assigned once and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaId(u32);

impl SchemaId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The id following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subject-local version number, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u32);

impl Version {
    pub const FIRST: Version = Version(1);

    pub const fn new(version: u32) -> Self {
        Self(version)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Format of a schema. A closed set: adding a format means adding a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaFormat {
    /// Avro record-style schemas
    #[default]
    Avro,
    /// JSON Schema documents
    Json,
    /// Protobuf declarations
    Protobuf,
}

impl SchemaFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaFormat::Avro => "AVRO",
            SchemaFormat::Json => "JSON",
            SchemaFormat::Protobuf => "PROTOBUF",
        }
    }
}

impl fmt::Display for SchemaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemaFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AVRO" => Ok(SchemaFormat::Avro),
            "JSON" | "JSONSCHEMA" | "JSON_SCHEMA" => Ok(SchemaFormat::Json),
            "PROTOBUF" | "PROTO" => Ok(SchemaFormat::Protobuf),
            other => Err(format!("unknown schema format '{}'", other)),
        }
    }
}

/// A named reference from one schema to a registered subject version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaReference {
    /// Name the referencing schema uses (Avro full name, JSON `$ref`, proto import path)
    pub name: String,
    pub subject: String,
    pub version: Version,
}

impl SchemaReference {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            version,
        }
    }
}

/// A schema as submitted by a client, before canonicalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchema {
    pub text: String,
    pub format: SchemaFormat,
    pub references: Vec<SchemaReference>,
}

impl NewSchema {
    pub fn new(format: SchemaFormat, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format,
            references: Vec::new(),
        }
    }

    pub fn avro(text: impl Into<String>) -> Self {
        Self::new(SchemaFormat::Avro, text)
    }

    pub fn json(text: impl Into<String>) -> Self {
        Self::new(SchemaFormat::Json, text)
    }

    pub fn protobuf(text: impl Into<String>) -> Self {
        Self::new(SchemaFormat::Protobuf, text)
    }

    pub fn with_reference(mut self, reference: SchemaReference) -> Self {
        self.references.push(reference);
        self
    }
}

/// Immutable, canonicalized schema content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub format: SchemaFormat,
    /// Canonical text
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SchemaReference>,
    pub fingerprint: Fingerprint,
}

impl Schema {
    /// Build a schema from already canonical text
    pub fn new(format: SchemaFormat, text: impl Into<String>, references: Vec<SchemaReference>) -> Self {
        let text = text.into();
        let fingerprint = Fingerprint::of(format, &text, &references);
        Self {
            format,
            text,
            references,
            fingerprint,
        }
    }
}

/// One version of a subject, as seen by readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectVersion {
    pub subject: String,
    pub version: Version,
    pub id: SchemaId,
    pub schema: std::sync::Arc<Schema>,
    pub deleted: bool,
}

/// Reject subject names the log records cannot carry unambiguously.
pub fn validate_subject(subject: &str) -> Result<(), String> {
    if subject.trim().is_empty() {
        return Err("subject name must not be empty".to_string());
    }
    if subject.chars().any(char::is_control) {
        return Err(format!("subject name {:?} contains control characters", subject));
    }
    Ok(())
}
