//! Schema formats
//!
//! Each supported [`SchemaFormat`] gets a parser that validates submitted text,
//! produces the canonical text used for fingerprinting, and builds the typed
//! model the compatibility checker compares. Dispatch happens once, on the
//! [`ParsedSchema`] variant, so a new format is a new variant and module.

pub mod avro;
pub mod json_schema;
pub mod protobuf;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::graph::ResolvedReference;
use crate::schema::{NewSchema, Schema, SchemaFormat};

pub use avro::AvroSchema;
pub use json_schema::JsonSchemaDoc;
pub use protobuf::ProtoSchema;

/// Errors raised while parsing or validating schema text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("schema is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("invalid Avro schema: {0}")]
    Avro(String),

    #[error("invalid JSON schema: {0}")]
    JsonSchema(String),

    #[error("invalid Protobuf schema at line {line}: {message}")]
    Protobuf { line: usize, message: String },

    #[error("invalid Protobuf schema: field '{field}' has unknown type '{name}'")]
    UnknownProtobufType { field: String, name: String },

    #[error("reference '{name}' is a {found} schema, expected {expected}")]
    ReferenceFormat {
        name: String,
        expected: SchemaFormat,
        found: SchemaFormat,
    },
}

/// A schema parsed into its format's comparison model
#[derive(Debug, Clone)]
pub enum ParsedSchema {
    Avro(AvroSchema),
    Json(JsonSchemaDoc),
    Protobuf(ProtoSchema),
}

impl ParsedSchema {
    pub fn format(&self) -> SchemaFormat {
        match self {
            ParsedSchema::Avro(_) => SchemaFormat::Avro,
            ParsedSchema::Json(_) => SchemaFormat::Json,
            ParsedSchema::Protobuf(_) => SchemaFormat::Protobuf,
        }
    }
}

/// Validate and canonicalize a submitted schema.
///
/// `dependencies` is the resolved reference closure, dependencies first.
pub fn prepare(
    candidate: &NewSchema,
    dependencies: &[ResolvedReference],
) -> Result<(Schema, ParsedSchema), FormatError> {
    check_dependency_formats(candidate.format, dependencies)?;
    let (canonical, parsed) = match candidate.format {
        SchemaFormat::Avro => {
            let parsed = AvroSchema::parse(&candidate.text, dependencies)?;
            (avro::canonicalize(&candidate.text)?, ParsedSchema::Avro(parsed))
        }
        SchemaFormat::Json => {
            let parsed = JsonSchemaDoc::parse(&candidate.text, dependencies)?;
            (json_schema::canonicalize(&candidate.text)?, ParsedSchema::Json(parsed))
        }
        SchemaFormat::Protobuf => {
            let parsed = ProtoSchema::parse(&candidate.text, dependencies)?;
            (parsed.file.render(), ParsedSchema::Protobuf(parsed))
        }
    };
    let schema = Schema::new(candidate.format, canonical, candidate.references.clone());
    Ok((schema, parsed))
}

/// Parse an already stored schema for comparison.
pub fn parse(schema: &Schema, dependencies: &[ResolvedReference]) -> Result<ParsedSchema, FormatError> {
    check_dependency_formats(schema.format, dependencies)?;
    Ok(match schema.format {
        SchemaFormat::Avro => ParsedSchema::Avro(AvroSchema::parse(&schema.text, dependencies)?),
        SchemaFormat::Json => ParsedSchema::Json(JsonSchemaDoc::parse(&schema.text, dependencies)?),
        SchemaFormat::Protobuf => {
            ParsedSchema::Protobuf(ProtoSchema::parse(&schema.text, dependencies)?)
        }
    })
}

fn check_dependency_formats(
    format: SchemaFormat,
    dependencies: &[ResolvedReference],
) -> Result<(), FormatError> {
    for dep in dependencies {
        if dep.schema.format != format {
            return Err(FormatError::ReferenceFormat {
                name: dep.name.clone(),
                expected: format,
                found: dep.schema.format,
            });
        }
    }
    Ok(())
}

/// Parse JSON text, mapping failures to [`FormatError::InvalidJson`].
pub(crate) fn parse_json(text: &str) -> Result<Value, FormatError> {
    serde_json::from_str(text).map_err(|e| FormatError::InvalidJson(e.to_string()))
}

/// Compact JSON with object keys sorted at every level.
pub(crate) fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_sorts_keys_and_strips_whitespace() {
        let a = parse_json(r#"{ "b": 1, "a": { "z": [3, 2], "y": null } }"#).unwrap();
        let b = parse_json(r#"{"a":{"y":null,"z":[3,2]},"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":null,"z":[3,2]},"b":1}"#);
    }

    #[test]
    fn test_prepare_dedups_whitespace_variants() {
        let compact = NewSchema::avro(r#"{"type":"record","name":"A","fields":[{"name":"id","type":"int"}]}"#);
        let spaced = NewSchema::avro(
            r#"{
                "fields": [ { "type": "int", "name": "id" } ],
                "name": "A",
                "type": "record"
            }"#,
        );
        let (a, _) = prepare(&compact, &[]).unwrap();
        let (b, _) = prepare(&spaced, &[]).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn test_prepare_rejects_garbage() {
        assert!(prepare(&NewSchema::avro("{not json"), &[]).is_err());
        assert!(prepare(&NewSchema::json("[1, 2"), &[]).is_err());
        assert!(prepare(&NewSchema::protobuf("message {"), &[]).is_err());
    }
}
