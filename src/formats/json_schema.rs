//! JSON Schema parsing

use std::collections::BTreeMap;

use serde_json::Value;

use super::{canonical_json, parse_json, FormatError};
use crate::graph::ResolvedReference;

/// A JSON Schema document and the referenced documents its `$ref`s may name
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSchemaDoc {
    pub root: Value,
    /// Referenced documents keyed by reference name
    pub external: BTreeMap<String, Value>,
}

/// Where a subschema lives: the root document or a named external one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocRef<'a> {
    Root,
    External(&'a str),
}

impl JsonSchemaDoc {
    pub fn parse(text: &str, dependencies: &[ResolvedReference]) -> Result<Self, FormatError> {
        let root = parse_json(text)?;
        validate(&root)?;
        let mut external = BTreeMap::new();
        for dep in dependencies {
            let value = parse_json(&dep.schema.text)?;
            validate(&value)?;
            external.insert(dep.name.clone(), value);
        }
        Ok(Self { root, external })
    }

    pub fn document(&self, doc: DocRef<'_>) -> Option<&Value> {
        match doc {
            DocRef::Root => Some(&self.root),
            DocRef::External(name) => self.external.get(name),
        }
    }

    /// Follow a `$ref` found inside `doc`.
    ///
    /// Local refs (`#/...`) are JSON pointers into the same document; other refs
    /// name a referenced document, optionally followed by a `#` pointer.
    pub fn resolve<'a>(&'a self, doc: DocRef<'a>, reference: &'a str) -> Option<(DocRef<'a>, &'a Value)> {
        let (name, pointer) = match reference.split_once('#') {
            Some((name, pointer)) => (name, pointer),
            None => (reference, ""),
        };
        let target = if name.is_empty() {
            doc
        } else {
            let (key, _) = self.external.get_key_value(name)?;
            DocRef::External(key.as_str())
        };
        let document = self.document(target)?;
        let value = if pointer.is_empty() {
            document
        } else {
            document.pointer(pointer)?
        };
        Some((target, value))
    }
}

/// Canonical text: the JSON document with sorted keys and no whitespace.
pub fn canonicalize(text: &str) -> Result<String, FormatError> {
    Ok(canonical_json(&parse_json(text)?))
}

fn validate(value: &Value) -> Result<(), FormatError> {
    if !value.is_object() && !value.is_boolean() {
        return Err(FormatError::JsonSchema("a schema must be an object or a boolean".into()));
    }
    jsonschema::JSONSchema::compile(value)
        .map(|_| ())
        .map_err(|e| FormatError::JsonSchema(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_document() {
        let doc = JsonSchemaDoc::parse(
            r#"{"type":"object","properties":{"id":{"type":"integer"}},"required":["id"]}"#,
            &[],
        )
        .unwrap();
        assert!(doc.external.is_empty());
        assert_eq!(doc.root["required"][0], "id");
    }

    #[test]
    fn test_rejects_non_schema_values() {
        assert!(JsonSchemaDoc::parse("42", &[]).is_err());
        assert!(JsonSchemaDoc::parse(r#"{"type": 12}"#, &[]).is_err());
        assert!(JsonSchemaDoc::parse("true", &[]).is_ok());
    }

    #[test]
    fn test_resolve_local_ref() {
        let doc = JsonSchemaDoc::parse(
            r##"{"$defs":{"money":{"type":"number"}},"properties":{"price":{"$ref":"#/$defs/money"}}}"##,
            &[],
        )
        .unwrap();
        let (target, value) = doc.resolve(DocRef::Root, "#/$defs/money").unwrap();
        assert_eq!(target, DocRef::Root);
        assert_eq!(value["type"], "number");
        assert!(doc.resolve(DocRef::Root, "#/$defs/missing").is_none());
        assert!(doc.resolve(DocRef::Root, "other.json").is_none());
    }
}
