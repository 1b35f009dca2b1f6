//! Avro schema parsing
//!
//! Text is parsed by `apache-avro`, which resolves names, namespaces and
//! aliases. The resulting `apache_avro::Schema` is then lowered into a small
//! model with every named type (records, enums, fixed) interned by full name.
//! Type references, including recursive ones, point into that table instead
//! of nesting, which keeps comparison of self-referencing records finite.

use std::collections::BTreeMap;
use std::fmt;

use apache_avro::schema::{Alias, Name};
use apache_avro::Schema as LibrarySchema;
use serde_json::Value;

use super::{canonical_json, parse_json, FormatError};
use crate::graph::ResolvedReference;

/// An Avro type
#[derive(Debug, Clone, PartialEq)]
pub enum AvroType {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
    /// The `duration` logical type, a 12-byte fixed
    Duration,
    /// Full name of a record, enum or fixed
    Named(String),
    Array(Box<AvroType>),
    Map(Box<AvroType>),
    Union(Vec<AvroType>),
}

impl AvroType {
    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            AvroType::Named(_) | AvroType::Array(_) | AvroType::Map(_) | AvroType::Union(_)
        )
    }
}

impl fmt::Display for AvroType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvroType::Null => f.write_str("null"),
            AvroType::Boolean => f.write_str("boolean"),
            AvroType::Int => f.write_str("int"),
            AvroType::Long => f.write_str("long"),
            AvroType::Float => f.write_str("float"),
            AvroType::Double => f.write_str("double"),
            AvroType::Bytes => f.write_str("bytes"),
            AvroType::String => f.write_str("string"),
            AvroType::Duration => f.write_str("duration"),
            AvroType::Named(name) => f.write_str(name),
            AvroType::Array(items) => write!(f, "array<{}>", items),
            AvroType::Map(values) => write!(f, "map<{}>", values),
            AvroType::Union(branches) => {
                f.write_str("[")?;
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", branch)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A record field
#[derive(Debug, Clone, PartialEq)]
pub struct AvroField {
    pub name: String,
    pub aliases: Vec<String>,
    pub ty: AvroType,
    /// `Some(Value::Null)` is an explicit `"default": null`
    pub default: Option<Value>,
}

/// Named type definitions
#[derive(Debug, Clone, PartialEq)]
pub enum NamedType {
    Record {
        name: String,
        aliases: Vec<String>,
        fields: Vec<AvroField>,
    },
    Enum {
        name: String,
        aliases: Vec<String>,
        symbols: Vec<String>,
        default: Option<String>,
    },
    Fixed {
        name: String,
        aliases: Vec<String>,
        size: u64,
    },
}

impl NamedType {
    pub fn full_name(&self) -> &str {
        match self {
            NamedType::Record { name, .. } | NamedType::Enum { name, .. } | NamedType::Fixed { name, .. } => name,
        }
    }

    pub fn aliases(&self) -> &[String] {
        match self {
            NamedType::Record { aliases, .. }
            | NamedType::Enum { aliases, .. }
            | NamedType::Fixed { aliases, .. } => aliases,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NamedType::Record { .. } => "record",
            NamedType::Enum { .. } => "enum",
            NamedType::Fixed { .. } => "fixed",
        }
    }
}

/// A parsed Avro schema together with the named types it can see
#[derive(Debug, Clone, PartialEq)]
pub struct AvroSchema {
    pub root: AvroType,
    pub named: BTreeMap<String, NamedType>,
}

impl AvroSchema {
    /// Parse `text`, making the named types of `dependencies` visible to it.
    pub fn parse(text: &str, dependencies: &[ResolvedReference]) -> Result<Self, FormatError> {
        let parsed = if dependencies.is_empty() {
            vec![LibrarySchema::parse_str(text).map_err(library_error)?]
        } else {
            let mut inputs: Vec<&str> = dependencies.iter().map(|d| d.schema.text.as_str()).collect();
            inputs.push(text);
            LibrarySchema::parse_list(&inputs).map_err(library_error)?
        };

        let mut lowering = Lowering::default();
        let mut root = AvroType::Null;
        for schema in &parsed {
            root = lowering.lower(schema)?;
        }
        Ok(Self {
            root,
            named: lowering.named,
        })
    }

    /// Resolve a type through the named-type table.
    pub fn lookup(&self, ty: &AvroType) -> Option<&NamedType> {
        match ty {
            AvroType::Named(name) => self.named.get(name),
            _ => None,
        }
    }
}

/// Canonical text: the JSON document with sorted keys and no whitespace.
pub fn canonicalize(text: &str) -> Result<String, FormatError> {
    Ok(canonical_json(&parse_json(text)?))
}

fn library_error(err: apache_avro::Error) -> FormatError {
    FormatError::Avro(err.to_string())
}

/// Walks library schemas into [`AvroType`]s, collecting named definitions.
#[derive(Default)]
struct Lowering {
    named: BTreeMap<String, NamedType>,
}

impl Lowering {
    fn lower(&mut self, schema: &LibrarySchema) -> Result<AvroType, FormatError> {
        Ok(match schema {
            LibrarySchema::Null => AvroType::Null,
            LibrarySchema::Boolean => AvroType::Boolean,
            LibrarySchema::Int | LibrarySchema::Date | LibrarySchema::TimeMillis => AvroType::Int,
            LibrarySchema::Long
            | LibrarySchema::TimeMicros
            | LibrarySchema::TimestampMillis
            | LibrarySchema::TimestampMicros
            | LibrarySchema::LocalTimestampMillis
            | LibrarySchema::LocalTimestampMicros => AvroType::Long,
            LibrarySchema::Float => AvroType::Float,
            LibrarySchema::Double => AvroType::Double,
            LibrarySchema::Bytes => AvroType::Bytes,
            LibrarySchema::String | LibrarySchema::Uuid => AvroType::String,
            LibrarySchema::Duration => AvroType::Duration,
            LibrarySchema::Decimal(decimal) => self.lower(&decimal.inner)?,
            LibrarySchema::Array(items) => AvroType::Array(Box::new(self.lower(items)?)),
            LibrarySchema::Map(values) => AvroType::Map(Box::new(self.lower(values)?)),
            LibrarySchema::Union(union) => {
                let mut branches = Vec::with_capacity(union.variants().len());
                for variant in union.variants() {
                    branches.push(self.lower(variant)?);
                }
                AvroType::Union(branches)
            }
            LibrarySchema::Ref { name } => AvroType::Named(name.fullname(None)),
            LibrarySchema::Record(record) => {
                let full_name = record.name.fullname(None);
                let mut fields = Vec::with_capacity(record.fields.len());
                for field in &record.fields {
                    fields.push(AvroField {
                        name: field.name.clone(),
                        aliases: field.aliases.clone().unwrap_or_default(),
                        ty: self.lower(&field.schema)?,
                        default: field.default.clone(),
                    });
                }
                self.define(NamedType::Record {
                    name: full_name.clone(),
                    aliases: alias_names(&record.name, record.aliases.as_deref()),
                    fields,
                })?
            }
            LibrarySchema::Enum(def) => self.define(NamedType::Enum {
                name: def.name.fullname(None),
                aliases: alias_names(&def.name, def.aliases.as_deref()),
                symbols: def.symbols.clone(),
                default: def.default.clone(),
            })?,
            LibrarySchema::Fixed(def) => self.define(NamedType::Fixed {
                name: def.name.fullname(None),
                aliases: alias_names(&def.name, def.aliases.as_deref()),
                size: def.size as u64,
            })?,
            // Remaining logical types (big-decimal) annotate bytes
            #[allow(unreachable_patterns)]
            _ => AvroType::Bytes,
        })
    }

    /// Register a named type. Identical redefinitions (the same dependency
    /// reached along two reference paths) are accepted.
    fn define(&mut self, named: NamedType) -> Result<AvroType, FormatError> {
        let key = named.full_name().to_string();
        if let Some(existing) = self.named.get(&key) {
            if existing != &named {
                return Err(FormatError::Avro(format!("type '{}' is defined twice", key)));
            }
        }
        self.named.insert(key.clone(), named);
        Ok(AvroType::Named(key))
    }
}

/// Aliases qualified with the namespace of the type declaring them.
fn alias_names(name: &Name, aliases: Option<&[Alias]>) -> Vec<String> {
    aliases
        .unwrap_or_default()
        .iter()
        .map(|alias| alias.fullname(name.namespace.clone()))
        .collect()
}

/// The unqualified part of a full name
pub fn short_name(full: &str) -> &str {
    full.rsplit('.').next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record_with_defaults() {
        let schema = AvroSchema::parse(
            r#"{"type":"record","name":"Order","namespace":"shop","fields":[
                {"name":"id","type":"int"},
                {"name":"currency","type":"string","default":"USD"},
                {"name":"note","type":["null","string"],"default":null}
            ]}"#,
            &[],
        )
        .unwrap();
        assert_eq!(schema.root, AvroType::Named("shop.Order".into()));
        let Some(NamedType::Record { fields, .. }) = schema.lookup(&schema.root) else {
            panic!("expected record");
        };
        assert_eq!(fields.len(), 3);
        assert!(fields[0].default.is_none());
        assert_eq!(fields[1].default, Some(Value::String("USD".into())));
        assert_eq!(fields[2].default, Some(Value::Null));
    }

    #[test]
    fn test_recursive_record() {
        let schema = AvroSchema::parse(
            r#"{"type":"record","name":"Node","fields":[
                {"name":"value","type":"long"},
                {"name":"next","type":["null","Node"],"default":null}
            ]}"#,
            &[],
        )
        .unwrap();
        let Some(NamedType::Record { fields, .. }) = schema.lookup(&schema.root) else {
            panic!("expected record");
        };
        assert_eq!(
            fields[1].ty,
            AvroType::Union(vec![AvroType::Null, AvroType::Named("Node".into())])
        );
    }

    #[test]
    fn test_primitive_and_logical_types() {
        let schema = AvroSchema::parse(r#""string""#, &[]).unwrap();
        assert_eq!(schema.root, AvroType::String);
        let schema = AvroSchema::parse(r#"{"type":"long","logicalType":"timestamp-millis"}"#, &[]).unwrap();
        assert_eq!(schema.root, AvroType::Long);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = AvroSchema::parse(
            r#"{"type":"record","name":"A","fields":[{"name":"m","type":"Money"}]}"#,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, FormatError::Avro(_)));
    }

    #[test]
    fn test_names_and_aliases_come_from_the_library() {
        let schema = AvroSchema::parse(
            r#"{"type":"record","name":"Order","namespace":"shop","aliases":["Purchase"],"fields":[
                {"name":"total","type":{"type":"fixed","name":"Money","size":8}},
                {"name":"state","aliases":["status"],"type":{"type":"enum","name":"State","symbols":["NEW","PAID"],"default":"NEW"}},
                {"name":"refund","type":["null","Money"],"default":null}
            ]}"#,
            &[],
        )
        .unwrap();
        let order = schema.lookup(&schema.root).unwrap();
        assert_eq!(order.aliases(), ["shop.Purchase".to_string()]);
        let NamedType::Record { fields, .. } = order else {
            panic!("expected record");
        };
        assert_eq!(fields[0].ty, AvroType::Named("shop.Money".into()));
        assert_eq!(fields[1].aliases, vec!["status".to_string()]);
        assert_eq!(fields[2].ty, AvroType::Union(vec![AvroType::Null, AvroType::Named("shop.Money".into())]));
        assert!(matches!(
            schema.named.get("shop.State"),
            Some(NamedType::Enum { default: Some(d), .. }) if d == "NEW"
        ));
        assert!(matches!(schema.named.get("shop.Money"), Some(NamedType::Fixed { size: 8, .. })));
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("a.b.Order"), "Order");
        assert_eq!(short_name("Order"), "Order");
    }
}
