//! JSON Schema evolution rules
//!
//! A reader schema is compatible with a writer schema when every document
//! the writer accepts is also accepted by the reader. The checks below are
//! the structural approximation of that: property sets, required lists,
//! types, enums, bounds and closed content models.

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};

use super::{join_path, ChangeType, CheckContext};
use crate::formats::json_schema::{DocRef, JsonSchemaDoc};

/// Upper bounds: tightening means a smaller reader value
const UPPER_BOUNDS: &[&str] = &["maximum", "exclusiveMaximum", "maxLength", "maxItems", "maxProperties"];
/// Lower bounds: tightening means a larger reader value
const LOWER_BOUNDS: &[&str] = &["minimum", "exclusiveMinimum", "minLength", "minItems", "minProperties"];

/// `$ref` chains longer than this are treated as unresolvable
const MAX_REF_DEPTH: usize = 32;

pub(crate) fn compare(ctx: &mut CheckContext, reader: &JsonSchemaDoc, writer: &JsonSchemaDoc) {
    let mut check = JsonCheck {
        reader,
        writer,
        visited: HashSet::new(),
    };
    check.schemas(ctx, (DocRef::Root, &reader.root), (DocRef::Root, &writer.root), "");
}

type Located<'a> = (DocRef<'a>, &'a Value);

struct JsonCheck<'a> {
    reader: &'a JsonSchemaDoc,
    writer: &'a JsonSchemaDoc,
    /// Subschema pairs already compared, by address
    visited: HashSet<(usize, usize)>,
}

fn follow<'a>(doc: &'a JsonSchemaDoc, mut at: Located<'a>) -> Option<Located<'a>> {
    for _ in 0..MAX_REF_DEPTH {
        match at.1.get("$ref").and_then(Value::as_str) {
            Some(reference) => at = doc.resolve(at.0, reference)?,
            None => return Some(at),
        }
    }
    None
}

fn type_set(schema: &Value) -> Option<BTreeSet<&str>> {
    match schema.get("type")? {
        Value::String(t) => Some(std::iter::once(t.as_str()).collect()),
        Value::Array(items) => Some(items.iter().filter_map(Value::as_str).collect()),
        _ => None,
    }
}

fn properties(schema: &Value) -> Option<&Map<String, Value>> {
    schema.get("properties").and_then(Value::as_object)
}

fn required(schema: &Value) -> BTreeSet<&str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default()
}

fn is_closed(schema: &Value) -> bool {
    schema.get("additionalProperties") == Some(&Value::Bool(false))
}

fn has_default(schema: &Value) -> bool {
    schema.get("default").is_some()
}

fn branches(schema: &Value) -> Option<&Vec<Value>> {
    schema
        .get("anyOf")
        .or_else(|| schema.get("oneOf"))
        .and_then(Value::as_array)
}

fn describe(types: &BTreeSet<&str>) -> String {
    types.iter().copied().collect::<Vec<_>>().join("|")
}

impl<'a> JsonCheck<'a> {
    fn schemas(&mut self, ctx: &mut CheckContext, reader: Located<'a>, writer: Located<'a>, path: &str) {
        let (reader, writer) = match (follow(self.reader, reader), follow(self.writer, writer)) {
            (Some(r), Some(w)) => (r, w),
            (r, w) => {
                ctx.breaking(
                    ChangeType::TypeChanged,
                    path,
                    r.map(|_| "resolved".to_string()),
                    w.map(|_| "resolved".to_string()),
                    format!("Unresolvable $ref at '{}'", path),
                );
                return;
            }
        };
        let key = (reader.1 as *const Value as usize, writer.1 as *const Value as usize);
        if !self.visited.insert(key) {
            return;
        }

        let (r, w) = (reader.1, writer.1);
        match (r, w) {
            (Value::Bool(true), _) | (_, Value::Bool(false)) => return,
            (Value::Bool(false), _) => {
                ctx.breaking(
                    ChangeType::TypeChanged,
                    path,
                    Some("false".into()),
                    Some(w.to_string()),
                    format!("Schema at '{}' rejects every document", display_path(path)),
                );
                return;
            }
            _ => {}
        }

        if branches(r).is_some() || branches(w).is_some() {
            self.combinators(ctx, reader, writer, path);
            return;
        }

        self.types(ctx, r, w, path);
        self.enums(ctx, r, w, path);
        self.bounds(ctx, r, w, path);
        self.object(ctx, reader, writer, path);

        if let (Some(ri), Some(wi)) = (r.get("items"), w.get("items")) {
            // Tuple-form items are not compared
            if !ri.is_array() && !wi.is_array() {
                self.schemas(ctx, (reader.0, ri), (writer.0, wi), &join_path(path, "items"));
            }
        }
    }

    fn types(&mut self, ctx: &mut CheckContext, r: &Value, w: &Value, path: &str) {
        match (type_set(r), type_set(w)) {
            (Some(rt), Some(wt)) => {
                let unreadable: Vec<&str> = wt
                    .iter()
                    .copied()
                    .filter(|t| !(rt.contains(t) || (*t == "integer" && rt.contains("number"))))
                    .collect();
                if !unreadable.is_empty() {
                    ctx.breaking(
                        ChangeType::TypeChanged,
                        path,
                        Some(describe(&rt)),
                        Some(describe(&wt)),
                        format!(
                            "Type of '{}' narrowed: {} values are no longer accepted",
                            display_path(path),
                            unreadable.join("|")
                        ),
                    );
                } else if rt != wt {
                    ctx.compatible(
                        ChangeType::TypeChanged,
                        path,
                        Some(describe(&rt)),
                        Some(describe(&wt)),
                        format!("Type of '{}' widened", display_path(path)),
                    );
                }
            }
            (Some(rt), None) => ctx.breaking(
                ChangeType::TypeChanged,
                path,
                Some(describe(&rt)),
                None,
                format!("Type constraint {} on '{}' rejects untyped values", describe(&rt), display_path(path)),
            ),
            (None, Some(wt)) => ctx.compatible(
                ChangeType::TypeChanged,
                path,
                None,
                Some(describe(&wt)),
                format!("Type constraint on '{}' relaxed", display_path(path)),
            ),
            (None, None) => {}
        }
    }

    fn enums(&mut self, ctx: &mut CheckContext, r: &Value, w: &Value, path: &str) {
        let reader_values = match r.get("enum").and_then(Value::as_array) {
            Some(values) => values,
            None => return,
        };
        let writer_values = match w.get("enum").and_then(Value::as_array) {
            Some(values) => values,
            None => {
                ctx.breaking(
                    ChangeType::ConstraintChanged,
                    path,
                    Some(Value::Array(reader_values.clone()).to_string()),
                    None,
                    format!("Enum constraint on '{}' rejects values that were accepted", display_path(path)),
                );
                return;
            }
        };
        for value in writer_values.iter().filter(|v| !reader_values.contains(v)) {
            let change_type = if ctx.reader_is_new() {
                ChangeType::EnumVariantRemoved
            } else {
                ChangeType::EnumVariantAdded
            };
            ctx.breaking(
                change_type,
                path,
                None,
                Some(value.to_string()),
                format!("Enum value {} of '{}' {}", value, display_path(path), ctx.writer_only()),
            );
        }
        for value in reader_values.iter().filter(|v| !writer_values.contains(v)) {
            let change_type = if ctx.reader_is_new() {
                ChangeType::EnumVariantAdded
            } else {
                ChangeType::EnumVariantRemoved
            };
            ctx.compatible(
                change_type,
                path,
                Some(value.to_string()),
                None,
                format!("Enum value {} of '{}' {}", value, display_path(path), ctx.reader_only()),
            );
        }
    }

    fn bounds(&mut self, ctx: &mut CheckContext, r: &Value, w: &Value, path: &str) {
        let bound = |schema: &Value, key: &str| schema.get(key).and_then(Value::as_f64);
        for (keys, tighter) in [
            (UPPER_BOUNDS, upper_tightened as fn(f64, f64) -> bool),
            (LOWER_BOUNDS, lower_tightened),
        ] {
            for key in keys {
                let (rv, wv) = (bound(r, key), bound(w, key));
                let tightened = match (rv, wv) {
                    (Some(rv), Some(wv)) => tighter(rv, wv),
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => continue,
                };
                if rv == wv {
                    continue;
                }
                let bound_path = join_path(path, key);
                let (reader_value, writer_value) = (rv.map(|v| v.to_string()), wv.map(|v| v.to_string()));
                if tightened {
                    ctx.breaking(
                        ChangeType::ConstraintChanged,
                        &bound_path,
                        reader_value,
                        writer_value,
                        format!("Constraint {} of '{}' tightened", key, display_path(path)),
                    );
                } else {
                    ctx.compatible(
                        ChangeType::ConstraintChanged,
                        &bound_path,
                        reader_value,
                        writer_value,
                        format!("Constraint {} of '{}' relaxed", key, display_path(path)),
                    );
                }
            }
        }
    }

    fn object(&mut self, ctx: &mut CheckContext, reader: Located<'a>, writer: Located<'a>, path: &str) {
        let (r, w) = (reader.1, writer.1);
        let (rprops, wprops) = (properties(r), properties(w));
        let (rreq, wreq) = (required(r), required(w));

        if is_closed(r) && !is_closed(w) {
            ctx.breaking(
                ChangeType::ConstraintChanged,
                &join_path(path, "additionalProperties"),
                Some("false".into()),
                w.get("additionalProperties").map(Value::to_string),
                format!("Content model of '{}' closed to additional properties", display_path(path)),
            );
        }

        for (name, wp) in wprops.into_iter().flatten() {
            let prop_path = join_path(path, &format!("properties.{}", name));
            if let Some(rp) = rprops.and_then(|props| props.get(name)) {
                self.schemas(ctx, (reader.0, rp), (writer.0, wp), &prop_path);
                continue;
            }
            if is_closed(r) {
                ctx.breaking(
                    ctx.writer_only_field(),
                    &prop_path,
                    None,
                    Some(wp.to_string()),
                    format!("Property '{}' {} from a closed content model", name, ctx.writer_only()),
                );
            } else if wreq.contains(name.as_str()) && !has_default(wp) {
                ctx.breaking(
                    ctx.writer_only_field(),
                    &prop_path,
                    None,
                    Some(wp.to_string()),
                    format!("Required property '{}' {} without default", name, ctx.writer_only()),
                );
            } else {
                ctx.compatible(
                    ctx.writer_only_field(),
                    &prop_path,
                    None,
                    Some(wp.to_string()),
                    format!("Property '{}' {}", name, ctx.writer_only()),
                );
            }
        }

        for (name, rp) in rprops.into_iter().flatten() {
            let prop_path = join_path(path, &format!("properties.{}", name));
            let required_by_reader = rreq.contains(name.as_str()) && !has_default(rp);
            if !wprops.is_some_and(|props| props.contains_key(name)) {
                if required_by_reader && !is_closed(w) {
                    ctx.breaking(
                        ctx.reader_only_field(),
                        &prop_path,
                        Some(rp.to_string()),
                        None,
                        format!("Required property '{}' {} without default", name, ctx.reader_only()),
                    );
                } else if required_by_reader {
                    ctx.breaking(
                        ctx.reader_only_field(),
                        &prop_path,
                        Some(rp.to_string()),
                        None,
                        format!("Required property '{}' {} but never written", name, ctx.reader_only()),
                    );
                } else {
                    ctx.compatible(
                        ctx.reader_only_field(),
                        &prop_path,
                        Some(rp.to_string()),
                        None,
                        format!("Property '{}' {}", name, ctx.reader_only()),
                    );
                }
            } else if required_by_reader && !wreq.contains(name.as_str()) {
                ctx.breaking(
                    ChangeType::OptionalityChanged,
                    &prop_path,
                    Some("required".into()),
                    Some("optional".into()),
                    format!("Property '{}' became required without default", name),
                );
            } else if !rreq.contains(name.as_str()) && wreq.contains(name.as_str()) {
                ctx.compatible(
                    ChangeType::OptionalityChanged,
                    &prop_path,
                    Some("optional".into()),
                    Some("required".into()),
                    format!("Property '{}' became optional", name),
                );
            }
        }
    }

    /// `anyOf`/`oneOf`: every writer branch must be readable by some reader branch.
    fn combinators(&mut self, ctx: &mut CheckContext, reader: Located<'a>, writer: Located<'a>, path: &str) {
        let reader_branches: Vec<&'a Value> = match branches(reader.1) {
            Some(items) => items.iter().collect(),
            None => vec![reader.1],
        };
        let writer_branches: Vec<&'a Value> = match branches(writer.1) {
            Some(items) => items.iter().collect(),
            None => vec![writer.1],
        };

        for (index, wb) in writer_branches.iter().enumerate() {
            let readable = reader_branches.iter().any(|rb| {
                let mut trial = ctx.scratch();
                let mut check = JsonCheck {
                    reader: self.reader,
                    writer: self.writer,
                    visited: self.visited.clone(),
                };
                check.schemas(&mut trial, (reader.0, *rb), (writer.0, *wb), path);
                !trial.has_breaking()
            });
            if !readable {
                ctx.breaking(
                    ChangeType::TypeChanged,
                    &join_path(path, &format!("anyOf.{}", index)),
                    None,
                    Some(wb.to_string()),
                    format!("Alternative {} of '{}' can no longer be read", wb, display_path(path)),
                );
            }
        }
    }
}

fn upper_tightened(reader: f64, writer: f64) -> bool {
    reader < writer
}

fn lower_tightened(reader: f64, writer: f64) -> bool {
    reader > writer
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "#"
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use crate::compatibility::{ChangeType, CompatibilityChecker, Direction, SchemaChange};
    use crate::formats::{self, ParsedSchema};
    use crate::schema::NewSchema;

    fn parse(text: &str) -> ParsedSchema {
        formats::prepare(&NewSchema::json(text), &[]).unwrap().1
    }

    fn backward(new: &str, old: &str) -> Vec<SchemaChange> {
        CompatibilityChecker::new().compare(&parse(new), &parse(old), Direction::Backward)
    }

    fn breaking(changes: &[SchemaChange]) -> Vec<&SchemaChange> {
        changes.iter().filter(|c| c.is_breaking).collect()
    }

    const PERSON: &str = r#"{"type":"object","properties":{
        "name":{"type":"string"},"age":{"type":"integer"}},"required":["name"]}"#;

    #[test]
    fn test_optional_property_added() {
        let new = r#"{"type":"object","properties":{
            "name":{"type":"string"},"age":{"type":"integer"},"email":{"type":"string"}},"required":["name"]}"#;
        let changes = backward(new, PERSON);
        assert!(breaking(&changes).is_empty());
        assert_eq!(changes[0].change_type, ChangeType::FieldAdded);
        assert_eq!(changes[0].path, "properties.email");
    }

    #[test]
    fn test_required_property_added_without_default() {
        let new = r#"{"type":"object","properties":{
            "name":{"type":"string"},"age":{"type":"integer"},"email":{"type":"string"}},"required":["name","email"]}"#;
        let changes = backward(new, PERSON);
        assert_eq!(breaking(&changes).len(), 1);
        assert_eq!(
            breaking(&changes)[0].description,
            "Required property 'email' added without default"
        );

        let with_default = new.replace(r#""email":{"type":"string"}"#, r#""email":{"type":"string","default":""}"#);
        assert!(breaking(&backward(&with_default, PERSON)).is_empty());
    }

    #[test]
    fn test_type_widening_and_narrowing() {
        let number = r#"{"type":"object","properties":{"name":{"type":"string"},"age":{"type":"number"}},"required":["name"]}"#;
        assert!(breaking(&backward(number, PERSON)).is_empty());
        let narrowed = backward(PERSON, number);
        assert_eq!(breaking(&narrowed).len(), 1);
        assert_eq!(narrowed[0].path, "properties.age");
    }

    #[test]
    fn test_optional_property_became_required() {
        let new = PERSON.replace(r#""required":["name"]"#, r#""required":["name","age"]"#);
        let changes = backward(&new, PERSON);
        assert_eq!(breaking(&changes)[0].change_type, ChangeType::OptionalityChanged);
    }

    #[test]
    fn test_enum_values() {
        let old = r#"{"type":"string","enum":["a","b"]}"#;
        let fewer = r#"{"type":"string","enum":["a"]}"#;
        let more = r#"{"type":"string","enum":["a","b","c"]}"#;
        assert!(breaking(&backward(more, old)).is_empty());
        assert_eq!(breaking(&backward(fewer, old))[0].change_type, ChangeType::EnumVariantRemoved);
    }

    #[test]
    fn test_bounds_tightening() {
        let old = r#"{"type":"string","maxLength":10}"#;
        let tighter = r#"{"type":"string","maxLength":5}"#;
        let looser = r#"{"type":"string","maxLength":20}"#;
        let with_minimum = r#"{"type":"string","maxLength":10,"minLength":3}"#;
        assert_eq!(breaking(&backward(tighter, old))[0].path, "maxLength");
        assert!(breaking(&backward(looser, old)).is_empty());
        assert!(breaking(&backward(old, tighter)).is_empty());
        assert_eq!(breaking(&backward(with_minimum, old))[0].path, "minLength");
    }

    #[test]
    fn test_closed_content_model() {
        let open = r#"{"type":"object","properties":{"a":{"type":"string"}}}"#;
        let closed = r#"{"type":"object","properties":{"a":{"type":"string"}},"additionalProperties":false}"#;
        assert!(!breaking(&backward(closed, open)).is_empty());
        assert!(breaking(&backward(open, closed)).is_empty());
    }

    #[test]
    fn test_refs_are_followed() {
        let old = r##"{"$defs":{"id":{"type":"integer"}},"type":"object","properties":{"id":{"$ref":"#/$defs/id"}}}"##;
        let new = r##"{"$defs":{"id":{"type":"string"}},"type":"object","properties":{"id":{"$ref":"#/$defs/id"}}}"##;
        let changes = backward(new, old);
        assert_eq!(breaking(&changes).len(), 1);
        assert_eq!(changes[0].path, "properties.id");
    }

    #[test]
    fn test_any_of_branches() {
        let old = r#"{"anyOf":[{"type":"string"},{"type":"integer"}]}"#;
        let wider = r#"{"anyOf":[{"type":"string"},{"type":"number"},{"type":"null"}]}"#;
        let narrower = r#"{"anyOf":[{"type":"string"}]}"#;
        assert!(breaking(&backward(wider, old)).is_empty());
        assert_eq!(breaking(&backward(narrower, old)).len(), 1);
    }
}
