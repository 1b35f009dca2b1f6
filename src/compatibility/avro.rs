//! Avro schema resolution rules

use std::collections::HashSet;

use super::{join_path, ChangeType, CheckContext};
use crate::formats::avro::{short_name, AvroField, AvroSchema, AvroType, NamedType};

pub(crate) fn compare(ctx: &mut CheckContext, reader: &AvroSchema, writer: &AvroSchema) {
    let mut check = AvroCheck {
        reader,
        writer,
        visited: HashSet::new(),
    };
    check.types(ctx, &reader.root, &writer.root, "");
}

struct AvroCheck<'a> {
    reader: &'a AvroSchema,
    writer: &'a AvroSchema,
    /// (reader, writer) named type pairs already compared
    visited: HashSet<(String, String)>,
}

/// Writer primitive types a reader primitive accepts besides itself.
fn promotes_to(writer: &AvroType, reader: &AvroType) -> bool {
    use AvroType::*;
    matches!(
        (writer, reader),
        (Int, Long) | (Int, Float) | (Int, Double) | (Long, Float) | (Long, Double) | (Float, Double) | (String, Bytes) | (Bytes, String)
    )
}

fn names_match(reader: &NamedType, writer: &NamedType) -> bool {
    short_name(reader.full_name()) == short_name(writer.full_name())
        || reader
            .aliases()
            .iter()
            .any(|alias| alias == writer.full_name() || short_name(alias) == short_name(writer.full_name()))
}

impl<'a> AvroCheck<'a> {
    /// Shallow match used to pick union branches.
    fn readable(&self, reader: &AvroType, writer: &AvroType) -> bool {
        match (reader, writer) {
            (_, AvroType::Union(branches)) => branches.iter().all(|b| self.readable(reader, b)),
            (AvroType::Union(branches), _) => branches.iter().any(|b| self.readable(b, writer)),
            (AvroType::Named(_), AvroType::Named(_)) => {
                match (self.reader.lookup(reader), self.writer.lookup(writer)) {
                    (Some(r), Some(w)) => r.kind() == w.kind() && names_match(r, w),
                    _ => false,
                }
            }
            (AvroType::Array(r), AvroType::Array(w)) | (AvroType::Map(r), AvroType::Map(w)) => self.readable(r, w),
            (r, w) if r.is_primitive() && w.is_primitive() => r == w || promotes_to(w, r),
            _ => false,
        }
    }

    /// Reader branch that reads `writer`, preferring an identical one.
    fn select_branch<'b>(&self, branches: &'b [AvroType], writer: &AvroType) -> Option<&'b AvroType> {
        branches
            .iter()
            .find(|b| *b == writer)
            .or_else(|| branches.iter().find(|b| self.readable(b, writer)))
    }

    fn types(&mut self, ctx: &mut CheckContext, reader: &AvroType, writer: &AvroType, path: &str) {
        match (reader, writer) {
            (_, AvroType::Union(branches)) => {
                for branch in branches {
                    let target = match reader {
                        AvroType::Union(reader_branches) => self.select_branch(reader_branches, branch).cloned(),
                        other if self.readable(other, branch) => Some(other.clone()),
                        _ => None,
                    };
                    match target {
                        Some(target) => self.types(ctx, &target, branch, path),
                        None => ctx.breaking(
                            ChangeType::TypeChanged,
                            path,
                            Some(reader.to_string()),
                            Some(writer.to_string()),
                            format!("Union branch '{}' cannot be read as {}", branch, reader),
                        ),
                    }
                }
            }
            (AvroType::Union(branches), _) => match self.select_branch(branches, writer) {
                Some(target) => {
                    let target = target.clone();
                    self.types(ctx, &target, writer, path);
                }
                None => ctx.breaking(
                    ChangeType::TypeChanged,
                    path,
                    Some(reader.to_string()),
                    Some(writer.to_string()),
                    format!("Type {} cannot be read as {}", writer, reader),
                ),
            },
            (AvroType::Named(_), AvroType::Named(_)) => self.named(ctx, reader, writer, path),
            (AvroType::Array(r), AvroType::Array(w)) => self.types(ctx, r, w, &join_path(path, "items")),
            (AvroType::Map(r), AvroType::Map(w)) => self.types(ctx, r, w, &join_path(path, "values")),
            (r, w) if r == w => {}
            (r, w) if promotes_to(w, r) => ctx.compatible(
                ChangeType::TypeChanged,
                path,
                Some(r.to_string()),
                Some(w.to_string()),
                format!("Type {} is promoted to {}", w, r),
            ),
            (r, w) => ctx.breaking(
                ChangeType::TypeChanged,
                path,
                Some(r.to_string()),
                Some(w.to_string()),
                type_change_description(path, r, w, ctx.reader_is_new()),
            ),
        }
    }

    fn named(&mut self, ctx: &mut CheckContext, reader: &AvroType, writer: &AvroType, path: &str) {
        let (r, w) = match (self.reader.lookup(reader), self.writer.lookup(writer)) {
            (Some(r), Some(w)) => (r, w),
            // Unresolved names were rejected at parse time
            _ => return,
        };
        if !self.visited.insert((r.full_name().to_string(), w.full_name().to_string())) {
            return;
        }
        if r.kind() != w.kind() {
            ctx.breaking(
                ChangeType::TypeChanged,
                path,
                Some(format!("{} {}", r.kind(), r.full_name())),
                Some(format!("{} {}", w.kind(), w.full_name())),
                format!("Type {} {} cannot be read as {} {}", w.kind(), w.full_name(), r.kind(), r.full_name()),
            );
            return;
        }
        if !names_match(r, w) {
            ctx.breaking(
                ChangeType::NameChanged,
                path,
                Some(r.full_name().to_string()),
                Some(w.full_name().to_string()),
                format!("{} name changed between {} and {} without an alias", r.kind(), w.full_name(), r.full_name()),
            );
            return;
        }

        match (r, w) {
            (NamedType::Record { fields: rf, .. }, NamedType::Record { fields: wf, .. }) => {
                self.fields(ctx, rf, wf, path);
            }
            (
                NamedType::Enum {
                    symbols: rs,
                    default: rd,
                    ..
                },
                NamedType::Enum { symbols: ws, .. },
            ) => enum_symbols(ctx, rs, rd.as_deref(), ws, path),
            (NamedType::Fixed { size: rs, .. }, NamedType::Fixed { size: ws, .. }) if rs != ws => {
                ctx.breaking(
                    ChangeType::TypeChanged,
                    path,
                    Some(rs.to_string()),
                    Some(ws.to_string()),
                    format!("Fixed {} size changed between {} and {}", r.full_name(), ws, rs),
                );
            }
            _ => {}
        }
    }

    fn fields(&mut self, ctx: &mut CheckContext, reader: &[AvroField], writer: &[AvroField], path: &str) {
        let mut matched = HashSet::new();
        for wf in writer {
            let found = reader
                .iter()
                .position(|rf| rf.name == wf.name)
                .or_else(|| reader.iter().position(|rf| rf.aliases.iter().any(|a| *a == wf.name)));
            let field_path = join_path(path, &format!("fields.{}", wf.name));
            match found {
                Some(index) => {
                    matched.insert(index);
                    let rf = &reader[index];
                    if rf.name != wf.name {
                        ctx.compatible(
                            ChangeType::FieldRenamed,
                            &field_path,
                            Some(rf.name.clone()),
                            Some(wf.name.clone()),
                            format!("Field '{}' is read as '{}' through an alias", wf.name, rf.name),
                        );
                    }
                    if rf.default != wf.default {
                        ctx.compatible(
                            ChangeType::DefaultChanged,
                            &field_path,
                            rf.default.as_ref().map(|v| v.to_string()),
                            wf.default.as_ref().map(|v| v.to_string()),
                            format!("Field '{}' default changed", rf.name),
                        );
                    }
                    self.types(ctx, &rf.ty, &wf.ty, &field_path);
                }
                None if wf.default.is_some() => ctx.compatible(
                    ctx.writer_only_field(),
                    &field_path,
                    None,
                    Some(wf.ty.to_string()),
                    format!("Field '{}' {} with default", wf.name, ctx.writer_only()),
                ),
                None => ctx.breaking(
                    ctx.writer_only_field(),
                    &field_path,
                    None,
                    Some(wf.ty.to_string()),
                    format!("Field '{}' {} without default", wf.name, ctx.writer_only()),
                ),
            }
        }

        for (index, rf) in reader.iter().enumerate() {
            if matched.contains(&index) {
                continue;
            }
            let field_path = join_path(path, &format!("fields.{}", rf.name));
            if rf.default.is_some() {
                ctx.compatible(
                    ctx.reader_only_field(),
                    &field_path,
                    Some(rf.ty.to_string()),
                    None,
                    format!("Field '{}' {} with default", rf.name, ctx.reader_only()),
                );
            } else {
                ctx.breaking(
                    ctx.reader_only_field(),
                    &field_path,
                    Some(rf.ty.to_string()),
                    None,
                    format!("Field '{}' {} without default", rf.name, ctx.reader_only()),
                );
            }
        }
    }
}

fn enum_symbols(ctx: &mut CheckContext, reader: &[String], reader_default: Option<&str>, writer: &[String], path: &str) {
    for symbol in writer.iter().filter(|s| !reader.contains(*s)) {
        let (change_type, verb) = if ctx.reader_is_new() {
            (ChangeType::EnumVariantRemoved, "removed")
        } else {
            (ChangeType::EnumVariantAdded, "added")
        };
        match reader_default {
            Some(default) => ctx.compatible(
                change_type,
                path,
                None,
                Some(symbol.clone()),
                format!("Enum symbol '{}' {}, read as default '{}'", symbol, verb, default),
            ),
            None => ctx.breaking(
                change_type,
                path,
                None,
                Some(symbol.clone()),
                format!("Enum symbol '{}' {} and the reader enum has no default", symbol, verb),
            ),
        }
    }
    for symbol in reader.iter().filter(|s| !writer.contains(*s)) {
        let change_type = if ctx.reader_is_new() {
            ChangeType::EnumVariantAdded
        } else {
            ChangeType::EnumVariantRemoved
        };
        ctx.compatible(
            change_type,
            path,
            Some(symbol.clone()),
            None,
            format!("Enum symbol '{}' {}", symbol, ctx.reader_only()),
        );
    }
}

fn type_change_description(path: &str, reader: &AvroType, writer: &AvroType, reader_is_new: bool) -> String {
    let (old, new) = if reader_is_new { (writer, reader) } else { (reader, writer) };
    if path.is_empty() {
        format!("Schema type changed from {} to {}", old, new)
    } else {
        format!("Type of '{}' changed from {} to {}", path, old, new)
    }
}
