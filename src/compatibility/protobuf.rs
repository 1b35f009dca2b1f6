//! Protobuf evolution rules
//!
//! Protobuf data carries field numbers and wire types, not names, so fields
//! are matched by number. Renames are safe, number and wire-type changes are
//! not.

use super::{ChangeType, CheckContext};
use crate::formats::protobuf::{FieldView, Label, MessageView, ProtoSchema, WireClass};

pub(crate) fn compare(ctx: &mut CheckContext, reader: &ProtoSchema, writer: &ProtoSchema) {
    for (name, writer_message) in &writer.messages {
        match reader.messages.get(name) {
            Some(reader_message) => message(ctx, name, reader_message, writer_message),
            None if ctx.reader_is_new() => ctx.breaking(
                ChangeType::TypeRemoved,
                name,
                None,
                Some(name.clone()),
                format!("Message '{}' removed", name),
            ),
            None => ctx.compatible(
                ChangeType::TypeAdded,
                name,
                None,
                Some(name.clone()),
                format!("Message '{}' added", name),
            ),
        }
    }
    for name in reader.messages.keys().filter(|n| !writer.messages.contains_key(*n)) {
        if ctx.reader_is_new() {
            ctx.compatible(
                ChangeType::TypeAdded,
                name,
                Some(name.clone()),
                None,
                format!("Message '{}' added", name),
            );
        }
    }

    for (name, writer_values) in &writer.enums {
        let reader_values = match reader.enums.get(name) {
            Some(values) => values,
            None => {
                if ctx.reader_is_new() {
                    ctx.breaking(
                        ChangeType::TypeRemoved,
                        name,
                        None,
                        Some(name.clone()),
                        format!("Enum '{}' removed", name),
                    );
                }
                continue;
            }
        };
        for (value, number) in writer_values {
            match reader_values.iter().find(|(n, _)| n == value) {
                Some((_, reader_number)) if reader_number != number => ctx.breaking(
                    ChangeType::NumberChanged,
                    &format!("{}.{}", name, value),
                    Some(reader_number.to_string()),
                    Some(number.to_string()),
                    format!("Enum value '{}.{}' renumbered", name, value),
                ),
                Some(_) => {}
                None if !reader_values.iter().any(|(_, n)| n == number) => ctx.compatible(
                    if ctx.reader_is_new() {
                        ChangeType::EnumVariantRemoved
                    } else {
                        ChangeType::EnumVariantAdded
                    },
                    &format!("{}.{}", name, value),
                    None,
                    Some(number.to_string()),
                    format!("Enum value '{}.{}' {}", name, value, ctx.writer_only()),
                ),
                None => {}
            }
        }
    }
}

fn field_path(message: &str, field: &FieldView) -> String {
    format!("{}.{}", message, field.name)
}

/// Field numbers are compared by schema age: what the candidate drops,
/// moves or reuses matters whichever side of the wire it sits on.
fn message(ctx: &mut CheckContext, name: &str, reader: &MessageView, writer: &MessageView) {
    let (old, new) = ctx.by_age(reader, writer);

    for of in &old.fields {
        let path = field_path(name, of);
        if let Some(nf) = new.field_by_number(of.number) {
            let (rf, wf) = ctx.by_age(of, nf);
            field(ctx, &path, rf, wf);
            continue;
        }
        let (old_number, new_number) = (Some(of.number.to_string()), None);
        if let Some(moved) = new.field_by_name(&of.name) {
            let (reader_value, writer_value) = ctx.by_age(old_number, Some(moved.number.to_string()));
            ctx.breaking(
                ChangeType::NumberChanged,
                &path,
                reader_value,
                writer_value,
                format!("Field '{}' moved from number {} to {}", path, of.number, moved.number),
            );
        } else if new.reserves_number(of.number) {
            let (reader_value, writer_value) = ctx.by_age(old_number, new_number);
            ctx.compatible(
                ChangeType::FieldRemoved,
                &path,
                reader_value,
                writer_value,
                format!("Field '{}' = {} removed and reserved", path, of.number),
            );
        } else {
            let (reader_value, writer_value) = ctx.by_age(old_number, new_number);
            ctx.lint(
                ChangeType::FieldRemoved,
                &path,
                reader_value,
                writer_value,
                format!("Field '{}' = {} removed without reserving its number", path, of.number),
            );
        }
    }

    for nf in &new.fields {
        if old.field_by_number(nf.number).is_some() {
            continue;
        }
        let path = field_path(name, nf);
        let (reader_value, writer_value) = ctx.by_age(None, Some(nf.number.to_string()));
        if old.reserves_number(nf.number) || old.reserves_name(&nf.name) {
            ctx.breaking(
                ChangeType::ReservedReused,
                &path,
                reader_value,
                writer_value,
                format!("Field '{}' = {} reuses a reserved number or name", path, nf.number),
            );
        } else if old.field_by_name(&nf.name).is_none() {
            ctx.compatible(
                ChangeType::FieldAdded,
                &path,
                reader_value,
                writer_value,
                format!("Field '{}' = {} added", path, nf.number),
            );
        }
    }
}

fn field(ctx: &mut CheckContext, path: &str, reader: &FieldView, writer: &FieldView) {
    let (old, new) = ctx.by_age(reader, writer);
    if reader.name != writer.name {
        ctx.compatible(
            ChangeType::FieldRenamed,
            path,
            Some(reader.name.clone()),
            Some(writer.name.clone()),
            format!("Field number {} renamed from '{}' to '{}'", old.number, old.name, new.name),
        );
    }

    if reader.is_map != writer.is_map || reader.wire != writer.wire {
        ctx.breaking(
            ChangeType::TypeChanged,
            path,
            Some(reader.type_name.clone()),
            Some(writer.type_name.clone()),
            format!(
                "Field '{}' type changed from {} to {} with a different wire encoding",
                path, old.type_name, new.type_name
            ),
        );
        return;
    }

    let repeated = |f: &FieldView| f.label == Label::Repeated;
    if (reader.is_message || writer.is_message) && reader.type_name != writer.type_name {
        ctx.breaking(
            ChangeType::TypeChanged,
            path,
            Some(reader.type_name.clone()),
            Some(writer.type_name.clone()),
            format!("Field '{}' message type changed from {} to {}", path, old.type_name, new.type_name),
        );
    } else if reader.type_name != writer.type_name {
        ctx.compatible(
            ChangeType::TypeChanged,
            path,
            Some(reader.type_name.clone()),
            Some(writer.type_name.clone()),
            format!("Field '{}' type changed within its wire encoding", path),
        );
    }

    if repeated(reader) != repeated(writer) {
        let label = |f: &FieldView| if repeated(f) { "repeated" } else { "singular" };
        // Packed scalars decode either way; length-delimited values do not
        let is_breaking = reader.is_message || reader.wire == WireClass::LengthDelimited;
        let description = format!("Field '{}' changed from {} to {}", path, label(old), label(new));
        if is_breaking {
            ctx.breaking(
                ChangeType::OptionalityChanged,
                path,
                Some(label(reader).into()),
                Some(label(writer).into()),
                description,
            );
        } else {
            ctx.compatible(
                ChangeType::OptionalityChanged,
                path,
                Some(label(reader).into()),
                Some(label(writer).into()),
                description,
            );
        }
    }

    if reader.oneof != writer.oneof && reader.oneof.is_some() && writer.oneof.is_some() {
        ctx.breaking(
            ChangeType::TypeChanged,
            path,
            reader.oneof.clone(),
            writer.oneof.clone(),
            format!("Field '{}' moved to a different oneof", path),
        );
    }
}
