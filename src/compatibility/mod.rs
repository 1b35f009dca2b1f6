//! Schema compatibility checking
//!
//! Decides whether a candidate schema may be registered after the existing
//! versions of a subject, and reports every detected change.
//!
//! Every check is phrased as "can a reader using schema R decode data
//! written with schema W". BACKWARD puts the candidate in the reader seat,
//! FORWARD puts it in the writer seat, FULL asks both questions. The
//! format-specific rules live in one submodule per format.

pub mod avro;
pub mod json_schema;
pub mod protobuf;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::formats::ParsedSchema;
use crate::schema::Version;

/// Compatibility policy of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityMode {
    /// Anything goes
    None,
    /// New schema reads data written with the latest version
    #[default]
    Backward,
    /// New schema reads data written with every live version
    BackwardTransitive,
    /// Latest version reads data written with the new schema
    Forward,
    /// Every live version reads data written with the new schema
    ForwardTransitive,
    /// Backward and forward against the latest version
    Full,
    /// Backward and forward against every live version
    FullTransitive,
}

impl CompatibilityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityMode::None => "NONE",
            CompatibilityMode::Backward => "BACKWARD",
            CompatibilityMode::BackwardTransitive => "BACKWARD_TRANSITIVE",
            CompatibilityMode::Forward => "FORWARD",
            CompatibilityMode::ForwardTransitive => "FORWARD_TRANSITIVE",
            CompatibilityMode::Full => "FULL",
            CompatibilityMode::FullTransitive => "FULL_TRANSITIVE",
        }
    }

    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            CompatibilityMode::BackwardTransitive
                | CompatibilityMode::ForwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }

    /// Directions this mode checks, backward first.
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            CompatibilityMode::None => &[],
            CompatibilityMode::Backward | CompatibilityMode::BackwardTransitive => &[Direction::Backward],
            CompatibilityMode::Forward | CompatibilityMode::ForwardTransitive => &[Direction::Forward],
            CompatibilityMode::Full | CompatibilityMode::FullTransitive => {
                &[Direction::Backward, Direction::Forward]
            }
        }
    }
}

impl fmt::Display for CompatibilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompatibilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(CompatibilityMode::None),
            "BACKWARD" => Ok(CompatibilityMode::Backward),
            "BACKWARD_TRANSITIVE" => Ok(CompatibilityMode::BackwardTransitive),
            "FORWARD" => Ok(CompatibilityMode::Forward),
            "FORWARD_TRANSITIVE" => Ok(CompatibilityMode::ForwardTransitive),
            "FULL" => Ok(CompatibilityMode::Full),
            "FULL_TRANSITIVE" => Ok(CompatibilityMode::FullTransitive),
            other => Err(format!("unknown compatibility mode '{}'", other)),
        }
    }
}

/// Which seat the candidate schema takes in a comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Candidate reads data written with the existing version
    Backward,
    /// Existing version reads data written with the candidate
    Forward,
}

/// Result of a compatibility check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    /// Whether the candidate may be registered
    pub is_compatible: bool,
    /// Whether any detected change is breaking
    pub is_breaking: bool,
    pub mode: CompatibilityMode,
    /// List of changes detected
    pub changes: Vec<SchemaChange>,
    /// Summary of the compatibility check
    pub summary: String,
}

impl CompatibilityResult {
    /// Create a compatible result
    pub fn compatible(mode: CompatibilityMode, changes: Vec<SchemaChange>) -> Self {
        let summary = if changes.is_empty() {
            "No changes detected".to_string()
        } else {
            format!("{} compatible changes detected", changes.len())
        };
        Self {
            is_compatible: true,
            is_breaking: false,
            mode,
            changes,
            summary,
        }
    }

    /// Create an incompatible result
    pub fn incompatible(mode: CompatibilityMode, changes: Vec<SchemaChange>, reason: impl Into<String>) -> Self {
        Self {
            is_compatible: false,
            is_breaking: true,
            mode,
            changes,
            summary: reason.into(),
        }
    }

    pub fn breaking_changes(&self) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(|c| c.is_breaking)
    }
}

/// A detected change between schema versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Type of change
    pub change_type: ChangeType,
    /// Path to the changed element (e.g., "fields.amount")
    pub path: String,
    /// Value in the existing version (if applicable)
    pub old_value: Option<String>,
    /// Value in the candidate (if applicable)
    pub new_value: Option<String>,
    /// Whether this change is breaking
    pub is_breaking: bool,
    /// Human-readable description
    pub description: String,
    pub direction: Direction,
    /// Existing version the candidate was compared with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// Type of schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A new field was added
    FieldAdded,
    /// A field was removed
    FieldRemoved,
    /// A field's type changed
    TypeChanged,
    /// A field was renamed
    FieldRenamed,
    /// A field's optionality changed (required <-> optional)
    OptionalityChanged,
    /// Default value changed
    DefaultChanged,
    /// Enum variant added
    EnumVariantAdded,
    /// Enum variant removed
    EnumVariantRemoved,
    /// Schema format changed
    FormatChanged,
    /// A named type's name changed
    NameChanged,
    /// A bound or content-model constraint changed
    ConstraintChanged,
    /// A field or enum value moved to a different number
    NumberChanged,
    /// A reserved field number or name is in use again
    ReservedReused,
    /// A named type (message, enum) was removed
    TypeRemoved,
    /// A named type (message, enum) was added
    TypeAdded,
}

/// Compatibility checker for schema versions
#[derive(Debug, Clone, Default)]
pub struct CompatibilityChecker {
    /// Strict mode - lint-level findings are breaking
    strict_mode: bool,
}

impl CompatibilityChecker {
    /// Create a new compatibility checker
    pub fn new() -> Self {
        Self { strict_mode: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict_mode = true;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    /// Check `candidate` against the `previous` versions selected for `mode`.
    ///
    /// Use [`previous_for_mode`] to select `previous` from a subject's live
    /// versions. Every direction of the mode is checked against every
    /// previous version; any breaking change makes the result incompatible.
    pub fn check(
        &self,
        candidate: &ParsedSchema,
        previous: &[(Version, &ParsedSchema)],
        mode: CompatibilityMode,
    ) -> CompatibilityResult {
        let mut changes = Vec::new();
        for (version, existing) in previous {
            for direction in mode.directions() {
                let (reader, writer) = match direction {
                    Direction::Backward => (candidate, *existing),
                    Direction::Forward => (*existing, candidate),
                };
                let mut found = self.compare(reader, writer, *direction);
                for change in &mut found {
                    change.version = Some(*version);
                }
                changes.extend(found);
            }
        }

        let breaking: Vec<&SchemaChange> = changes.iter().filter(|c| c.is_breaking).collect();
        match breaking.as_slice() {
            [] => CompatibilityResult::compatible(mode, changes),
            [only] => {
                let reason = only.description.clone();
                CompatibilityResult::incompatible(mode, changes, reason)
            }
            [first, rest @ ..] => {
                let reason = format!("{} (and {} more breaking changes)", first.description, rest.len());
                CompatibilityResult::incompatible(mode, changes, reason)
            }
        }
    }

    /// All changes seen by `reader` decoding data written with `writer`.
    pub fn compare(&self, reader: &ParsedSchema, writer: &ParsedSchema, direction: Direction) -> Vec<SchemaChange> {
        let mut ctx = CheckContext::new(direction, self.strict_mode);
        match (reader, writer) {
            (ParsedSchema::Avro(r), ParsedSchema::Avro(w)) => avro::compare(&mut ctx, r, w),
            (ParsedSchema::Json(r), ParsedSchema::Json(w)) => json_schema::compare(&mut ctx, r, w),
            (ParsedSchema::Protobuf(r), ParsedSchema::Protobuf(w)) => protobuf::compare(&mut ctx, r, w),
            (r, w) => ctx.breaking(
                ChangeType::FormatChanged,
                "",
                Some(r.format().to_string()),
                Some(w.format().to_string()),
                format!("Schema format changed between {} and {}", w.format(), r.format()),
            ),
        }
        ctx.changes
    }
}

/// The existing versions a candidate is checked against under `mode`.
///
/// `live` holds the subject's live versions in ascending order.
pub fn previous_for_mode<T>(mode: CompatibilityMode, live: &[T]) -> &[T] {
    match mode {
        CompatibilityMode::None => &[],
        m if m.is_transitive() => live,
        _ => match live.len() {
            0 => &[],
            n => &live[n - 1..],
        },
    }
}

/// Accumulates changes for one reader/writer comparison.
///
/// Format rules report in reader/writer terms; the context translates that
/// into old/new values and added/removed wording for the direction.
pub(crate) struct CheckContext {
    direction: Direction,
    strict: bool,
    pub(crate) changes: Vec<SchemaChange>,
}

impl CheckContext {
    pub(crate) fn new(direction: Direction, strict: bool) -> Self {
        Self {
            direction,
            strict,
            changes: Vec::new(),
        }
    }

    /// A fresh context for trial comparisons (union branches and the like).
    pub(crate) fn scratch(&self) -> Self {
        Self::new(self.direction, self.strict)
    }

    pub(crate) fn has_breaking(&self) -> bool {
        self.changes.iter().any(|c| c.is_breaking)
    }

    /// Whether the reader seat holds the candidate schema.
    pub(crate) fn reader_is_new(&self) -> bool {
        self.direction == Direction::Backward
    }

    /// Reorders a reader/writer pair as old/new, or an old/new pair as
    /// reader/writer; the mapping is its own inverse.
    pub(crate) fn by_age<T>(&self, first: T, second: T) -> (T, T) {
        if self.reader_is_new() {
            (second, first)
        } else {
            (first, second)
        }
    }

    /// Wording for something only the writer has.
    pub(crate) fn writer_only(&self) -> &'static str {
        if self.reader_is_new() {
            "removed"
        } else {
            "added"
        }
    }

    /// Wording for something only the reader has.
    pub(crate) fn reader_only(&self) -> &'static str {
        if self.reader_is_new() {
            "added"
        } else {
            "removed"
        }
    }

    pub(crate) fn writer_only_field(&self) -> ChangeType {
        if self.reader_is_new() {
            ChangeType::FieldRemoved
        } else {
            ChangeType::FieldAdded
        }
    }

    pub(crate) fn reader_only_field(&self) -> ChangeType {
        if self.reader_is_new() {
            ChangeType::FieldAdded
        } else {
            ChangeType::FieldRemoved
        }
    }

    fn push(
        &mut self,
        change_type: ChangeType,
        path: &str,
        reader_value: Option<String>,
        writer_value: Option<String>,
        is_breaking: bool,
        description: String,
    ) {
        let (old_value, new_value) = if self.reader_is_new() {
            (writer_value, reader_value)
        } else {
            (reader_value, writer_value)
        };
        self.changes.push(SchemaChange {
            change_type,
            path: path.to_string(),
            old_value,
            new_value,
            is_breaking,
            description,
            direction: self.direction,
            version: None,
        });
    }

    pub(crate) fn breaking(
        &mut self,
        change_type: ChangeType,
        path: &str,
        reader_value: Option<String>,
        writer_value: Option<String>,
        description: String,
    ) {
        self.push(change_type, path, reader_value, writer_value, true, description);
    }

    pub(crate) fn compatible(
        &mut self,
        change_type: ChangeType,
        path: &str,
        reader_value: Option<String>,
        writer_value: Option<String>,
        description: String,
    ) {
        self.push(change_type, path, reader_value, writer_value, false, description);
    }

    /// Breaking only when the checker is strict.
    pub(crate) fn lint(
        &mut self,
        change_type: ChangeType,
        path: &str,
        reader_value: Option<String>,
        writer_value: Option<String>,
        description: String,
    ) {
        let strict = self.strict;
        self.push(change_type, path, reader_value, writer_value, strict, description);
    }
}

/// `parent.child`, or `child` at the root.
pub(crate) fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}
