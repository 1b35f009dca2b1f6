//! Protobuf declaration parsing
//!
//! Covers what compatibility needs from `.proto` files: syntax/edition,
//! package, imports, options, messages (nested), enums, oneofs, map fields,
//! reserved ranges and names. Services and `extend` blocks are kept as
//! normalized token text so they take part in canonicalization only.
//!
//! The canonical text of a schema is [`ProtoFile::render`]: comments and
//! formatting are dropped, declaration order is kept.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use super::FormatError;
use crate::graph::ResolvedReference;

/// Largest field number protobuf allows
pub const MAX_FIELD_NUMBER: u32 = 536_870_911;

/// Package of the well-known types, resolvable without a reference
const WELL_KNOWN_PACKAGE: &str = "google.protobuf.";

/// The one well-known type that is an enum
const WELL_KNOWN_ENUMS: &[&str] = &["google.protobuf.NullValue"];

const SCALARS: &[&str] = &[
    "double", "float", "int32", "int64", "uint32", "uint64", "sint32", "sint64", "fixed32", "fixed64",
    "sfixed32", "sfixed64", "bool", "string", "bytes",
];

// ---------------------------------------------------------------------------
// File model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoFile {
    /// `syntax = "proto3"` or `edition = "2023"`
    pub syntax: Option<(String, String)>,
    pub package: Option<String>,
    pub imports: Vec<Import>,
    pub options: Vec<OptionDecl>,
    pub items: Vec<TopItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub path: String,
    pub modifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDecl {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopItem {
    Message(Message),
    Enum(EnumDef),
    /// `service` and `extend` blocks, kept as normalized tokens
    Opaque { keyword: String, name: String, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub name: String,
    pub items: Vec<MessageItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageItem {
    Field(Field),
    Oneof(Oneof),
    Message(Message),
    Enum(EnumDef),
    Reserved(Reserved),
    Option(OptionDecl),
    /// `extensions` ranges and nested `extend` blocks
    Opaque(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Implicit,
    Optional,
    Required,
    Repeated,
}

impl Label {
    fn keyword(self) -> Option<&'static str> {
        match self {
            Label::Implicit => None,
            Label::Optional => Some("optional"),
            Label::Required => Some("required"),
            Label::Repeated => Some("repeated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Named(String),
    Map { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub label: Label,
    pub ty: FieldType,
    pub name: String,
    pub number: u32,
    pub options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Oneof {
    pub name: String,
    pub options: Vec<OptionDecl>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reserved {
    /// Inclusive ranges
    Numbers(Vec<(u32, u32)>),
    Names(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub options: Vec<OptionDecl>,
    pub values: Vec<EnumValue>,
    pub reserved: Vec<Reserved>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name: String,
    pub number: i64,
    pub options: Option<String>,
}

// ---------------------------------------------------------------------------
// Comparison view
// ---------------------------------------------------------------------------

/// Protobuf wire-compatibility classes: types within a class decode each
/// other's bytes, types across classes do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireClass {
    /// int32, int64, uint32, uint64, bool, enums
    Varint,
    /// sint32, sint64
    ZigZag,
    /// fixed32, sfixed32
    Fixed32,
    /// fixed64, sfixed64
    Fixed64,
    Float,
    Double,
    /// string, bytes, messages
    LengthDelimited,
}

/// A field of a flattened message, with its type resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldView {
    pub name: String,
    pub number: u32,
    pub label: Label,
    /// Rendered type, e.g. `int32`, `shop.Money`, `map<string, int64>`
    pub type_name: String,
    pub wire: WireClass,
    pub is_map: bool,
    pub is_message: bool,
    pub oneof: Option<String>,
}

/// A message flattened for comparison, keyed by full name in [`ProtoSchema`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageView {
    pub fields: Vec<FieldView>,
    pub reserved_numbers: Vec<(u32, u32)>,
    pub reserved_names: Vec<String>,
}

impl MessageView {
    pub fn field_by_number(&self, number: u32) -> Option<&FieldView> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldView> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn reserves_number(&self, number: u32) -> bool {
        self.reserved_numbers.iter().any(|(lo, hi)| (*lo..=*hi).contains(&number))
    }

    pub fn reserves_name(&self, name: &str) -> bool {
        self.reserved_names.iter().any(|n| n == name)
    }
}

/// A parsed protobuf schema: the file plus its flattened messages and enums
#[derive(Debug, Clone, PartialEq)]
pub struct ProtoSchema {
    pub file: ProtoFile,
    pub messages: BTreeMap<String, MessageView>,
    /// Enum full name -> (value name, number)
    pub enums: BTreeMap<String, Vec<(String, i64)>>,
}

impl ProtoSchema {
    pub fn parse(text: &str, dependencies: &[ResolvedReference]) -> Result<Self, FormatError> {
        let file = ProtoFile::parse(text)?;

        let mut known = KnownTypes::default();
        for dep in dependencies {
            let dep_file = ProtoFile::parse(&dep.schema.text)?;
            known.collect(&dep_file);
        }
        known.collect(&file);

        let mut schema = Self {
            messages: BTreeMap::new(),
            enums: BTreeMap::new(),
            file,
        };
        let package = schema.file.package.clone().unwrap_or_default();
        let items = schema.file.items.clone();
        for item in &items {
            match item {
                TopItem::Message(message) => schema.flatten_message(message, &package, &known)?,
                TopItem::Enum(def) => {
                    schema.enums.insert(qualify(&package, &def.name), enum_values(def));
                }
                TopItem::Opaque { .. } => {}
            }
        }
        Ok(schema)
    }

    fn flatten_message(&mut self, message: &Message, scope: &str, known: &KnownTypes) -> Result<(), FormatError> {
        let full_name = qualify(scope, &message.name);
        let mut view = MessageView::default();
        for item in &message.items {
            match item {
                MessageItem::Field(field) => view.fields.push(field_view(field, None, &full_name, known)?),
                MessageItem::Oneof(oneof) => {
                    for field in &oneof.fields {
                        view.fields.push(field_view(field, Some(&oneof.name), &full_name, known)?);
                    }
                }
                MessageItem::Message(nested) => self.flatten_message(nested, &full_name, known)?,
                MessageItem::Enum(def) => {
                    self.enums.insert(qualify(&full_name, &def.name), enum_values(def));
                }
                MessageItem::Reserved(Reserved::Numbers(ranges)) => view.reserved_numbers.extend(ranges),
                MessageItem::Reserved(Reserved::Names(names)) => view.reserved_names.extend(names.iter().cloned()),
                MessageItem::Option(_) | MessageItem::Opaque(_) => {}
            }
        }
        self.messages.insert(full_name, view);
        Ok(())
    }
}

#[derive(Default)]
struct KnownTypes {
    messages: BTreeSet<String>,
    enums: BTreeSet<String>,
}

impl KnownTypes {
    fn collect(&mut self, file: &ProtoFile) {
        let package = file.package.clone().unwrap_or_default();
        for item in &file.items {
            match item {
                TopItem::Message(message) => self.collect_message(message, &package),
                TopItem::Enum(def) => {
                    self.enums.insert(qualify(&package, &def.name));
                }
                TopItem::Opaque { .. } => {}
            }
        }
    }

    fn collect_message(&mut self, message: &Message, scope: &str) {
        let full_name = qualify(scope, &message.name);
        for item in &message.items {
            match item {
                MessageItem::Message(nested) => self.collect_message(nested, &full_name),
                MessageItem::Enum(def) => {
                    self.enums.insert(qualify(&full_name, &def.name));
                }
                _ => {}
            }
        }
        self.messages.insert(full_name);
    }

    /// Resolve a type name the way protoc does: innermost scope outwards.
    ///
    /// Returns the full name and whether it is an enum.
    fn resolve(&self, name: &str, scope: &str) -> Option<(String, bool)> {
        if let Some(absolute) = name.strip_prefix('.') {
            return self.lookup(absolute);
        }
        let mut prefix = scope;
        loop {
            if let Some(found) = self.lookup(&qualify(prefix, name)) {
                return Some(found);
            }
            match prefix.rsplit_once('.') {
                Some((outer, _)) => prefix = outer,
                None if !prefix.is_empty() => prefix = "",
                None => return None,
            }
        }
    }

    fn lookup(&self, full_name: &str) -> Option<(String, bool)> {
        if self.enums.contains(full_name) {
            Some((full_name.to_string(), true))
        } else if self.messages.contains(full_name) {
            Some((full_name.to_string(), false))
        } else if full_name.starts_with(WELL_KNOWN_PACKAGE) {
            Some((full_name.to_string(), WELL_KNOWN_ENUMS.contains(&full_name)))
        } else {
            None
        }
    }
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", scope, name)
    }
}

fn enum_values(def: &EnumDef) -> Vec<(String, i64)> {
    def.values.iter().map(|v| (v.name.clone(), v.number)).collect()
}

fn scalar_wire(name: &str) -> Option<WireClass> {
    Some(match name {
        "int32" | "int64" | "uint32" | "uint64" | "bool" => WireClass::Varint,
        "sint32" | "sint64" => WireClass::ZigZag,
        "fixed32" | "sfixed32" => WireClass::Fixed32,
        "fixed64" | "sfixed64" => WireClass::Fixed64,
        "float" => WireClass::Float,
        "double" => WireClass::Double,
        "string" | "bytes" => WireClass::LengthDelimited,
        _ => return None,
    })
}

fn field_view(field: &Field, oneof: Option<&str>, scope: &str, known: &KnownTypes) -> Result<FieldView, FormatError> {
    let resolve = |name: &str| {
        known.resolve(name, scope).ok_or_else(|| FormatError::UnknownProtobufType {
            field: qualify(scope, &field.name),
            name: name.to_string(),
        })
    };
    let (type_name, wire, is_map, is_message) = match &field.ty {
        FieldType::Map { key, value } => {
            let value_name = match scalar_wire(value) {
                Some(_) => value.clone(),
                None => resolve(value.as_str())?.0,
            };
            (format!("map<{}, {}>", key, value_name), WireClass::LengthDelimited, true, false)
        }
        FieldType::Named(name) => match scalar_wire(name) {
            Some(wire) => (name.clone(), wire, false, false),
            None => {
                let (resolved, is_enum) = resolve(name.as_str())?;
                if is_enum {
                    (resolved, WireClass::Varint, false, false)
                } else {
                    (resolved, WireClass::LengthDelimited, false, true)
                }
            }
        },
    };
    Ok(FieldView {
        name: field.name.clone(),
        number: field.number,
        label: field.label,
        type_name,
        wire,
        is_map,
        is_message,
        oneof: oneof.map(String::from),
    })
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(String),
    Str(String),
    Symbol(char),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Ident(s) | Token::Number(s) => s.clone(),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Symbol(c) => c.to_string(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, FormatError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;
    let error = |line: usize, message: String| FormatError::Protobuf { line, message };

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = line;
            i += 2;
            loop {
                match chars.get(i) {
                    None => return Err(error(start, "unterminated block comment".into())),
                    Some('*') if chars.get(i + 1) == Some(&'/') => {
                        i += 2;
                        break;
                    }
                    Some('\n') => {
                        line += 1;
                        i += 1;
                    }
                    Some(_) => i += 1,
                }
            }
        } else if c.is_ascii_alphabetic() || c == '_' || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_alphabetic())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), line));
        } else if c.is_ascii_digit() || ((c == '-' || c == '+') && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            i += 1;
            while i < chars.len()
                && (chars[i].is_ascii_alphanumeric()
                    || chars[i] == '.'
                    || ((chars[i] == '-' || chars[i] == '+') && matches!(chars[i - 1], 'e' | 'E')))
            {
                i += 1;
            }
            tokens.push((Token::Number(chars[start..i].iter().collect()), line));
        } else if c == '"' || c == '\'' {
            let start = line;
            let mut value = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None | Some('\n') => return Err(error(start, "unterminated string literal".into())),
                    Some('\\') => {
                        value.push('\\');
                        if let Some(next) = chars.get(i + 1) {
                            value.push(*next);
                        }
                        i += 2;
                    }
                    Some(q) if *q == c => {
                        i += 1;
                        break;
                    }
                    Some(other) => {
                        value.push(*other);
                        i += 1;
                    }
                }
            }
            tokens.push((Token::Str(value), line));
        } else if "{}[]()<>;=,:".contains(c) {
            tokens.push((Token::Symbol(c), line));
            i += 1;
        } else {
            return Err(error(line, format!("unexpected character '{}'", c)));
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

type ParseResult<T> = Result<T, FormatError>;

impl Parser {
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn error<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(FormatError::Protobuf {
            line: self.line(),
            message: message.into(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> ParseResult<Token> {
        match self.tokens.get(self.pos) {
            Some((token, _)) => {
                self.pos += 1;
                Ok(token.clone())
            }
            None => self.error("unexpected end of input"),
        }
    }

    fn at_symbol(&self, c: char) -> bool {
        self.peek() == Some(&Token::Symbol(c))
    }

    fn at_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == word)
    }

    fn eat_symbol(&mut self, c: char) -> bool {
        if self.at_symbol(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, c: char) -> ParseResult<()> {
        if self.eat_symbol(c) {
            Ok(())
        } else {
            self.expected(&format!("'{}'", c))
        }
    }

    /// Errors point at the offending token, so only advance on a match.
    fn expected<T>(&self, what: &str) -> ParseResult<T> {
        let found = self.peek().map(Token::text).unwrap_or_else(|| "end of input".into());
        self.error(format!("expected {}, found '{}'", what, found))
    }

    fn expect_ident(&mut self) -> ParseResult<String> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => self.expected("identifier"),
        }
    }

    fn expect_string(&mut self) -> ParseResult<String> {
        match self.peek() {
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(s)
            }
            _ => self.expected("string literal"),
        }
    }

    fn expect_int(&mut self) -> ParseResult<i64> {
        match self.peek() {
            Some(Token::Number(s)) => match parse_int(s) {
                Some(n) => {
                    self.pos += 1;
                    Ok(n)
                }
                None => self.error(format!("invalid integer '{}'", s)),
            },
            _ => self.expected("integer"),
        }
    }

    fn field_number(&mut self) -> ParseResult<u32> {
        let n = self.expect_int()?;
        if n < 1 || n > i64::from(MAX_FIELD_NUMBER) {
            return self.error(format!("field number {} out of range", n));
        }
        Ok(n as u32)
    }

    /// Tokens up to (not including) the terminator at nesting depth zero.
    fn tokens_until(&mut self, terminator: char) -> ParseResult<String> {
        let mut depth = 0usize;
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                None => return self.error(format!("expected '{}'", terminator)),
                Some(Token::Symbol(c)) if *c == terminator && depth == 0 => return Ok(parts.join(" ")),
                Some(Token::Symbol('{' | '[' | '(' | '<')) => depth += 1,
                Some(Token::Symbol('}' | ']' | ')' | '>')) => depth = depth.saturating_sub(1),
                Some(_) => {}
            }
            parts.push(self.next()?.text());
        }
    }

    /// A `{ ... }` block as normalized tokens, braces consumed.
    fn block(&mut self) -> ParseResult<String> {
        self.expect_symbol('{')?;
        let body = self.tokens_until('}')?;
        self.expect_symbol('}')?;
        Ok(body)
    }

    fn file(&mut self) -> ParseResult<ProtoFile> {
        let mut file = ProtoFile {
            syntax: None,
            package: None,
            imports: Vec::new(),
            options: Vec::new(),
            items: Vec::new(),
        };
        while let Some(token) = self.peek().cloned() {
            match token {
                Token::Symbol(';') => self.pos += 1,
                Token::Ident(word) => match word.as_str() {
                    "syntax" | "edition" => {
                        self.pos += 1;
                        self.expect_symbol('=')?;
                        let value = self.expect_string()?;
                        self.expect_symbol(';')?;
                        file.syntax = Some((word, value));
                    }
                    "package" => {
                        self.pos += 1;
                        if file.package.is_some() {
                            return self.error("multiple package declarations");
                        }
                        file.package = Some(self.expect_ident()?);
                        self.expect_symbol(';')?;
                    }
                    "import" => {
                        self.pos += 1;
                        let modifier = if self.at_ident("public") || self.at_ident("weak") {
                            Some(self.expect_ident()?)
                        } else {
                            None
                        };
                        let path = self.expect_string()?;
                        self.expect_symbol(';')?;
                        file.imports.push(Import { path, modifier });
                    }
                    "option" => file.options.push(self.option()?),
                    "message" => file.items.push(TopItem::Message(self.message()?)),
                    "enum" => file.items.push(TopItem::Enum(self.enum_def()?)),
                    "service" | "extend" => {
                        self.pos += 1;
                        let name = self.expect_ident()?;
                        let body = self.block()?;
                        file.items.push(TopItem::Opaque { keyword: word, name, body });
                    }
                    other => return self.error(format!("unexpected '{}' at top level", other)),
                },
                other => return self.error(format!("unexpected '{}' at top level", other.text())),
            }
        }
        Ok(file)
    }

    fn option(&mut self) -> ParseResult<OptionDecl> {
        self.pos += 1; // `option`
        let name = self.tokens_until('=')?.replace(' ', "");
        if name.is_empty() {
            return self.error("option without a name");
        }
        self.expect_symbol('=')?;
        let value = self.tokens_until(';')?;
        self.expect_symbol(';')?;
        Ok(OptionDecl { name, value })
    }

    fn message(&mut self) -> ParseResult<Message> {
        self.pos += 1; // `message`
        let name = self.expect_ident()?;
        self.expect_symbol('{')?;
        let mut items = Vec::new();
        loop {
            let token = match self.peek() {
                Some(token) => token.clone(),
                None => return self.error(format!("unterminated message '{}'", name)),
            };
            match token {
                Token::Symbol('}') => {
                    self.pos += 1;
                    break;
                }
                Token::Symbol(';') => self.pos += 1,
                Token::Ident(word) => match word.as_str() {
                    "message" => items.push(MessageItem::Message(self.message()?)),
                    "enum" => items.push(MessageItem::Enum(self.enum_def()?)),
                    "oneof" => items.push(MessageItem::Oneof(self.oneof()?)),
                    "reserved" => items.push(MessageItem::Reserved(self.reserved()?)),
                    "option" => items.push(MessageItem::Option(self.option()?)),
                    "extensions" => {
                        self.pos += 1;
                        let ranges = self.tokens_until(';')?;
                        self.expect_symbol(';')?;
                        items.push(MessageItem::Opaque(format!("extensions {};", ranges)));
                    }
                    "extend" => {
                        self.pos += 1;
                        let target = self.expect_ident()?;
                        let body = self.block()?;
                        items.push(MessageItem::Opaque(format!("extend {} {{ {} }}", target, body)));
                    }
                    "group" => return self.error("groups are not supported"),
                    _ => items.push(MessageItem::Field(self.field()?)),
                },
                other => return self.error(format!("unexpected '{}' in message '{}'", other.text(), name)),
            }
        }
        Ok(Message { name, items })
    }

    fn field(&mut self) -> ParseResult<Field> {
        let label = if self.at_ident("repeated") {
            self.pos += 1;
            Label::Repeated
        } else if self.at_ident("optional") {
            self.pos += 1;
            Label::Optional
        } else if self.at_ident("required") {
            self.pos += 1;
            Label::Required
        } else {
            Label::Implicit
        };

        let ty = if self.at_ident("map") && self.tokens.get(self.pos + 1).map(|(t, _)| t) == Some(&Token::Symbol('<')) {
            if label != Label::Implicit {
                return self.error("map fields cannot have a label");
            }
            self.pos += 2;
            let key = self.expect_ident()?;
            self.expect_symbol(',')?;
            let value = self.expect_ident()?;
            self.expect_symbol('>')?;
            if !SCALARS.contains(&key.as_str()) || matches!(key.as_str(), "double" | "float" | "bytes") {
                return self.error(format!("invalid map key type '{}'", key));
            }
            FieldType::Map { key, value }
        } else {
            FieldType::Named(self.expect_ident()?)
        };

        let name = self.expect_ident()?;
        self.expect_symbol('=')?;
        let number = self.field_number()?;
        let options = if self.eat_symbol('[') {
            let options = self.tokens_until(']')?;
            self.expect_symbol(']')?;
            Some(options)
        } else {
            None
        };
        self.expect_symbol(';')?;
        Ok(Field {
            label,
            ty,
            name,
            number,
            options,
        })
    }

    fn oneof(&mut self) -> ParseResult<Oneof> {
        self.pos += 1; // `oneof`
        let name = self.expect_ident()?;
        self.expect_symbol('{')?;
        let mut oneof = Oneof {
            name,
            options: Vec::new(),
            fields: Vec::new(),
        };
        loop {
            if self.eat_symbol('}') {
                break;
            }
            if self.eat_symbol(';') {
                continue;
            }
            if self.at_ident("option") {
                oneof.options.push(self.option()?);
                continue;
            }
            if self.peek().is_none() {
                return self.error(format!("unterminated oneof '{}'", oneof.name));
            }
            let field = self.field()?;
            if field.label == Label::Repeated || matches!(field.ty, FieldType::Map { .. }) {
                return self.error(format!("oneof '{}' cannot contain repeated or map fields", oneof.name));
            }
            oneof.fields.push(field);
        }
        Ok(oneof)
    }

    fn reserved(&mut self) -> ParseResult<Reserved> {
        self.pos += 1; // `reserved`
        if matches!(self.peek(), Some(Token::Str(_)) | Some(Token::Ident(_))) {
            let mut names = Vec::new();
            loop {
                match self.next()? {
                    Token::Str(s) | Token::Ident(s) => names.push(s),
                    other => return self.error(format!("expected reserved name, found '{}'", other.text())),
                }
                if !self.eat_symbol(',') {
                    break;
                }
            }
            self.expect_symbol(';')?;
            return Ok(Reserved::Names(names));
        }

        let mut ranges = Vec::new();
        loop {
            let lo = self.expect_int()?;
            let hi = if self.at_ident("to") {
                self.pos += 1;
                if self.at_ident("max") {
                    self.pos += 1;
                    i64::from(MAX_FIELD_NUMBER)
                } else {
                    self.expect_int()?
                }
            } else {
                lo
            };
            if lo < 0 || hi < lo || hi > i64::from(u32::MAX) {
                return self.error(format!("invalid reserved range {} to {}", lo, hi));
            }
            ranges.push((lo as u32, hi as u32));
            if !self.eat_symbol(',') {
                break;
            }
        }
        self.expect_symbol(';')?;
        Ok(Reserved::Numbers(ranges))
    }

    fn enum_def(&mut self) -> ParseResult<EnumDef> {
        self.pos += 1; // `enum`
        let name = self.expect_ident()?;
        self.expect_symbol('{')?;
        let mut def = EnumDef {
            name,
            options: Vec::new(),
            values: Vec::new(),
            reserved: Vec::new(),
        };
        loop {
            if self.eat_symbol('}') {
                break;
            }
            if self.eat_symbol(';') {
                continue;
            }
            if self.at_ident("option") {
                def.options.push(self.option()?);
                continue;
            }
            if self.at_ident("reserved") {
                def.reserved.push(self.reserved()?);
                continue;
            }
            if self.peek().is_none() {
                return self.error(format!("unterminated enum '{}'", def.name));
            }
            let value_name = self.expect_ident()?;
            self.expect_symbol('=')?;
            let number = self.expect_int()?;
            let options = if self.eat_symbol('[') {
                let options = self.tokens_until(']')?;
                self.expect_symbol(']')?;
                Some(options)
            } else {
                None
            };
            self.expect_symbol(';')?;
            def.values.push(EnumValue {
                name: value_name,
                number,
                options,
            });
        }
        if def.values.is_empty() {
            return self.error(format!("enum '{}' has no values", def.name));
        }
        Ok(def)
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse().ok()?
    };
    Some(if negative { -value } else { value })
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

impl ProtoFile {
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        let mut parser = Parser {
            tokens: tokenize(text)?,
            pos: 0,
        };
        let file = parser.file()?;
        file.check_numbers()?;
        Ok(file)
    }

    /// Normalized text: one declaration per line, two-space indentation,
    /// no comments. Equal files render to equal text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some((keyword, value)) = &self.syntax {
            let _ = writeln!(out, "{} = \"{}\";", keyword, value);
        }
        if let Some(package) = &self.package {
            let _ = writeln!(out, "package {};", package);
        }
        for import in &self.imports {
            match &import.modifier {
                Some(modifier) => {
                    let _ = writeln!(out, "import {} \"{}\";", modifier, import.path);
                }
                None => {
                    let _ = writeln!(out, "import \"{}\";", import.path);
                }
            }
        }
        for option in &self.options {
            render_option(&mut out, option, 0);
        }
        for item in &self.items {
            match item {
                TopItem::Message(message) => render_message(&mut out, message, 0),
                TopItem::Enum(def) => render_enum(&mut out, def, 0),
                TopItem::Opaque { keyword, name, body } => {
                    let _ = writeln!(out, "{} {} {{ {} }}", keyword, name, body);
                }
            }
        }
        out
    }

    fn check_numbers(&self) -> Result<(), FormatError> {
        fn check(message: &Message) -> Result<(), FormatError> {
            let mut seen = BTreeSet::new();
            let mut numbers = Vec::new();
            for item in &message.items {
                match item {
                    MessageItem::Field(field) => numbers.push((field.name.as_str(), field.number)),
                    MessageItem::Oneof(oneof) => {
                        numbers.extend(oneof.fields.iter().map(|f| (f.name.as_str(), f.number)));
                    }
                    MessageItem::Message(nested) => check(nested)?,
                    _ => {}
                }
            }
            for (name, number) in numbers {
                if !seen.insert(number) {
                    return Err(FormatError::Protobuf {
                        line: 0,
                        message: format!(
                            "field '{}' reuses number {} in message '{}'",
                            name, number, message.name
                        ),
                    });
                }
            }
            Ok(())
        }
        for item in &self.items {
            if let TopItem::Message(message) = item {
                check(message)?;
            }
        }
        Ok(())
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn render_option(out: &mut String, option: &OptionDecl, depth: usize) {
    indent(out, depth);
    let _ = writeln!(out, "option {} = {};", option.name, option.value);
}

fn render_field(out: &mut String, field: &Field, depth: usize) {
    indent(out, depth);
    if let Some(label) = field.label.keyword() {
        out.push_str(label);
        out.push(' ');
    }
    match &field.ty {
        FieldType::Named(name) => out.push_str(name),
        FieldType::Map { key, value } => {
            let _ = write!(out, "map<{}, {}>", key, value);
        }
    }
    let _ = write!(out, " {} = {}", field.name, field.number);
    if let Some(options) = &field.options {
        let _ = write!(out, " [{}]", options);
    }
    out.push_str(";\n");
}

fn render_reserved(out: &mut String, reserved: &Reserved, depth: usize) {
    indent(out, depth);
    match reserved {
        Reserved::Numbers(ranges) => {
            let parts: Vec<String> = ranges
                .iter()
                .map(|(lo, hi)| if lo == hi { lo.to_string() } else { format!("{} to {}", lo, hi) })
                .collect();
            let _ = writeln!(out, "reserved {};", parts.join(", "));
        }
        Reserved::Names(names) => {
            let parts: Vec<String> = names.iter().map(|n| format!("\"{}\"", n)).collect();
            let _ = writeln!(out, "reserved {};", parts.join(", "));
        }
    }
}

fn render_message(out: &mut String, message: &Message, depth: usize) {
    indent(out, depth);
    let _ = writeln!(out, "message {} {{", message.name);
    for item in &message.items {
        match item {
            MessageItem::Field(field) => render_field(out, field, depth + 1),
            MessageItem::Oneof(oneof) => {
                indent(out, depth + 1);
                let _ = writeln!(out, "oneof {} {{", oneof.name);
                for option in &oneof.options {
                    render_option(out, option, depth + 2);
                }
                for field in &oneof.fields {
                    render_field(out, field, depth + 2);
                }
                indent(out, depth + 1);
                out.push_str("}\n");
            }
            MessageItem::Message(nested) => render_message(out, nested, depth + 1),
            MessageItem::Enum(def) => render_enum(out, def, depth + 1),
            MessageItem::Reserved(reserved) => render_reserved(out, reserved, depth + 1),
            MessageItem::Option(option) => render_option(out, option, depth + 1),
            MessageItem::Opaque(text) => {
                indent(out, depth + 1);
                out.push_str(text);
                out.push('\n');
            }
        }
    }
    indent(out, depth);
    out.push_str("}\n");
}

fn render_enum(out: &mut String, def: &EnumDef, depth: usize) {
    indent(out, depth);
    let _ = writeln!(out, "enum {} {{", def.name);
    for option in &def.options {
        render_option(out, option, depth + 1);
    }
    for reserved in &def.reserved {
        render_reserved(out, reserved, depth + 1);
    }
    for value in &def.values {
        indent(out, depth + 1);
        let _ = write!(out, "{} = {}", value.name, value.number);
        if let Some(options) = &value.options {
            let _ = write!(out, " [{}]", options);
        }
        out.push_str(";\n");
    }
    indent(out, depth);
    out.push_str("}\n");
}
