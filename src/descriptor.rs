/// Type descriptors: bcc-style JSON descriptions of a key or leaf layout.
///
/// A descriptor is either a C scalar name (`"unsigned int"`), an array
/// (`["int", [4]]`, where an array of `char` is a C string), or a struct/union
/// (`["name", [["field", "type"], ["buf", "char", [16]]], "struct"]`).
/// Layout follows the LP64 C ABI. Records are native-endian.

use serde_json::Value;
use std::fmt::Write as _;

use crate::error::{Result, TableError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Int { signed: bool },
    Bool,
    Str,
    Array(Box<Layout>, usize),
    Record { fields: Vec<Field>, union: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    kind: Kind,
    size: usize,
    align: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    offset: usize,
    layout: Layout,
}

/// A parsed type description, able to scan text into a record and render a
/// record back into text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    desc: String,
    layout: Layout,
}

impl TypeDescriptor {
    /// Parse a JSON type description. A bare C type name without JSON
    /// quoting (`unsigned int`) is accepted too.
    pub fn parse(desc: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(desc) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::from_value(&Value::String(desc.trim().to_string())),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let layout = parse_type(value).map_err(TableError::Descriptor)?;
        Ok(Self {
            desc: value.to_string(),
            layout,
        })
    }

    /// The compact JSON text of this descriptor.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Record width in bytes.
    pub fn size(&self) -> usize {
        self.layout.size
    }

    pub fn align(&self) -> usize {
        self.layout.align
    }

    /// Parse `text` into `record`, which must be exactly `size()` bytes.
    /// Bytes not covered by a field (padding) are zeroed.
    pub fn scan(&self, text: &str, record: &mut [u8]) -> std::result::Result<(), String> {
        if record.len() != self.layout.size {
            return Err(format!(
                "record is {} bytes, type is {}",
                record.len(),
                self.layout.size
            ));
        }
        record.fill(0);
        let tokens = tokenize(text)?;
        let mut pos = 0;
        scan_into(&self.layout, &tokens, &mut pos, record)?;
        if pos != tokens.len() {
            return Err(format!("unexpected trailing input {}", tokens[pos]));
        }
        Ok(())
    }

    /// Render `record` as text.
    pub fn render(&self, record: &[u8]) -> std::result::Result<String, String> {
        if record.len() != self.layout.size {
            return Err(format!(
                "record is {} bytes, type is {}",
                record.len(),
                self.layout.size
            ));
        }
        let mut out = String::new();
        render_into(&self.layout, record, &mut out);
        Ok(out)
    }
}

fn int(size: usize, signed: bool) -> Layout {
    Layout {
        kind: Kind::Int { signed },
        size,
        align: size,
    }
}

fn scalar(name: &str) -> Option<Layout> {
    let layout = match name {
        "char" | "signed char" | "s8" | "i8" | "__s8" | "int8_t" => int(1, true),
        "unsigned char" | "u8" | "__u8" | "uint8_t" => int(1, false),
        "_Bool" | "bool" => Layout {
            kind: Kind::Bool,
            size: 1,
            align: 1,
        },
        "short" | "short int" | "signed short" | "s16" | "i16" | "__s16" | "int16_t" => {
            int(2, true)
        }
        "unsigned short" | "unsigned short int" | "u16" | "__u16" | "uint16_t" => int(2, false),
        "int" | "signed int" | "signed" | "s32" | "i32" | "__s32" | "int32_t" => int(4, true),
        "unsigned int" | "unsigned" | "u32" | "__u32" | "uint32_t" => int(4, false),
        "long" | "long int" | "signed long" | "long long" | "long long int" | "s64" | "i64"
        | "__s64" | "int64_t" => int(8, true),
        "unsigned long" | "unsigned long int" | "unsigned long long"
        | "unsigned long long int" | "u64" | "__u64" | "uint64_t" | "size_t" => int(8, false),
        _ => return None,
    };
    Some(layout)
}

/// Largest record a descriptor may describe; above what the kernel accepts
/// for any map key or value.
pub const MAX_RECORD_SIZE: usize = 1 << 22;

fn bounded(size: Option<usize>) -> std::result::Result<usize, String> {
    size.filter(|&size| size <= MAX_RECORD_SIZE)
        .ok_or_else(|| format!("type is larger than {MAX_RECORD_SIZE} bytes"))
}

fn align_up(offset: usize, align: usize) -> std::result::Result<usize, String> {
    bounded(offset.checked_next_multiple_of(align))
}

fn parse_dims(value: &Value) -> std::result::Result<Vec<usize>, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("array dimensions must be a list, got {value}"))?;
    if items.is_empty() {
        return Err("empty array dimension list".to_string());
    }
    items
        .iter()
        .map(|dim| match dim.as_u64() {
            Some(n) if n > 0 => {
                usize::try_from(n).map_err(|_| format!("array dimension {n} is too large"))
            }
            _ => Err(format!("invalid array dimension {dim}")),
        })
        .collect()
}

/// Wrap `elem` in arrays, outermost dimension first. The innermost
/// dimension of a `char` element becomes a string.
fn array_of(elem_value: &Value, dims: &[usize]) -> std::result::Result<Layout, String> {
    let mut dims = dims.to_vec();
    let mut layout = if elem_value.as_str() == Some("char") {
        let len = dims.pop().unwrap_or(1);
        Layout {
            kind: Kind::Str,
            size: bounded(Some(len))?,
            align: 1,
        }
    } else {
        parse_type(elem_value)?
    };
    for len in dims.into_iter().rev() {
        layout = Layout {
            size: bounded(layout.size.checked_mul(len))?,
            align: layout.align,
            kind: Kind::Array(Box::new(layout), len),
        };
    }
    Ok(layout)
}

fn parse_type(value: &Value) -> std::result::Result<Layout, String> {
    match value {
        Value::String(name) => scalar(name.trim()).ok_or_else(|| format!("unknown type {name:?}")),
        Value::Array(items) => {
            let is_dims = items.len() == 2
                && items[1]
                    .as_array()
                    .and_then(|dims| dims.first())
                    .is_some_and(Value::is_number);
            if is_dims {
                return array_of(&items[0], &parse_dims(&items[1])?);
            }
            match items.as_slice() {
                [Value::String(_), Value::Array(fields)] => parse_record(fields, false),
                [Value::String(_), Value::Array(fields), Value::String(tag)] => match tag.as_str() {
                    "struct" => parse_record(fields, false),
                    "union" => parse_record(fields, true),
                    other => Err(format!("unsupported aggregate kind {other:?}")),
                },
                _ => Err(format!("unrecognised type description {value}")),
            }
        }
        other => Err(format!("unrecognised type description {other}")),
    }
}

fn parse_record(items: &[Value], union: bool) -> std::result::Result<Layout, String> {
    if items.is_empty() {
        return Err("aggregate has no fields".to_string());
    }
    let mut fields = Vec::with_capacity(items.len());
    let mut end = 0;
    let mut align = 1;
    for item in items {
        let (name, layout) = match item.as_array().map(Vec::as_slice) {
            Some([Value::String(name), ty]) => (name.clone(), parse_type(ty)?),
            Some([Value::String(name), ty, dims @ Value::Array(_)]) => {
                (name.clone(), array_of(ty, &parse_dims(dims)?)?)
            }
            Some([Value::String(name), _, Value::Number(_)]) => {
                return Err(format!("bitfield {name:?} is not supported"));
            }
            _ => return Err(format!("malformed field {item}")),
        };
        align = align.max(layout.align);
        let offset = if union { 0 } else { align_up(end, layout.align)? };
        end = if union {
            end.max(layout.size)
        } else {
            bounded(offset.checked_add(layout.size))?
        };
        fields.push(Field {
            name,
            offset,
            layout,
        });
    }
    Ok(Layout {
        kind: Kind::Record { fields, union },
        size: align_up(end, align)?,
        align,
    })
}

fn read_int(bytes: &[u8], signed: bool) -> i128 {
    fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        out
    }
    match (bytes.len(), signed) {
        (1, false) => bytes[0] as i128,
        (1, true) => bytes[0] as i8 as i128,
        (2, false) => u16::from_ne_bytes(arr(bytes)) as i128,
        (2, true) => i16::from_ne_bytes(arr(bytes)) as i128,
        (4, false) => u32::from_ne_bytes(arr(bytes)) as i128,
        (4, true) => i32::from_ne_bytes(arr(bytes)) as i128,
        (8, false) => u64::from_ne_bytes(arr(bytes)) as i128,
        (8, true) => i64::from_ne_bytes(arr(bytes)) as i128,
        (other, _) => unreachable!("integer width {other}"),
    }
}

fn write_int(out: &mut [u8], value: i128) {
    match out.len() {
        1 => out.copy_from_slice(&(value as u8).to_ne_bytes()),
        2 => out.copy_from_slice(&(value as u16).to_ne_bytes()),
        4 => out.copy_from_slice(&(value as u32).to_ne_bytes()),
        8 => out.copy_from_slice(&(value as u64).to_ne_bytes()),
        other => unreachable!("integer width {other}"),
    }
}

fn parse_int(word: &str, size: usize, signed: bool) -> std::result::Result<i128, String> {
    let (negative, digits) = match word.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, word),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
            u128::from_str_radix(hex, 16).ok()
        }
        Some(_) => None,
        None if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
            digits.parse::<u128>().ok()
        }
        None => None,
    }
    .ok_or_else(|| format!("invalid integer literal {word:?}"))?;

    let bits = size as u32 * 8;
    let (min, max) = if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    };
    if magnitude > u64::MAX as u128 {
        return Err(format!("{word} is out of range [{min}, {max}]"));
    }
    let value = if negative {
        -(magnitude as i128)
    } else {
        magnitude as i128
    };
    if value < min || value > max {
        return Err(format!("{word} is out of range [{min}, {max}]"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open(char),
    Close(char),
    Quoted(Vec<u8>),
    Word(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Open(c) | Token::Close(c) => write!(f, "'{c}'"),
            Token::Quoted(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Token::Word(word) => write!(f, "{word:?}"),
        }
    }
}

fn tokenize(text: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '{' | '[' => {
                chars.next();
                tokens.push(Token::Open(c));
            }
            '}' | ']' => {
                chars.next();
                tokens.push(Token::Close(c));
            }
            '"' => {
                chars.next();
                tokens.push(Token::Quoted(read_quoted(&mut chars)?));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "{}[]\"".contains(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

fn read_quoted(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    loop {
        let c = chars.next().ok_or("unterminated string literal")?;
        match c {
            '"' => return Ok(out),
            '\\' => match chars.next().ok_or("unterminated escape")? {
                '\\' => out.push(b'\\'),
                '"' => out.push(b'"'),
                'n' => out.push(b'\n'),
                't' => out.push(b'\t'),
                'r' => out.push(b'\r'),
                '0' => out.push(0),
                'x' => {
                    let hi = chars.next().and_then(|c| c.to_digit(16));
                    let lo = chars.next().and_then(|c| c.to_digit(16));
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                        _ => return Err("malformed \\x escape".to_string()),
                    }
                }
                other => return Err(format!("unknown escape \\{other}")),
            },
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

fn next_token<'t>(tokens: &'t [Token], pos: &mut usize) -> std::result::Result<&'t Token, String> {
    let token = tokens.get(*pos).ok_or("unexpected end of input")?;
    *pos += 1;
    Ok(token)
}

fn expect_open(tokens: &[Token], pos: &mut usize, open: char) -> std::result::Result<(), String> {
    match next_token(tokens, pos)? {
        Token::Open(c) if *c == open => Ok(()),
        other => Err(format!("expected '{open}', found {other}")),
    }
}

fn expect_close(tokens: &[Token], pos: &mut usize, close: char) -> std::result::Result<(), String> {
    match next_token(tokens, pos)? {
        Token::Close(c) if *c == close => Ok(()),
        other => Err(format!("too many elements: expected '{close}', found {other}")),
    }
}

fn scan_into(
    layout: &Layout,
    tokens: &[Token],
    pos: &mut usize,
    out: &mut [u8],
) -> std::result::Result<(), String> {
    if let Some(Token::Close(c)) = tokens.get(*pos) {
        return Err(format!("too few elements before '{c}'"));
    }
    match &layout.kind {
        Kind::Int { signed } => match next_token(tokens, pos)? {
            Token::Word(word) => write_int(out, parse_int(word, layout.size, *signed)?),
            other => return Err(format!("expected integer, found {other}")),
        },
        Kind::Bool => match next_token(tokens, pos)? {
            Token::Word(word) => match word.as_str() {
                "0" | "false" => out[0] = 0,
                "1" | "true" => out[0] = 1,
                _ => return Err(format!("invalid boolean literal {word:?}")),
            },
            other => return Err(format!("expected boolean, found {other}")),
        },
        Kind::Str => match next_token(tokens, pos)? {
            Token::Quoted(bytes) => {
                if bytes.len() > layout.size {
                    return Err(format!(
                        "string of {} bytes does not fit char[{}]",
                        bytes.len(),
                        layout.size
                    ));
                }
                out[..bytes.len()].copy_from_slice(bytes);
                out[bytes.len()..].fill(0);
            }
            other => return Err(format!("expected quoted string, found {other}")),
        },
        Kind::Array(elem, len) => {
            expect_open(tokens, pos, '[')?;
            for chunk in out.chunks_exact_mut(elem.size).take(*len) {
                scan_into(elem, tokens, pos, chunk)?;
            }
            expect_close(tokens, pos, ']')?;
        }
        // Union members are written in order; the last one wins.
        Kind::Record { fields, .. } => {
            expect_open(tokens, pos, '{')?;
            for field in fields {
                let range = field.offset..field.offset + field.layout.size;
                scan_into(&field.layout, tokens, pos, &mut out[range])
                    .map_err(|reason| format!("field {}: {reason}", field.name))?;
            }
            expect_close(tokens, pos, '}')?;
        }
    }
    Ok(())
}

fn render_into(layout: &Layout, bytes: &[u8], out: &mut String) {
    match &layout.kind {
        Kind::Int { signed } => {
            let _ = write!(out, "{}", read_int(bytes, *signed));
        }
        Kind::Bool => out.push(if bytes[0] != 0 { '1' } else { '0' }),
        Kind::Str => {
            out.push('"');
            for &b in bytes.iter().take_while(|&&b| b != 0) {
                match b {
                    b'"' => out.push_str("\\\""),
                    b'\\' => out.push_str("\\\\"),
                    0x20..=0x7e => out.push(b as char),
                    _ => {
                        let _ = write!(out, "\\x{b:02x}");
                    }
                }
            }
            out.push('"');
        }
        Kind::Array(elem, _) => {
            out.push('[');
            for chunk in bytes.chunks_exact(elem.size) {
                out.push(' ');
                render_into(elem, chunk, out);
            }
            out.push_str(" ]");
        }
        Kind::Record { fields, .. } => {
            out.push('{');
            for field in fields {
                out.push(' ');
                render_into(
                    &field.layout,
                    &bytes[field.offset..field.offset + field.layout.size],
                    out,
                );
            }
            out.push_str(" }");
        }
    }
}
