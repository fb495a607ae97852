// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

///
/// AMQP 1.0 type constructors.
///
/// Decoding understands every width of every primitive; encoding always picks the
/// most compact form (except inside arrays, where all elements share one wide
/// constructor).
pub mod constructor {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const UINT_0: u8 = 0x43;
    pub const ULONG_0: u8 = 0x44;
    pub const LIST_0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const SMALL_INT: u8 = 0x54;
    pub const SMALL_LONG: u8 = 0x55;
    pub const BOOLEAN: u8 = 0x56;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const DECIMAL32: u8 = 0x74;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const DECIMAL64: u8 = 0x84;
    pub const DECIMAL128: u8 = 0x94;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

use constructor as c;

/// An AMQP symbol, an ASCII string used for condition names, capabilities and keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol(value.to_string())
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol(value)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any AMQP encoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal32([u8; 4]),
    Decimal64([u8; 8]),
    Decimal128([u8; 16]),
    Char(char),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
    Binary(Bytes),
    String(String),
    Symbol(Symbol),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Array(Vec<Value>),
    Described(Box<Value>, Box<Value>),
}

macro_rules! value_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Value {
            fn from(value: $type) -> Self {
                Value::$variant(value)
            }
        }
    };
}

value_from!(bool, Bool);
value_from!(u8, Ubyte);
value_from!(u16, Ushort);
value_from!(u32, Uint);
value_from!(u64, Ulong);
value_from!(i32, Int);
value_from!(i64, Long);
value_from!(Bytes, Binary);
value_from!(String, String);
value_from!(Symbol, Symbol);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Deepest nesting of described, compound and array values accepted on decode.
const MAX_NESTING: usize = 32;

fn need(buffer: &impl Buf, n: usize, what: &str) -> AppResult<()> {
    if buffer.remaining() < n {
        return Err(AppError::MalformedProtocol(format!(
            "can not read a {}: {} bytes needed, {} left",
            what,
            n,
            buffer.remaining()
        )));
    }
    Ok(())
}

fn read_fixed<const N: usize>(buffer: &mut impl Buf, what: &str) -> AppResult<[u8; N]> {
    need(buffer, N, what)?;
    let mut bytes = [0u8; N];
    buffer.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn read_sized(buffer: &mut impl Buf, size: usize, what: &str) -> AppResult<Bytes> {
    need(buffer, size, what)?;
    Ok(buffer.copy_to_bytes(size))
}

fn read_utf8(bytes: Bytes, what: &str) -> AppResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("invalid utf-8 in {}: {}", what, e)))
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Reads one value, constructor included.
    pub fn decode(buffer: &mut impl Buf) -> AppResult<Value> {
        Value::decode_nested(buffer, 0)
    }

    fn decode_nested(buffer: &mut impl Buf, depth: usize) -> AppResult<Value> {
        if depth > MAX_NESTING {
            return Err(AppError::MalformedProtocol(format!(
                "value nested deeper than {} levels",
                MAX_NESTING
            )));
        }
        need(buffer, 1, "constructor")?;
        let code = buffer.get_u8();
        if code == c::DESCRIBED {
            let descriptor = Value::decode_nested(buffer, depth + 1)?;
            let value = Value::decode_nested(buffer, depth + 1)?;
            return Ok(Value::Described(Box::new(descriptor), Box::new(value)));
        }
        Value::decode_body(code, buffer, depth)
    }

    fn decode_body(code: u8, buffer: &mut impl Buf, depth: usize) -> AppResult<Value> {
        let value = match code {
            c::NULL => Value::Null,
            c::TRUE => Value::Bool(true),
            c::FALSE => Value::Bool(false),
            c::BOOLEAN => {
                need(buffer, 1, "boolean")?;
                match buffer.get_u8() {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    other => {
                        return Err(AppError::MalformedProtocol(format!(
                            "invalid boolean byte {:#04x}",
                            other
                        )))
                    }
                }
            }
            c::UBYTE => Value::Ubyte(u8::from_be_bytes(read_fixed(buffer, "ubyte")?)),
            c::BYTE => Value::Byte(i8::from_be_bytes(read_fixed(buffer, "byte")?)),
            c::USHORT => Value::Ushort(u16::from_be_bytes(read_fixed(buffer, "ushort")?)),
            c::SHORT => Value::Short(i16::from_be_bytes(read_fixed(buffer, "short")?)),
            c::UINT_0 => Value::Uint(0),
            c::SMALL_UINT => Value::Uint(u8::from_be_bytes(read_fixed(buffer, "uint")?) as u32),
            c::UINT => Value::Uint(u32::from_be_bytes(read_fixed(buffer, "uint")?)),
            c::ULONG_0 => Value::Ulong(0),
            c::SMALL_ULONG => {
                Value::Ulong(u8::from_be_bytes(read_fixed(buffer, "ulong")?) as u64)
            }
            c::ULONG => Value::Ulong(u64::from_be_bytes(read_fixed(buffer, "ulong")?)),
            c::SMALL_INT => Value::Int(i8::from_be_bytes(read_fixed(buffer, "int")?) as i32),
            c::INT => Value::Int(i32::from_be_bytes(read_fixed(buffer, "int")?)),
            c::SMALL_LONG => Value::Long(i8::from_be_bytes(read_fixed(buffer, "long")?) as i64),
            c::LONG => Value::Long(i64::from_be_bytes(read_fixed(buffer, "long")?)),
            c::FLOAT => Value::Float(f32::from_be_bytes(read_fixed(buffer, "float")?)),
            c::DOUBLE => Value::Double(f64::from_be_bytes(read_fixed(buffer, "double")?)),
            c::DECIMAL32 => Value::Decimal32(read_fixed(buffer, "decimal32")?),
            c::DECIMAL64 => Value::Decimal64(read_fixed(buffer, "decimal64")?),
            c::DECIMAL128 => Value::Decimal128(read_fixed(buffer, "decimal128")?),
            c::CHAR => {
                let scalar = u32::from_be_bytes(read_fixed(buffer, "char")?);
                Value::Char(char::from_u32(scalar).ok_or_else(|| {
                    AppError::MalformedProtocol(format!("invalid char {:#x}", scalar))
                })?)
            }
            c::TIMESTAMP => Value::Timestamp(i64::from_be_bytes(read_fixed(buffer, "timestamp")?)),
            c::UUID => Value::Uuid(read_fixed(buffer, "uuid")?),
            c::VBIN8 | c::VBIN32 | c::STR8 | c::STR32 | c::SYM8 | c::SYM32 => {
                let size = Value::read_size(code, buffer)?;
                let bytes = read_sized(buffer, size, "variable width value")?;
                match code {
                    c::VBIN8 | c::VBIN32 => Value::Binary(bytes),
                    c::STR8 | c::STR32 => Value::String(read_utf8(bytes, "string")?),
                    _ => Value::Symbol(Symbol(read_utf8(bytes, "symbol")?)),
                }
            }
            c::LIST_0 => Value::List(Vec::new()),
            c::LIST8 | c::LIST32 | c::MAP8 | c::MAP32 => {
                let size = Value::read_size(code, buffer)?;
                let mut body = read_sized(buffer, size, "compound value")?;
                let count = Value::read_count(code, &mut body)?;
                // every element takes at least its constructor byte
                if count > body.remaining() {
                    return Err(AppError::MalformedProtocol(format!(
                        "compound value claims {} elements in {} bytes",
                        count,
                        body.remaining()
                    )));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Value::decode_nested(&mut body, depth + 1)?);
                }
                if code == c::MAP8 || code == c::MAP32 {
                    if count % 2 != 0 {
                        return Err(AppError::MalformedProtocol(format!(
                            "map with odd element count {}",
                            count
                        )));
                    }
                    let mut pairs = Vec::with_capacity(count / 2);
                    let mut items = items.into_iter();
                    while let (Some(key), Some(value)) = (items.next(), items.next()) {
                        pairs.push((key, value));
                    }
                    Value::Map(pairs)
                } else {
                    Value::List(items)
                }
            }
            c::ARRAY8 | c::ARRAY32 => {
                let size = Value::read_size(code, buffer)?;
                let mut body = read_sized(buffer, size, "array")?;
                let count = Value::read_count(code, &mut body)?;
                // zero-width elements still count against the declared size
                if count > size {
                    return Err(AppError::MalformedProtocol(format!(
                        "array claims {} elements in {} bytes",
                        count, size
                    )));
                }
                Value::Array(Value::decode_array_elements(count, &mut body, depth + 1)?)
            }
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown type constructor {:#04x}",
                    other
                )))
            }
        };
        Ok(value)
    }

    fn decode_array_elements(
        count: usize,
        body: &mut Bytes,
        depth: usize,
    ) -> AppResult<Vec<Value>> {
        need(body, 1, "array constructor")?;
        let code = body.get_u8();
        let mut elements = Vec::with_capacity(count);
        if code == c::DESCRIBED {
            let descriptor = Value::decode_nested(body, depth + 1)?;
            need(body, 1, "array constructor")?;
            let inner = body.get_u8();
            for _ in 0..count {
                let value = Value::decode_body(inner, body, depth + 1)?;
                elements.push(Value::Described(
                    Box::new(descriptor.clone()),
                    Box::new(value),
                ));
            }
        } else {
            for _ in 0..count {
                elements.push(Value::decode_body(code, body, depth + 1)?);
            }
        }
        Ok(elements)
    }

    fn read_size(code: u8, buffer: &mut impl Buf) -> AppResult<usize> {
        // one-byte widths live in 0xa_/0xc_/0xe_, four-byte widths in 0xb_/0xd_/0xf_
        if code & 0x10 == 0 {
            need(buffer, 1, "size")?;
            Ok(buffer.get_u8() as usize)
        } else {
            need(buffer, 4, "size")?;
            Ok(buffer.get_u32() as usize)
        }
    }

    fn read_count(code: u8, body: &mut Bytes) -> AppResult<usize> {
        Value::read_size(code, body)
    }

    /// Writes the value using the most compact constructor.
    pub fn encode(&self, writer: &mut BytesMut) {
        match self {
            Value::Null => writer.put_u8(c::NULL),
            Value::Bool(true) => writer.put_u8(c::TRUE),
            Value::Bool(false) => writer.put_u8(c::FALSE),
            Value::Uint(0) => writer.put_u8(c::UINT_0),
            Value::Uint(v) if *v <= u8::MAX as u32 => {
                writer.put_u8(c::SMALL_UINT);
                writer.put_u8(*v as u8);
            }
            Value::Ulong(0) => writer.put_u8(c::ULONG_0),
            Value::Ulong(v) if *v <= u8::MAX as u64 => {
                writer.put_u8(c::SMALL_ULONG);
                writer.put_u8(*v as u8);
            }
            Value::Int(v) if i8::try_from(*v).is_ok() => {
                writer.put_u8(c::SMALL_INT);
                writer.put_i8(*v as i8);
            }
            Value::Long(v) if i8::try_from(*v).is_ok() => {
                writer.put_u8(c::SMALL_LONG);
                writer.put_i8(*v as i8);
            }
            Value::Binary(bytes) if bytes.len() <= u8::MAX as usize => {
                writer.put_u8(c::VBIN8);
                writer.put_u8(bytes.len() as u8);
                writer.put_slice(bytes);
            }
            Value::String(s) if s.len() <= u8::MAX as usize => {
                writer.put_u8(c::STR8);
                writer.put_u8(s.len() as u8);
                writer.put_slice(s.as_bytes());
            }
            Value::Symbol(s) if s.0.len() <= u8::MAX as usize => {
                writer.put_u8(c::SYM8);
                writer.put_u8(s.0.len() as u8);
                writer.put_slice(s.0.as_bytes());
            }
            Value::List(items) if items.is_empty() => writer.put_u8(c::LIST_0),
            Value::List(items) => {
                let mut body = BytesMut::new();
                items.iter().for_each(|item| item.encode(&mut body));
                Value::put_compound(writer, c::LIST8, c::LIST32, items.len(), &body);
            }
            Value::Map(pairs) => {
                let mut body = BytesMut::new();
                for (key, value) in pairs {
                    key.encode(&mut body);
                    value.encode(&mut body);
                }
                Value::put_compound(writer, c::MAP8, c::MAP32, pairs.len() * 2, &body);
            }
            Value::Array(elements) => {
                let mut body = BytesMut::new();
                match elements.first() {
                    Some(first) => {
                        first.put_array_constructor(&mut body);
                        for element in elements {
                            debug_assert_eq!(
                                std::mem::discriminant(element),
                                std::mem::discriminant(first),
                                "heterogeneous array"
                            );
                            element.put_wide_body(&mut body);
                        }
                    }
                    None => body.put_u8(c::NULL),
                }
                Value::put_compound(writer, c::ARRAY8, c::ARRAY32, elements.len(), &body);
            }
            Value::Described(descriptor, value) => {
                writer.put_u8(c::DESCRIBED);
                descriptor.encode(writer);
                value.encode(writer);
            }
            other => {
                writer.put_u8(other.wide_constructor());
                other.put_wide_body(writer);
            }
        }
    }

    fn put_compound(writer: &mut BytesMut, narrow: u8, wide: u8, count: usize, body: &[u8]) {
        if body.len() < u8::MAX as usize && count <= u8::MAX as usize {
            writer.put_u8(narrow);
            writer.put_u8(body.len() as u8 + 1);
            writer.put_u8(count as u8);
        } else {
            writer.put_u8(wide);
            writer.put_u32(body.len() as u32 + 4);
            writer.put_u32(count as u32);
        }
        writer.put_slice(body);
    }

    fn put_array_constructor(&self, writer: &mut BytesMut) {
        match self {
            Value::Described(descriptor, value) => {
                writer.put_u8(c::DESCRIBED);
                descriptor.encode(writer);
                value.put_array_constructor(writer);
            }
            other => writer.put_u8(other.wide_constructor()),
        }
    }

    fn wide_constructor(&self) -> u8 {
        match self {
            Value::Null => c::NULL,
            Value::Bool(_) => c::BOOLEAN,
            Value::Ubyte(_) => c::UBYTE,
            Value::Ushort(_) => c::USHORT,
            Value::Uint(_) => c::UINT,
            Value::Ulong(_) => c::ULONG,
            Value::Byte(_) => c::BYTE,
            Value::Short(_) => c::SHORT,
            Value::Int(_) => c::INT,
            Value::Long(_) => c::LONG,
            Value::Float(_) => c::FLOAT,
            Value::Double(_) => c::DOUBLE,
            Value::Decimal32(_) => c::DECIMAL32,
            Value::Decimal64(_) => c::DECIMAL64,
            Value::Decimal128(_) => c::DECIMAL128,
            Value::Char(_) => c::CHAR,
            Value::Timestamp(_) => c::TIMESTAMP,
            Value::Uuid(_) => c::UUID,
            Value::Binary(_) => c::VBIN32,
            Value::String(_) => c::STR32,
            Value::Symbol(_) => c::SYM32,
            Value::List(_) => c::LIST32,
            Value::Map(_) => c::MAP32,
            Value::Array(_) => c::ARRAY32,
            Value::Described(..) => c::DESCRIBED,
        }
    }

    /// Body matching [`Value::wide_constructor`], without the constructor byte.
    fn put_wide_body(&self, writer: &mut BytesMut) {
        match self {
            Value::Null => {}
            Value::Bool(v) => writer.put_u8(*v as u8),
            Value::Ubyte(v) => writer.put_u8(*v),
            Value::Ushort(v) => writer.put_u16(*v),
            Value::Uint(v) => writer.put_u32(*v),
            Value::Ulong(v) => writer.put_u64(*v),
            Value::Byte(v) => writer.put_i8(*v),
            Value::Short(v) => writer.put_i16(*v),
            Value::Int(v) => writer.put_i32(*v),
            Value::Long(v) => writer.put_i64(*v),
            Value::Float(v) => writer.put_f32(*v),
            Value::Double(v) => writer.put_f64(*v),
            Value::Decimal32(v) => writer.put_slice(v),
            Value::Decimal64(v) => writer.put_slice(v),
            Value::Decimal128(v) => writer.put_slice(v),
            Value::Char(v) => writer.put_u32(*v as u32),
            Value::Timestamp(v) => writer.put_i64(*v),
            Value::Uuid(v) => writer.put_slice(v),
            Value::Binary(v) => {
                writer.put_u32(v.len() as u32);
                writer.put_slice(v);
            }
            Value::String(v) => {
                writer.put_u32(v.len() as u32);
                writer.put_slice(v.as_bytes());
            }
            Value::Symbol(v) => {
                writer.put_u32(v.0.len() as u32);
                writer.put_slice(v.0.as_bytes());
            }
            Value::List(_) | Value::Map(_) | Value::Array(_) => {
                // compound bodies always carry their four-byte size and count
                let mut encoded = BytesMut::new();
                self.encode(&mut encoded);
                let code = encoded[0];
                if code == c::LIST_0 {
                    writer.put_u32(4);
                    writer.put_u32(0);
                } else if code & 0x10 == 0 {
                    // widen the narrow header produced by encode()
                    let count = encoded[2] as u32;
                    let body = &encoded[3..];
                    writer.put_u32(body.len() as u32 + 4);
                    writer.put_u32(count);
                    writer.put_slice(body);
                } else {
                    writer.put_slice(&encoded[1..]);
                }
            }
            Value::Described(_, value) => value.put_wide_body(writer),
        }
    }
}

/// Builds a described list `0x00 0x53 <code> list`, dropping trailing nulls as the
/// wire format allows.
pub fn described_list(code: u64, mut fields: Vec<Value>) -> Value {
    while fields.last().is_some_and(Value::is_null) {
        fields.pop();
    }
    Value::Described(Box::new(Value::Ulong(code)), Box::new(Value::List(fields)))
}

/// Splits a described value into its numeric descriptor and inner value.
///
/// Symbolic descriptors are not used by any type this engine decodes.
pub fn split_described(value: Value) -> AppResult<(u64, Value)> {
    match value {
        Value::Described(descriptor, inner) => match *descriptor {
            Value::Ulong(code) => Ok((code, *inner)),
            other => Err(AppError::MalformedProtocol(format!(
                "unsupported descriptor {:?}",
                other
            ))),
        },
        other => Err(AppError::MalformedProtocol(format!(
            "expected a described type, found {:?}",
            other
        ))),
    }
}

///
/// Sequential reader over the fields of a described list.
///
/// Missing trailing fields read as null, so each accessor returns `None` and the
/// caller applies the field's documented default.
#[derive(Debug)]
pub struct Fields {
    type_name: &'static str,
    values: std::vec::IntoIter<Value>,
}

macro_rules! field_accessor {
    ($name:ident, $variant:ident, $type:ty) => {
        pub fn $name(&mut self, field: &str) -> AppResult<Option<$type>> {
            match self.next_value() {
                Value::Null => Ok(None),
                Value::$variant(value) => Ok(Some(value)),
                other => Err(self.mismatch(field, stringify!($type), &other)),
            }
        }
    };
}

impl Fields {
    pub fn new(type_name: &'static str, value: Value) -> AppResult<Fields> {
        match value {
            Value::List(values) => Ok(Fields {
                type_name,
                values: values.into_iter(),
            }),
            other => Err(AppError::MalformedProtocol(format!(
                "{} body is not a list: {:?}",
                type_name, other
            ))),
        }
    }

    pub fn next_value(&mut self) -> Value {
        self.values.next().unwrap_or(Value::Null)
    }

    field_accessor!(bool, Bool, bool);
    field_accessor!(ubyte, Ubyte, u8);
    field_accessor!(ushort, Ushort, u16);
    field_accessor!(uint, Uint, u32);
    field_accessor!(ulong, Ulong, u64);
    field_accessor!(string, String, String);
    field_accessor!(symbol, Symbol, Symbol);
    field_accessor!(binary, Binary, Bytes);
    field_accessor!(map, Map, Vec<(Value, Value)>);

    /// A mandatory field read with one of the accessors above; null is a decode error.
    pub fn mandatory<T>(
        &mut self,
        field: &str,
        read: fn(&mut Fields, &str) -> AppResult<Option<T>>,
    ) -> AppResult<T> {
        read(self, field)?.ok_or_else(|| {
            AppError::MalformedProtocol(format!(
                "mandatory field {}.{} is missing",
                self.type_name, field
            ))
        })
    }

    /// A `multiple="true"` symbol field: null, a single symbol or an array of symbols.
    pub fn symbols(&mut self, field: &str) -> AppResult<Vec<Symbol>> {
        match self.next_value() {
            Value::Null => Ok(Vec::new()),
            Value::Symbol(symbol) => Ok(vec![symbol]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Symbol(symbol) => Ok(symbol),
                    other => Err(self.mismatch(field, "symbol", &other)),
                })
                .collect(),
            other => Err(self.mismatch(field, "symbol[]", &other)),
        }
    }

    fn mismatch(&self, field: &str, expected: &str, found: &Value) -> AppError {
        AppError::MalformedProtocol(format!(
            "{}.{}: expected {}, found {:?}",
            self.type_name, field, expected, found
        ))
    }
}

/// Encodes a `multiple="true"` symbol field; empty becomes null.
pub fn symbols_value(symbols: &[Symbol]) -> Value {
    if symbols.is_empty() {
        Value::Null
    } else {
        Value::Array(symbols.iter().cloned().map(Value::Symbol).collect())
    }
}

/// Encodes an optional map field.
pub fn map_value(map: &Option<Vec<(Value, Value)>>) -> Value {
    map.as_ref().map_or(Value::Null, |pairs| Value::Map(pairs.clone()))
}
