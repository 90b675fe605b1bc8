//! Self-describing key/value record format used for world metadata and player data
//! (spec.md §6). A single tagged-value scheme serves both files instead of maintaining
//! two bespoke serializers.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::io::{ReadExt, WriteExt};

const TAG_END: u8 = 0;
const TAG_I64: u8 = 1;
const TAG_F32: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_STR: u8 = 5;
const TAG_BYTES: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_MAP: u8 = 8;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unrecognized value tag {0}")]
    IllegalTag(u8),
}

/// A value inside a record tree. Deliberately small: the formats this crate persists
/// (world metadata, player data) never need more than scalars, strings, byte blobs,
/// and nested lists/maps of the same.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Record),
}

/// An ordered key/value map, the top-level shape of both the world metadata file and
/// the player data file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    entries: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.entries.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        match self.get(key) {
            Some(Value::F32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(Value::F64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Value::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_map(&self, key: &str) -> Option<&Record> {
        match self.get(key) {
            Some(Value::Map(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_list(&self, key: &str) -> Option<&[Value]> {
        match self.get(key) {
            Some(Value::List(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), RecordError> {
        for (key, value) in &self.entries {
            writer.write_u8_be(tag_of(value))?;
            writer.write_str(key)?;
            write_value(writer, value)?;
        }
        writer.write_u8_be(TAG_END)?;
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self, RecordError> {
        read_record_body(reader)
    }
}

fn tag_of(value: &Value) -> u8 {
    match value {
        Value::I64(_) => TAG_I64,
        Value::F32(_) => TAG_F32,
        Value::F64(_) => TAG_F64,
        Value::Bool(_) => TAG_BOOL,
        Value::Str(_) => TAG_STR,
        Value::Bytes(_) => TAG_BYTES,
        Value::List(_) => TAG_LIST,
        Value::Map(_) => TAG_MAP,
    }
}

fn write_value(writer: &mut impl Write, value: &Value) -> Result<(), RecordError> {
    match value {
        Value::I64(v) => writer.write_i64_be(*v)?,
        Value::F32(v) => writer.write_f32_be(*v)?,
        Value::F64(v) => writer.write_f64_be(*v)?,
        Value::Bool(v) => writer.write_u8_be(*v as u8)?,
        Value::Str(v) => writer.write_str(v)?,
        Value::Bytes(v) => {
            writer.write_u32_be(v.len() as u32)?;
            writer.write_all(v)?;
        }
        Value::List(items) => {
            writer.write_u32_be(items.len() as u32)?;
            for item in items {
                writer.write_u8_be(tag_of(item))?;
                write_value(writer, item)?;
            }
        }
        Value::Map(record) => record.write_to(writer)?,
    }
    Ok(())
}

fn read_value(reader: &mut impl Read, tag: u8) -> Result<Value, RecordError> {
    Ok(match tag {
        TAG_I64 => Value::I64(reader.read_i64_be()?),
        TAG_F32 => Value::F32(reader.read_f32_be()?),
        TAG_F64 => Value::F64(reader.read_f64_be()?),
        TAG_BOOL => Value::Bool(reader.read_u8_be()? != 0),
        TAG_STR => Value::Str(reader.read_str(u16::MAX as usize)?),
        TAG_BYTES => {
            let len = reader.read_u32_be()? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf)?;
            Value::Bytes(buf)
        }
        TAG_LIST => {
            let len = reader.read_u32_be()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                let item_tag = reader.read_u8_be()?;
                items.push(read_value(reader, item_tag)?);
            }
            Value::List(items)
        }
        TAG_MAP => Value::Map(read_record_body(reader)?),
        other => return Err(RecordError::IllegalTag(other)),
    })
}

fn read_record_body(reader: &mut impl Read) -> Result<Record, RecordError> {
    let mut record = Record::new();
    loop {
        let tag = reader.read_u8_be()?;
        if tag == TAG_END {
            return Ok(record);
        }
        let key = reader.read_str(u16::MAX as usize)?;
        let value = read_value(reader, tag)?;
        record.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_scalars_and_nesting() {
        let mut player = Record::new();
        player.insert("health", Value::I64(20));
        player.insert("flying", Value::Bool(false));

        let mut world = Record::new();
        world.insert("name", Value::Str("overworld".into()));
        world.insert("seed", Value::I64(-42));
        world.insert(
            "spawn",
            Value::List(vec![Value::F32(0.0), Value::F32(72.0), Value::F32(0.0)]),
        );
        world.insert("player", Value::Map(player));

        let mut buf = Vec::new();
        world.write_to(&mut buf).unwrap();

        let decoded = Record::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded.get_str("name"), Some("overworld"));
        assert_eq!(decoded.get_i64("seed"), Some(-42));
        assert_eq!(
            decoded.get_list("spawn"),
            Some(&[Value::F32(0.0), Value::F32(72.0), Value::F32(0.0)][..])
        );
        assert_eq!(decoded.get_map("player").and_then(|p| p.get_i64("health")), Some(20));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = vec![0xEE, 0, 1, b'a'];
        let err = Record::read_from(&mut Cursor::new(buf));
        assert!(matches!(err, Err(RecordError::IllegalTag(0xEE))));
    }
}
