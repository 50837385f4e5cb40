//! Column types, schemas and schema fingerprints.
//!
//! A schema fingerprint is the first 8 bytes (little-endian) of the SHA-256
//! digest of every field's `name_len:u32 LE ‖ name ‖ type_tag`, in order.
//! Nullability does not take part in the fingerprint.

use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

/// Physical column type with its wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Boolean = 1,
    Int32 = 2,
    Int64 = 3,
    UInt32 = 4,
    UInt64 = 5,
    Float32 = 6,
    Float64 = 7,
    Utf8 = 8,
    Binary = 9,
    /// Nanoseconds since the Unix epoch, stored as i64.
    TimestampNanos = 10,
}

impl DataType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => DataType::Boolean,
            2 => DataType::Int32,
            3 => DataType::Int64,
            4 => DataType::UInt32,
            5 => DataType::UInt64,
            6 => DataType::Float32,
            7 => DataType::Float64,
            8 => DataType::Utf8,
            9 => DataType::Binary,
            10 => DataType::TimestampNanos,
            _ => return None,
        })
    }

    /// Bytes per row for fixed-width types, `None` for variable-width ones.
    pub fn byte_width(self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(1),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 | DataType::TimestampNanos => {
                Some(8)
            }
            DataType::Utf8 | DataType::Binary => None,
        }
    }

    /// Type name as written in schema sidecar files.
    pub fn sidecar_name(self) -> &'static str {
        match self {
            DataType::Boolean => "bool",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float",
            DataType::Float64 => "double",
            DataType::Utf8 => "string",
            DataType::Binary => "binary",
            DataType::TimestampNanos => "timestamp[ns]",
        }
    }

    pub fn from_sidecar_name(name: &str) -> Option<Self> {
        Some(match name {
            "bool" | "boolean" => DataType::Boolean,
            "int32" => DataType::Int32,
            "int64" => DataType::Int64,
            "uint32" => DataType::UInt32,
            "uint64" => DataType::UInt64,
            "float" | "float32" => DataType::Float32,
            "double" | "float64" => DataType::Float64,
            "string" | "utf8" => DataType::Utf8,
            "binary" => DataType::Binary,
            "timestamp[ns]" => DataType::TimestampNanos,
            _ => return None,
        })
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.sidecar_name())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        DataType::from_sidecar_name(&name)
            .ok_or_else(|| D::Error::custom(format!("unsupported column type `{name}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// On-disk shape of a schema sidecar: `{name, fields:[{name, type, nullable}]}`.
#[derive(Serialize, Deserialize)]
struct SchemaSidecar {
    name: String,
    fields: Vec<Field>,
}

/// An ordered set of named, typed fields with a cached fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SchemaSidecar", into = "SchemaSidecar")]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
    fingerprint: u64,
}

impl From<SchemaSidecar> for Schema {
    fn from(sidecar: SchemaSidecar) -> Self {
        Schema::new(sidecar.name, sidecar.fields)
    }
}

impl From<Schema> for SchemaSidecar {
    fn from(schema: Schema) -> Self {
        SchemaSidecar {
            name: schema.name,
            fields: schema.fields,
        }
    }
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        let fingerprint = fingerprint_fields(&fields);
        Self {
            name: name.into(),
            fields,
            fingerprint,
        }
    }

    /// The market tick layout produced by the feed handlers.
    pub fn market_tick() -> Self {
        Schema::new(
            "MarketTick",
            vec![
                Field::new("symbol", DataType::Utf8, true),
                Field::new("price", DataType::Float64, true),
                Field::new("size", DataType::UInt32, true),
                Field::new("ts_ns", DataType::UInt64, true),
            ],
        )
    }

    /// Parse a schema sidecar document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("invalid schema sidecar: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn fingerprint_fields(fields: &[Field]) -> u64 {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.name.len() as u32).to_le_bytes());
        hasher.update(field.name.as_bytes());
        hasher.update([field.data_type.tag()]);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
