//! Model metadata
//!
//! Validates GGUF files and reads the key/value metadata section: the
//! architecture name, its training context length and the embedded chat
//! template.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Upper bound on metadata entries, guards against corrupted headers
const MAX_METADATA_COUNT: u64 = 1 << 20;

/// Upper bound on a single metadata string (chat templates can be large)
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Nesting limit for arrays of arrays
const MAX_ARRAY_DEPTH: usize = 8;

/// Errors that can occur during model operations
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Unknown GGUF metadata value type {value_type} for key {key:?}")]
    UnknownValueType { key: String, value_type: u32 },

    #[error("Invalid GGUF metadata: {0}")]
    InvalidMetadata(String),
}

/// Fixed-size GGUF header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// A metadata value. Arrays are skipped while reading and only their
/// shape is kept.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array { element_type: u32, len: u64 },
    U64(u64),
    I64(i64),
    F64(f64),
}

impl MetadataValue {
    /// Integer value, if this is a non-negative integer of any width
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            MetadataValue::U8(v) => Some(v.into()),
            MetadataValue::U16(v) => Some(v.into()),
            MetadataValue::U32(v) => Some(v.into()),
            MetadataValue::U64(v) => Some(v),
            MetadataValue::I8(v) => u64::try_from(v).ok(),
            MetadataValue::I16(v) => u64::try_from(v).ok(),
            MetadataValue::I32(v) => u64::try_from(v).ok(),
            MetadataValue::I64(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Header and scalar metadata of a GGUF file
#[derive(Debug, Clone, PartialEq)]
pub struct GgufMetadata {
    pub header: GgufHeader,
    values: BTreeMap<String, MetadataValue>,
}

impl GgufMetadata {
    /// Looks up a raw metadata value
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.values.get(key)
    }

    /// `general.architecture`, e.g. `"llama"` or `"qwen2"`
    pub fn architecture(&self) -> Option<&str> {
        self.get("general.architecture").and_then(MetadataValue::as_str)
    }

    /// Training context length, stored under `"<architecture>.context_length"`
    pub fn context_length(&self) -> Option<u64> {
        let key = format!("{}.context_length", self.architecture()?);
        self.get(&key).and_then(MetadataValue::as_u64)
    }

    /// Embedded chat template. An empty template counts as absent.
    pub fn chat_template(&self) -> Option<&str> {
        self.get("tokenizer.chat_template")
            .and_then(MetadataValue::as_str)
            .filter(|t| !t.is_empty())
    }
}

/// Reads the header and the full metadata section of a GGUF file.
///
/// Tensor data is never touched, so this is cheap even for large models.
pub fn read_gguf_metadata<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut reader = BufReader::new(File::open(path)?);
    read_metadata(&mut reader)
}

fn read_header<R: Read + Seek>(reader: &mut R) -> Result<GgufHeader, ModelError> {
    // Check file size (minimum: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8) = 24 bytes)
    let size = reader.seek(SeekFrom::End(0))?;
    if size < 24 {
        return Err(ModelError::FileTooSmall);
    }
    reader.seek(SeekFrom::Start(0))?;

    let magic = read_u32(reader)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = read_u32(reader)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufHeader {
        version,
        tensor_count: read_u64(reader)?,
        metadata_kv_count: read_u64(reader)?,
    })
}

fn read_metadata<R: Read + Seek>(reader: &mut R) -> Result<GgufMetadata, ModelError> {
    let header = read_header(reader)?;
    if header.metadata_kv_count > MAX_METADATA_COUNT {
        return Err(ModelError::InvalidMetadata(format!(
            "{} metadata entries exceeds the limit of {}",
            header.metadata_kv_count, MAX_METADATA_COUNT
        )));
    }

    let mut values = BTreeMap::new();
    for _ in 0..header.metadata_kv_count {
        let key = read_string(reader)?;
        let value_type = read_u32(reader)?;
        let value = read_value(reader, &key, value_type)?;
        values.insert(key, value);
    }

    tracing::debug!(
        "Read {} GGUF metadata entries (version {})",
        values.len(),
        header.version
    );

    Ok(GgufMetadata { header, values })
}

fn read_value<R: Read + Seek>(
    reader: &mut R,
    key: &str,
    value_type: u32,
) -> Result<MetadataValue, ModelError> {
    let value = match value_type {
        0 => MetadataValue::U8(read_array::<1, _>(reader)?[0]),
        1 => MetadataValue::I8(i8::from_le_bytes(read_array(reader)?)),
        2 => MetadataValue::U16(u16::from_le_bytes(read_array(reader)?)),
        3 => MetadataValue::I16(i16::from_le_bytes(read_array(reader)?)),
        4 => MetadataValue::U32(read_u32(reader)?),
        5 => MetadataValue::I32(i32::from_le_bytes(read_array(reader)?)),
        6 => MetadataValue::F32(f32::from_le_bytes(read_array(reader)?)),
        7 => MetadataValue::Bool(read_array::<1, _>(reader)?[0] != 0),
        8 => MetadataValue::String(read_string(reader)?),
        9 => {
            let element_type = read_u32(reader)?;
            let len = read_u64(reader)?;
            skip_array(reader, key, element_type, len, 0)?;
            MetadataValue::Array { element_type, len }
        }
        10 => MetadataValue::U64(read_u64(reader)?),
        11 => MetadataValue::I64(i64::from_le_bytes(read_array(reader)?)),
        12 => MetadataValue::F64(f64::from_le_bytes(read_array(reader)?)),
        _ => {
            return Err(ModelError::UnknownValueType {
                key: key.to_string(),
                value_type,
            })
        }
    };
    Ok(value)
}

/// Byte width of fixed-size element types
fn scalar_width(value_type: u32) -> Option<u64> {
    match value_type {
        0 | 1 | 7 => Some(1),
        2 | 3 => Some(2),
        4 | 5 | 6 => Some(4),
        10..=12 => Some(8),
        _ => None,
    }
}

fn skip_array<R: Read + Seek>(
    reader: &mut R,
    key: &str,
    element_type: u32,
    len: u64,
    depth: usize,
) -> Result<(), ModelError> {
    if depth > MAX_ARRAY_DEPTH {
        return Err(ModelError::InvalidMetadata(format!(
            "array {key:?} nests deeper than {MAX_ARRAY_DEPTH} levels"
        )));
    }

    if let Some(width) = scalar_width(element_type) {
        let bytes = width
            .checked_mul(len)
            .and_then(|n| i64::try_from(n).ok())
            .ok_or_else(|| {
                ModelError::InvalidMetadata(format!("array {key:?} is too large ({len} elements)"))
            })?;
        reader.seek(SeekFrom::Current(bytes))?;
        return Ok(());
    }

    match element_type {
        8 => {
            for _ in 0..len {
                let str_len = read_u64(reader)?;
                let skip = i64::try_from(str_len).map_err(|_| {
                    ModelError::InvalidMetadata(format!("string in array {key:?} is too large"))
                })?;
                reader.seek(SeekFrom::Current(skip))?;
            }
            Ok(())
        }
        9 => {
            for _ in 0..len {
                let inner_type = read_u32(reader)?;
                let inner_len = read_u64(reader)?;
                skip_array(reader, key, inner_type, inner_len, depth + 1)?;
            }
            Ok(())
        }
        _ => Err(ModelError::UnknownValueType {
            key: key.to_string(),
            value_type: element_type,
        }),
    }
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], ModelError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ModelError> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ModelError> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, ModelError> {
    let len = read_u64(reader)?;
    if len > MAX_STRING_LEN {
        return Err(ModelError::InvalidMetadata(format!(
            "string of {len} bytes exceeds the limit of {MAX_STRING_LEN}"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| ModelError::InvalidMetadata(format!("string is not UTF-8: {e}")))
}
