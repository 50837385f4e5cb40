//! Frame wire format, little-endian throughout:
//!
//! ```text
//! [fingerprint:u64][column_count:u32]
//! per column: [type_tag:u8][null_bitmap_len:u32][null_bitmap][value_len:u32][value_bytes]
//! ```

use std::sync::Arc;

use super::batch::{check_parts, Column, RecordBatch};
use super::schema::{DataType, Schema};
use crate::error::{EngineError, Result};

pub const FRAME_HEADER_LEN: usize = 12;
const COLUMN_OVERHEAD: usize = 1 + 4 + 4;

/// Structural summary of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub fingerprint: u64,
    pub column_count: usize,
    pub row_count: usize,
}

/// Exact size of the frame `encode` produces for `batch`.
pub fn encoded_len(batch: &RecordBatch) -> usize {
    FRAME_HEADER_LEN
        + batch
            .columns()
            .iter()
            .map(|c| COLUMN_OVERHEAD + c.null_bitmap().len() + c.values().len())
            .sum::<usize>()
}

pub fn encode(batch: &RecordBatch) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(batch));
    encode_into(batch, &mut out);
    out
}

/// Append the frame for `batch` to `out`.
pub fn encode_into(batch: &RecordBatch, out: &mut Vec<u8>) {
    out.reserve(encoded_len(batch));
    out.extend_from_slice(&batch.fingerprint().to_le_bytes());
    out.extend_from_slice(&(batch.num_columns() as u32).to_le_bytes());
    for column in batch.columns() {
        out.push(column.data_type().tag());
        out.extend_from_slice(&(column.null_bitmap().len() as u32).to_le_bytes());
        out.extend_from_slice(column.null_bitmap());
        out.extend_from_slice(&(column.values().len() as u32).to_le_bytes());
        out.extend_from_slice(column.values());
    }
}

/// Fingerprint of a frame without validating the rest of it.
pub fn peek_fingerprint(bytes: &[u8]) -> Result<u64> {
    FrameReader::new(bytes).u64("fingerprint")
}

/// Validate a frame's structure without a schema.
pub fn inspect(bytes: &[u8]) -> Result<FrameInfo> {
    let (fingerprint, columns) = read_frame(bytes)?;
    let mut row_count = None;
    for (i, raw) in columns.iter().enumerate() {
        let rows = check_parts(raw.data_type, raw.values, raw.nulls)
            .map_err(|e| EngineError::corrupt(format!("column {i}: {e}")))?;
        check_rows(&mut row_count, rows, i)?;
    }
    Ok(FrameInfo {
        fingerprint,
        column_count: columns.len(),
        row_count: row_count.unwrap_or(0),
    })
}

/// Decode a frame produced for `schema`.
pub fn decode(bytes: &[u8], schema: &Arc<Schema>) -> Result<RecordBatch> {
    let (fingerprint, raw_columns) = read_frame(bytes)?;
    if fingerprint != schema.fingerprint() {
        return Err(EngineError::mismatch(schema.fingerprint(), fingerprint));
    }
    if raw_columns.len() != schema.fields().len() {
        return Err(EngineError::corrupt(format!(
            "frame has {} columns, schema `{}` has {}",
            raw_columns.len(),
            schema.name(),
            schema.fields().len()
        )));
    }

    let mut row_count = None;
    let mut columns = Vec::with_capacity(raw_columns.len());
    for (i, (raw, field)) in raw_columns.iter().zip(schema.fields()).enumerate() {
        if raw.data_type != field.data_type {
            return Err(EngineError::corrupt(format!(
                "column `{}` tagged {:?}, schema declares {:?}",
                field.name, raw.data_type, field.data_type
            )));
        }
        let column = Column::from_parts(raw.data_type, raw.values.to_vec(), raw.nulls.to_vec())
            .map_err(|e| EngineError::corrupt(format!("column `{}`: {e}", field.name)))?;
        if !field.nullable && column.has_nulls() {
            return Err(EngineError::corrupt(format!(
                "column `{}` is not nullable but carries {} nulls",
                field.name,
                column.null_count()
            )));
        }
        check_rows(&mut row_count, column.len(), i)?;
        columns.push(column);
    }

    Ok(RecordBatch::from_validated(
        Arc::clone(schema),
        columns,
        row_count.unwrap_or(0),
    ))
}

fn check_rows(expected: &mut Option<usize>, rows: usize, column: usize) -> Result<()> {
    match *expected {
        None => {
            *expected = Some(rows);
            Ok(())
        }
        Some(n) if n == rows => Ok(()),
        Some(n) => Err(EngineError::corrupt(format!(
            "column {column} has {rows} rows, column 0 has {n}"
        ))),
    }
}

struct RawColumn<'a> {
    data_type: DataType,
    nulls: &'a [u8],
    values: &'a [u8],
}

fn read_frame(bytes: &[u8]) -> Result<(u64, Vec<RawColumn<'_>>)> {
    let mut reader = FrameReader::new(bytes);
    let fingerprint = reader.u64("fingerprint")?;
    let column_count = reader.u32("column count")? as usize;
    if column_count > reader.remaining() / COLUMN_OVERHEAD {
        return Err(EngineError::corrupt(format!(
            "{column_count} columns declared but only {} bytes follow",
            reader.remaining()
        )));
    }

    let mut columns = Vec::with_capacity(column_count);
    for i in 0..column_count {
        let tag = reader.u8("type tag")?;
        let data_type = DataType::from_tag(tag)
            .ok_or_else(|| EngineError::corrupt(format!("unknown type tag {tag} in column {i}")))?;
        let bitmap_len = reader.u32("null bitmap length")? as usize;
        let nulls = reader.take(bitmap_len, "null bitmap")?;
        let value_len = reader.u32("value length")? as usize;
        let values = reader.take(value_len, "values")?;
        columns.push(RawColumn {
            data_type,
            nulls,
            values,
        });
    }

    if reader.remaining() != 0 {
        return Err(EngineError::corrupt(format!(
            "{} trailing bytes after last column",
            reader.remaining()
        )));
    }
    Ok((fingerprint, columns))
}

struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(EngineError::corrupt(format!(
                "{what} needs {len} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(raw))
    }
}
