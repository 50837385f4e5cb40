//! Columnar record batches.
//!
//! Every column keeps its values as one contiguous little-endian buffer in
//! the exact layout the frame carries, so encoding is a bulk copy per column.

use std::sync::Arc;

use super::schema::{DataType, Schema};
use crate::error::{EngineError, Result};

/// Fixed-width value types a column can hold.
pub trait NativeValue: Copy + Default {
    const DATA_TYPE: DataType;
    const WIDTH: usize;

    fn write_le(self, out: &mut Vec<u8>);

    /// Read one value from the first `WIDTH` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;

    /// Whether a column of `data_type` stores values of this type.
    fn readable_as(data_type: DataType) -> bool {
        data_type == Self::DATA_TYPE
    }
}

macro_rules! native_value {
    ($ty:ty, $dt:expr $(, also $alt:expr)?) => {
        impl NativeValue for $ty {
            const DATA_TYPE: DataType = $dt;
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(raw)
            }

            $(
            fn readable_as(data_type: DataType) -> bool {
                data_type == $dt || data_type == $alt
            }
            )?
        }
    };
}

native_value!(i32, DataType::Int32);
native_value!(i64, DataType::Int64, also DataType::TimestampNanos);
native_value!(u32, DataType::UInt32);
native_value!(u64, DataType::UInt64);
native_value!(f32, DataType::Float32);
native_value!(f64, DataType::Float64);

/// Bytes needed for a null bitmap covering `rows` rows.
pub fn bitmap_len(rows: usize) -> usize {
    rows.div_ceil(8)
}

/// Builds an LSB-first null bitmap; bit set means null.
struct NullBuilder {
    bits: Vec<u8>,
    any: bool,
}

impl NullBuilder {
    fn new(rows: usize) -> Self {
        Self {
            bits: vec![0u8; bitmap_len(rows)],
            any: false,
        }
    }

    fn set_null(&mut self, row: usize) {
        self.bits[row / 8] |= 1 << (row % 8);
        self.any = true;
    }

    fn finish(self) -> Vec<u8> {
        if self.any {
            self.bits
        } else {
            Vec::new()
        }
    }
}

/// One typed column: value buffer plus optional null bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    data_type: DataType,
    len: usize,
    /// Empty when the column has no nulls.
    nulls: Vec<u8>,
    values: Vec<u8>,
    /// (offset, length) of each value; variable-width types only.
    spans: Vec<(usize, usize)>,
}

impl Column {
    pub fn from_values<T: NativeValue>(values: &[T]) -> Self {
        let mut buf = Vec::with_capacity(values.len() * T::WIDTH);
        for v in values {
            v.write_le(&mut buf);
        }
        Self {
            data_type: T::DATA_TYPE,
            len: values.len(),
            nulls: Vec::new(),
            values: buf,
            spans: Vec::new(),
        }
    }

    pub fn from_options<T: NativeValue>(values: &[Option<T>]) -> Self {
        let mut buf = Vec::with_capacity(values.len() * T::WIDTH);
        let mut nulls = NullBuilder::new(values.len());
        for (row, v) in values.iter().enumerate() {
            match v {
                Some(v) => v.write_le(&mut buf),
                None => {
                    T::default().write_le(&mut buf);
                    nulls.set_null(row);
                }
            }
        }
        Self {
            data_type: T::DATA_TYPE,
            len: values.len(),
            nulls: nulls.finish(),
            values: buf,
            spans: Vec::new(),
        }
    }

    pub fn timestamps_ns(values: &[i64]) -> Self {
        Self {
            data_type: DataType::TimestampNanos,
            ..Self::from_values(values)
        }
    }

    pub fn from_bools(values: &[bool]) -> Self {
        Self {
            data_type: DataType::Boolean,
            len: values.len(),
            nulls: Vec::new(),
            values: values.iter().map(|b| *b as u8).collect(),
            spans: Vec::new(),
        }
    }

    pub fn from_opt_bools(values: &[Option<bool>]) -> Self {
        let mut nulls = NullBuilder::new(values.len());
        let mut buf = Vec::with_capacity(values.len());
        for (row, v) in values.iter().enumerate() {
            if v.is_none() {
                nulls.set_null(row);
            }
            buf.push(v.unwrap_or(false) as u8);
        }
        Self {
            data_type: DataType::Boolean,
            len: values.len(),
            nulls: nulls.finish(),
            values: buf,
            spans: Vec::new(),
        }
    }

    pub fn from_strs<S: AsRef<str>>(values: &[S]) -> Self {
        Self::var_width(
            DataType::Utf8,
            values.iter().map(|s| Some(s.as_ref().as_bytes())),
        )
    }

    pub fn from_opt_strs(values: &[Option<&str>]) -> Self {
        Self::var_width(DataType::Utf8, values.iter().map(|s| s.map(str::as_bytes)))
    }

    pub fn from_binary<B: AsRef<[u8]>>(values: &[B]) -> Self {
        Self::var_width(DataType::Binary, values.iter().map(|b| Some(b.as_ref())))
    }

    pub fn from_opt_binary(values: &[Option<&[u8]>]) -> Self {
        Self::var_width(DataType::Binary, values.iter().copied())
    }

    fn var_width<'a, I>(data_type: DataType, values: I) -> Self
    where
        I: ExactSizeIterator<Item = Option<&'a [u8]>>,
    {
        let rows = values.len();
        let mut nulls = NullBuilder::new(rows);
        let mut buf = Vec::new();
        let mut spans = Vec::with_capacity(rows);
        for (row, v) in values.enumerate() {
            let bytes = v.unwrap_or_else(|| {
                nulls.set_null(row);
                &[]
            });
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            spans.push((buf.len(), bytes.len()));
            buf.extend_from_slice(bytes);
        }
        Self {
            data_type,
            len: rows,
            nulls: nulls.finish(),
            values: buf,
            spans,
        }
    }

    /// Adopt an already laid-out value buffer and null bitmap without
    /// per-value conversion.
    pub fn from_raw(data_type: DataType, values: Vec<u8>, nulls: Vec<u8>) -> Result<Self> {
        Self::from_parts(data_type, values, nulls).map_err(EngineError::invalid_batch)
    }

    pub(crate) fn from_parts(
        data_type: DataType,
        values: Vec<u8>,
        nulls: Vec<u8>,
    ) -> std::result::Result<Self, String> {
        let (len, spans) = value_layout(data_type, &values)?;
        let nulls = normalize_nulls(nulls, len)?;
        Ok(Self {
            data_type,
            len,
            nulls,
            values,
            spans,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw value buffer in wire layout.
    pub fn values(&self) -> &[u8] {
        &self.values
    }

    /// Null bitmap; empty when the column has no nulls.
    pub fn null_bitmap(&self) -> &[u8] {
        &self.nulls
    }

    pub fn has_nulls(&self) -> bool {
        !self.nulls.is_empty()
    }

    pub fn is_null(&self, row: usize) -> bool {
        row < self.len
            && self
                .nulls
                .get(row / 8)
                .is_some_and(|byte| byte & (1 << (row % 8)) != 0)
    }

    pub fn null_count(&self) -> usize {
        self.nulls.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Value at `row`, or `None` for nulls, out-of-range rows and other types.
    pub fn value<T: NativeValue>(&self, row: usize) -> Option<T> {
        if !T::readable_as(self.data_type) || row >= self.len || self.is_null(row) {
            return None;
        }
        Some(T::read_le(&self.values[row * T::WIDTH..]))
    }

    pub fn bool_value(&self, row: usize) -> Option<bool> {
        if self.data_type != DataType::Boolean || row >= self.len || self.is_null(row) {
            return None;
        }
        Some(self.values[row] != 0)
    }

    pub fn str_value(&self, row: usize) -> Option<&str> {
        if self.data_type != DataType::Utf8 {
            return None;
        }
        self.binary_value(row)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn binary_value(&self, row: usize) -> Option<&[u8]> {
        if row >= self.len || self.is_null(row) {
            return None;
        }
        let (offset, len) = *self.spans.get(row)?;
        Some(&self.values[offset..offset + len])
    }
}

/// Validate a column's raw buffers and return its row count.
pub(crate) fn check_parts(
    data_type: DataType,
    values: &[u8],
    nulls: &[u8],
) -> std::result::Result<usize, String> {
    let (rows, _) = value_layout(data_type, values)?;
    check_bitmap_len(nulls.len(), rows)?;
    Ok(rows)
}

fn check_bitmap_len(len: usize, rows: usize) -> std::result::Result<(), String> {
    if len != 0 && len != bitmap_len(rows) {
        return Err(format!(
            "null bitmap is {len} bytes, {rows} rows need {}",
            bitmap_len(rows)
        ));
    }
    Ok(())
}

/// Row count (and value spans for variable-width types) implied by a value buffer.
fn value_layout(
    data_type: DataType,
    values: &[u8],
) -> std::result::Result<(usize, Vec<(usize, usize)>), String> {
    match data_type {
        DataType::Boolean => {
            if values.iter().any(|b| *b > 1) {
                return Err("boolean values must be 0 or 1".to_string());
            }
            Ok((values.len(), Vec::new()))
        }
        DataType::Utf8 | DataType::Binary => {
            let mut spans = Vec::new();
            let mut pos = 0usize;
            while pos < values.len() {
                let prefix = values
                    .get(pos..pos + 4)
                    .ok_or_else(|| format!("truncated length prefix at byte {pos}"))?;
                let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
                pos += 4;
                let bytes = values
                    .get(pos..pos + len)
                    .ok_or_else(|| format!("value of {len} bytes overruns buffer at byte {pos}"))?;
                if data_type == DataType::Utf8 && std::str::from_utf8(bytes).is_err() {
                    return Err(format!("invalid utf-8 in value {}", spans.len()));
                }
                spans.push((pos, len));
                pos += len;
            }
            Ok((spans.len(), spans))
        }
        fixed => {
            let width = fixed.byte_width().unwrap_or(1);
            if values.len() % width != 0 {
                return Err(format!(
                    "{} value bytes is not a multiple of the {width}-byte {:?} width",
                    values.len(),
                    fixed
                ));
            }
            Ok((values.len() / width, Vec::new()))
        }
    }
}

/// Validate a null bitmap for `rows` rows, clear padding bits and collapse
/// an all-valid bitmap to the empty form.
fn normalize_nulls(mut nulls: Vec<u8>, rows: usize) -> std::result::Result<Vec<u8>, String> {
    check_bitmap_len(nulls.len(), rows)?;
    if nulls.is_empty() {
        return Ok(nulls);
    }
    if rows % 8 != 0 {
        if let Some(last) = nulls.last_mut() {
            *last &= (1u8 << (rows % 8)) - 1;
        }
    }
    if nulls.iter().all(|b| *b == 0) {
        nulls.clear();
    }
    Ok(nulls)
}

/// A schema plus equally long columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    schema: Arc<Schema>,
    columns: Vec<Column>,
    num_rows: usize,
}

impl RecordBatch {
    pub fn try_new(schema: Arc<Schema>, columns: Vec<Column>) -> Result<Self> {
        if columns.len() != schema.fields().len() {
            return Err(EngineError::invalid_batch(format!(
                "schema `{}` has {} fields, got {} columns",
                schema.name(),
                schema.fields().len(),
                columns.len()
            )));
        }

        let num_rows = columns.first().map_or(0, Column::len);
        for (field, column) in schema.fields().iter().zip(&columns) {
            if field.data_type != column.data_type() {
                return Err(EngineError::invalid_batch(format!(
                    "column `{}` holds {:?}, schema declares {:?}",
                    field.name,
                    column.data_type(),
                    field.data_type
                )));
            }
            if column.len() != num_rows {
                return Err(EngineError::invalid_batch(format!(
                    "column `{}` has {} rows, expected {}",
                    field.name,
                    column.len(),
                    num_rows
                )));
            }
            if !field.nullable && column.has_nulls() {
                return Err(EngineError::invalid_batch(format!(
                    "column `{}` is not nullable but has {} nulls",
                    field.name,
                    column.null_count()
                )));
            }
        }

        Ok(Self {
            schema,
            columns,
            num_rows,
        })
    }

    /// A zero-row batch of `schema`.
    pub fn empty(schema: Arc<Schema>) -> Self {
        let columns = schema
            .fields()
            .iter()
            .map(|field| Column {
                data_type: field.data_type,
                len: 0,
                nulls: Vec::new(),
                values: Vec::new(),
                spans: Vec::new(),
            })
            .collect();
        Self {
            schema,
            columns,
            num_rows: 0,
        }
    }

    /// Assemble a batch whose columns were already validated against `schema`.
    pub(crate) fn from_validated(schema: Arc<Schema>, columns: Vec<Column>, num_rows: usize) -> Self {
        Self {
            schema,
            columns,
            num_rows,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn fingerprint(&self) -> u64 {
        self.schema.fingerprint()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.schema.index_of(name).and_then(|i| self.columns.get(i))
    }
}
