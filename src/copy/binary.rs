//! Binary-format COPY channels (`FORMAT binary`).
//!
//! Rows are framed by hand so column types can be supplied per value instead of up front.

use std::pin::Pin;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{CopyInSink, CopyOutStream};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ChannelLease, FLUSH_THRESHOLD};
use crate::error::SqlMiddlewareDbError;
use crate::postgres::params::underlying_type;
use crate::types::RowValues;

const SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";
const HEADER_FIXED_LEN: usize = SIGNATURE.len() + 4 + 4;

fn protocol(msg: impl Into<String>) -> SqlMiddlewareDbError {
    SqlMiddlewareDbError::ProtocolError(msg.into())
}

pub(crate) fn write_header(buf: &mut BytesMut) {
    buf.put_slice(SIGNATURE);
    buf.put_i32(0);
    buf.put_i32(0);
}

pub(crate) fn write_trailer(buf: &mut BytesMut) {
    buf.put_i16(-1);
}

#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    Row(Vec<Option<Bytes>>),
    Trailer,
}

/// Incremental decoder for the binary COPY stream.
#[derive(Default)]
pub(crate) struct BinaryDecoder {
    buffer: BytesMut,
    header_read: bool,
}

impl BinaryDecoder {
    pub(crate) fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub(crate) fn has_remaining(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Next complete frame, or `None` if more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, SqlMiddlewareDbError> {
        if !self.header_read {
            if self.buffer.len() < HEADER_FIXED_LEN {
                return Ok(None);
            }
            if &self.buffer[..SIGNATURE.len()] != SIGNATURE {
                return Err(protocol("binary COPY data has an invalid signature"));
            }
            let mut cursor = &self.buffer[SIGNATURE.len()..];
            let _flags = cursor.get_i32();
            let ext_len = usize::try_from(cursor.get_i32())
                .map_err(|_| protocol("binary COPY header extension has a negative length"))?;
            if self.buffer.len() < HEADER_FIXED_LEN + ext_len {
                return Ok(None);
            }
            self.buffer.advance(HEADER_FIXED_LEN + ext_len);
            self.header_read = true;
        }

        let mut cursor = &self.buffer[..];
        if cursor.remaining() < 2 {
            return Ok(None);
        }
        let field_count = cursor.get_i16();
        if field_count == -1 {
            self.buffer.advance(2);
            return Ok(Some(Frame::Trailer));
        }
        let field_count = usize::try_from(field_count)
            .map_err(|_| protocol(format!("invalid binary COPY field count {field_count}")))?;

        let mut spans = Vec::with_capacity(field_count);
        let mut offset = 2;
        for _ in 0..field_count {
            if cursor.remaining() < 4 {
                return Ok(None);
            }
            let len = cursor.get_i32();
            offset += 4;
            if len == -1 {
                spans.push(None);
                continue;
            }
            let len = usize::try_from(len)
                .map_err(|_| protocol(format!("invalid binary COPY field length {len}")))?;
            if cursor.remaining() < len {
                return Ok(None);
            }
            cursor.advance(len);
            spans.push(Some((offset, len)));
            offset += len;
        }

        let frame = self.buffer.split_to(offset).freeze();
        let fields = spans
            .into_iter()
            .map(|span| span.map(|(start, len)| frame.slice(start..start + len)))
            .collect();
        Ok(Some(Frame::Row(fields)))
    }
}

/// One row read from a binary export. Values stay encoded until asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryRow {
    fields: Vec<Option<Bytes>>,
}

impl BinaryRow {
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True if the field is NULL or out of range.
    #[must_use]
    pub fn is_null(&self, idx: usize) -> bool {
        self.fields.get(idx).is_none_or(Option::is_none)
    }

    /// The encoded bytes of a field; `None` for NULL or out of range.
    #[must_use]
    pub fn raw(&self, idx: usize) -> Option<&[u8]> {
        self.fields.get(idx).and_then(|f| f.as_deref())
    }

    /// Decode a field as `T`, given the column's backend type.
    ///
    /// # Errors
    /// Returns `ExecutionError` if the index is out of range, `T` does not accept `ty`,
    /// or the bytes do not decode.
    pub fn get<'a, T: FromSql<'a>>(&'a self, idx: usize, ty: &Type) -> Result<T, SqlMiddlewareDbError> {
        let field = self.fields.get(idx).ok_or_else(|| {
            SqlMiddlewareDbError::ExecutionError(format!(
                "column index {idx} out of range for a row of {} fields",
                self.fields.len()
            ))
        })?;
        if !T::accepts(ty) {
            return Err(SqlMiddlewareDbError::ExecutionError(format!(
                "cannot decode column {idx} of type {ty} as {}",
                std::any::type_name::<T>()
            )));
        }
        T::from_sql_nullable(ty, field.as_deref()).map_err(|e| {
            SqlMiddlewareDbError::ExecutionError(format!("failed to decode column {idx}: {e}"))
        })
    }

    /// Decode every field using the given column types.
    ///
    /// # Errors
    /// Returns `ExecutionError` if `types` does not match the row width or a field fails to decode.
    pub fn to_row_values(&self, types: &[Type]) -> Result<Vec<RowValues>, SqlMiddlewareDbError> {
        if types.len() != self.fields.len() {
            return Err(SqlMiddlewareDbError::ExecutionError(format!(
                "{} column types given for a row of {} fields",
                types.len(),
                self.fields.len()
            )));
        }
        types
            .iter()
            .enumerate()
            .map(|(idx, ty)| self.row_value(idx, ty))
            .collect()
    }

    fn row_value(&self, idx: usize, ty: &Type) -> Result<RowValues, SqlMiddlewareDbError> {
        let ty = underlying_type(ty);
        let value = match *ty {
            Type::INT2 => self.get::<Option<i16>>(idx, ty)?.map(|v| RowValues::Int(i64::from(v))),
            Type::INT4 => self.get::<Option<i32>>(idx, ty)?.map(|v| RowValues::Int(i64::from(v))),
            Type::INT8 => self.get::<Option<i64>>(idx, ty)?.map(RowValues::Int),
            Type::FLOAT4 => self
                .get::<Option<f32>>(idx, ty)?
                .map(|v| RowValues::Float(f64::from(v))),
            Type::FLOAT8 => self.get::<Option<f64>>(idx, ty)?.map(RowValues::Float),
            Type::BOOL => self.get::<Option<bool>>(idx, ty)?.map(RowValues::Bool),
            Type::TIMESTAMP => self
                .get::<Option<NaiveDateTime>>(idx, ty)?
                .map(RowValues::Timestamp),
            Type::TIMESTAMPTZ => self
                .get::<Option<DateTime<Utc>>>(idx, ty)?
                .map(|v| RowValues::Timestamp(v.naive_utc())),
            Type::DATE => self
                .get::<Option<NaiveDate>>(idx, ty)?
                .and_then(|v| v.and_hms_opt(0, 0, 0))
                .map(RowValues::Timestamp),
            Type::JSON | Type::JSONB => self.get::<Option<Value>>(idx, ty)?.map(RowValues::JSON),
            Type::BYTEA => self.get::<Option<Vec<u8>>>(idx, ty)?.map(RowValues::Blob),
            _ if matches!(ty.kind(), Kind::Enum(_)) => self
                .raw(idx)
                .map(|raw| String::from_utf8(raw.to_vec()))
                .transpose()
                .map_err(|e| {
                    SqlMiddlewareDbError::ExecutionError(format!(
                        "failed to decode column {idx}: {e}"
                    ))
                })?
                .map(RowValues::Text),
            _ => self.get::<Option<String>>(idx, ty)?.map(RowValues::Text),
        };
        Ok(value.unwrap_or(RowValues::Null))
    }
}

/// Reads rows from `COPY .. TO STDOUT (FORMAT binary)`.
pub struct BinaryExporter {
    stream: Pin<Box<CopyOutStream>>,
    decoder: BinaryDecoder,
    exhausted: bool,
    trailer_seen: bool,
    lease: ChannelLease,
}

impl std::fmt::Debug for BinaryExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryExporter")
            .field("exhausted", &self.exhausted)
            .field("trailer_seen", &self.trailer_seen)
            .finish_non_exhaustive()
    }
}

impl BinaryExporter {
    pub(crate) fn new(stream: Pin<Box<CopyOutStream>>, lease: ChannelLease) -> Self {
        Self {
            stream,
            decoder: BinaryDecoder::default(),
            exhausted: false,
            trailer_seen: false,
            lease,
        }
    }

    /// Next row; `None` after the last one.
    ///
    /// # Errors
    /// Returns the backend error unchanged, or `ProtocolError` for malformed or truncated data.
    pub async fn next_row(&mut self) -> Result<Option<BinaryRow>, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        if self.trailer_seen {
            return Ok(None);
        }
        loop {
            match self.decoder.next_frame()? {
                Some(Frame::Row(fields)) => return Ok(Some(BinaryRow { fields })),
                Some(Frame::Trailer) => {
                    self.trailer_seen = true;
                    self.drain().await?;
                    return Ok(None);
                }
                None => {}
            }
            if self.exhausted {
                if self.decoder.has_remaining() {
                    return Err(protocol("binary COPY data ended mid-row"));
                }
                return Err(protocol("binary COPY data ended without a trailer"));
            }
            match self.stream.next().await {
                Some(chunk) => self.decoder.extend(&chunk?),
                None => self.exhausted = true,
            }
        }
    }

    /// Read and discard whatever is left.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn finish(mut self) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.drain().await
    }

    /// Stop reading; the remaining output is discarded by the driver.
    pub fn cancel(self) {
        tracing::debug!("binary COPY export cancelled");
    }

    async fn drain(&mut self) -> Result<(), SqlMiddlewareDbError> {
        if !self.exhausted {
            while let Some(chunk) = self.stream.next().await {
                chunk?;
            }
            self.exhausted = true;
        }
        Ok(())
    }
}

/// Writes rows for `COPY .. FROM STDIN (FORMAT binary)`.
///
/// Each row is opened with `start_row` and filled with `write` / `write_null`; the field
/// count is patched in when the next row starts or on `finish`.
pub struct BinaryImporter {
    sink: Pin<Box<CopyInSink<Bytes>>>,
    buffer: BytesMut,
    row: Option<OpenRow>,
    lease: ChannelLease,
}

struct OpenRow {
    count_at: usize,
    fields: i16,
}

impl std::fmt::Debug for BinaryImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryImporter")
            .field("buffered", &self.buffer.len())
            .field("row_open", &self.row.is_some())
            .finish_non_exhaustive()
    }
}

impl BinaryImporter {
    pub(crate) fn new(sink: Pin<Box<CopyInSink<Bytes>>>, lease: ChannelLease) -> Self {
        let mut buffer = BytesMut::with_capacity(FLUSH_THRESHOLD);
        write_header(&mut buffer);
        Self {
            sink,
            buffer,
            row: None,
            lease,
        }
    }

    /// Begin a new row, closing the previous one.
    ///
    /// # Errors
    /// Returns the backend error unchanged if a buffered flush fails.
    pub async fn start_row(&mut self) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.close_row();
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        let count_at = self.buffer.len();
        self.buffer.put_i16(0);
        self.row = Some(OpenRow { count_at, fields: 0 });
        Ok(())
    }

    /// Append one value, encoded as `ty`.
    ///
    /// # Errors
    /// Returns `ProtocolError` outside a row, or `ExecutionError` if the value cannot be
    /// encoded as `ty`. A failed write leaves the row unchanged.
    pub fn write<T: ToSql + ?Sized>(&mut self, value: &T, ty: &Type) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.ensure_in_row()?;
        let len_at = self.buffer.len();
        self.buffer.put_i32(0);
        let is_null = match value.to_sql_checked(ty, &mut self.buffer) {
            Ok(is_null) => is_null,
            Err(e) => {
                self.buffer.truncate(len_at);
                return Err(SqlMiddlewareDbError::ExecutionError(format!(
                    "cannot encode value as {ty}: {e}"
                )));
            }
        };
        let len = match is_null {
            IsNull::Yes => {
                self.buffer.truncate(len_at + 4);
                -1
            }
            IsNull::No => {
                let written = self.buffer.len() - len_at - 4;
                match i32::try_from(written) {
                    Ok(len) => len,
                    Err(_) => {
                        self.buffer.truncate(len_at);
                        return Err(SqlMiddlewareDbError::ExecutionError(format!(
                            "value of {written} bytes is too large for COPY"
                        )));
                    }
                }
            }
        };
        self.buffer[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
        self.bump_field_count()
    }

    /// Append a NULL.
    ///
    /// # Errors
    /// Returns `ProtocolError` outside a row.
    pub fn write_null(&mut self) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.ensure_in_row()?;
        self.buffer.put_i32(-1);
        self.bump_field_count()
    }

    /// Write a whole row of `RowValues`, each encoded as its default backend type.
    ///
    /// # Errors
    /// Same as `start_row` and `write`.
    pub async fn write_row(&mut self, values: &[RowValues]) -> Result<(), SqlMiddlewareDbError> {
        self.start_row().await?;
        for value in values {
            match value.default_pg_type() {
                Some(ty) => self.write(value, &ty)?,
                None => self.write_null()?,
            }
        }
        Ok(())
    }

    /// Close the last row, send the trailer and complete the COPY; returns the row count.
    ///
    /// # Errors
    /// Returns the backend error unchanged (e.g. a type mismatch or constraint violation).
    pub async fn finish(mut self) -> Result<u64, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.close_row();
        write_trailer(&mut self.buffer);
        self.flush().await?;
        Ok(self.sink.as_mut().finish().await?)
    }

    /// Abort the import; nothing written so far is kept.
    pub fn cancel(self) {
        tracing::debug!("binary COPY import cancelled");
    }

    fn ensure_in_row(&self) -> Result<(), SqlMiddlewareDbError> {
        if self.row.is_some() {
            Ok(())
        } else {
            Err(protocol("call start_row before writing values"))
        }
    }

    fn bump_field_count(&mut self) -> Result<(), SqlMiddlewareDbError> {
        let row = self.row.as_mut().ok_or_else(|| protocol("no row is open"))?;
        row.fields = row
            .fields
            .checked_add(1)
            .ok_or_else(|| protocol("too many fields in one COPY row"))?;
        Ok(())
    }

    fn close_row(&mut self) {
        if let Some(row) = self.row.take() {
            self.buffer[row.count_at..row.count_at + 2].copy_from_slice(&row.fields.to_be_bytes());
        }
    }

    async fn flush(&mut self) -> Result<(), SqlMiddlewareDbError> {
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.sink.send(chunk).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_stream() -> BytesMut {
        let mut buf = BytesMut::new();
        write_header(&mut buf);
        buf.put_i16(2);
        buf.put_i32(4);
        buf.put_i32(42);
        buf.put_i32(-1);
        buf.put_i16(1);
        buf.put_i32(5);
        buf.put_slice(b"hello");
        write_trailer(&mut buf);
        buf
    }

    #[test]
    fn decoder_reads_rows_and_trailer() {
        let mut decoder = BinaryDecoder::default();
        decoder.extend(&encoded_stream());

        let Some(Frame::Row(first)) = decoder.next_frame().unwrap() else {
            panic!("expected a row");
        };
        let row = BinaryRow { fields: first };
        assert_eq!(row.len(), 2);
        assert_eq!(row.get::<i32>(0, &Type::INT4).unwrap(), 42);
        assert!(row.is_null(1));
        assert_eq!(row.get::<Option<String>>(1, &Type::TEXT).unwrap(), None);

        let Some(Frame::Row(second)) = decoder.next_frame().unwrap() else {
            panic!("expected a row");
        };
        assert_eq!(second, vec![Some(Bytes::from_static(b"hello"))]);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Trailer));
        assert!(!decoder.has_remaining());
    }

    #[test]
    fn decoder_waits_for_partial_frames() {
        let data = encoded_stream();
        let mut decoder = BinaryDecoder::default();
        let mut frames = Vec::new();
        for byte in data.iter() {
            decoder.extend(&[*byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Frame::Trailer);
    }

    #[test]
    fn decoder_rejects_bad_signature() {
        let mut decoder = BinaryDecoder::default();
        decoder.extend(b"NOTCOPY\n\xff\r\n\0\0\0\0\0\0\0\0\0");
        assert!(matches!(
            decoder.next_frame(),
            Err(SqlMiddlewareDbError::ProtocolError(_))
        ));
    }

    #[test]
    fn row_values_decode_by_column_type() {
        let mut buf = BytesMut::new();
        write_header(&mut buf);
        buf.put_i16(3);
        buf.put_i32(8);
        buf.put_i64(7);
        buf.put_i32(1);
        buf.put_u8(1);
        buf.put_i32(-1);
        let mut decoder = BinaryDecoder::default();
        decoder.extend(&buf);
        let Some(Frame::Row(fields)) = decoder.next_frame().unwrap() else {
            panic!("expected a row");
        };
        let row = BinaryRow { fields };
        let values = row
            .to_row_values(&[Type::INT8, Type::BOOL, Type::TEXT])
            .unwrap();
        assert_eq!(
            values,
            vec![RowValues::Int(7), RowValues::Bool(true), RowValues::Null]
        );
        assert!(row.to_row_values(&[Type::INT8]).is_err());
        assert!(row.get::<String>(0, &Type::INT8).is_err());
    }

    #[test]
    fn enum_and_domain_fields_decode_through_their_base() {
        let row = BinaryRow {
            fields: vec![
                Some(Bytes::from_static(b"happy")),
                Some(Bytes::copy_from_slice(&5_i32.to_be_bytes())),
            ],
        };
        let mood = Type::new(
            "mood".into(),
            90_001,
            Kind::Enum(vec!["sad".into(), "happy".into()]),
            "public".into(),
        );
        let positive = Type::new(
            "positive_int".into(),
            90_002,
            Kind::Domain(Type::INT4),
            "public".into(),
        );
        assert_eq!(
            row.to_row_values(&[mood, positive]).unwrap(),
            vec![RowValues::Text("happy".into()), RowValues::Int(5)]
        );
    }
}
