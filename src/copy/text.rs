//! Text-format COPY channels (`FORMAT text`, the default).

use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio_postgres::{CopyInSink, CopyOutStream};
use tokio_util::bytes::{Bytes, BytesMut};

use super::{ChannelLease, FLUSH_THRESHOLD};
use crate::error::SqlMiddlewareDbError;

/// Reads the output of `COPY .. TO STDOUT` line by line.
pub struct TextExporter {
    stream: Pin<Box<CopyOutStream>>,
    buffer: BytesMut,
    exhausted: bool,
    lease: ChannelLease,
}

impl std::fmt::Debug for TextExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextExporter")
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl TextExporter {
    pub(crate) fn new(stream: Pin<Box<CopyOutStream>>, lease: ChannelLease) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            exhausted: false,
            lease,
        }
    }

    /// Next line without its terminating newline; `None` at the end of the data.
    ///
    /// # Errors
    /// Returns the backend error unchanged, or `ProtocolError` for non-UTF-8 data.
    pub async fn read_line(&mut self) -> Result<Option<String>, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                return decode(&line[..pos]).map(Some);
            }
            if self.exhausted {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let rest = self.buffer.split();
                return decode(&rest).map(Some);
            }
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }
    }

    /// Next row split into fields; `None` marks SQL NULL.
    ///
    /// # Errors
    /// Same as `read_line`.
    pub async fn read_row(&mut self) -> Result<Option<Vec<Option<String>>>, SqlMiddlewareDbError> {
        Ok(self.read_line().await?.map(|line| parse_row(&line)))
    }

    /// Everything that is left, as one string.
    ///
    /// # Errors
    /// Same as `read_line`.
    pub async fn read_to_string(mut self) -> Result<String, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        while let Some(chunk) = self.stream.next().await {
            self.buffer.extend_from_slice(&chunk?);
        }
        self.exhausted = true;
        let rest = self.buffer.split();
        decode(&rest)
    }

    /// Stop reading; the remaining output is discarded by the driver.
    pub fn cancel(self) {
        tracing::debug!("text COPY export cancelled");
    }
}

/// Writes rows for `COPY .. FROM STDIN`.
pub struct TextImporter {
    sink: Pin<Box<CopyInSink<Bytes>>>,
    buffer: BytesMut,
    lease: ChannelLease,
}

impl std::fmt::Debug for TextImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextImporter")
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl TextImporter {
    pub(crate) fn new(sink: Pin<Box<CopyInSink<Bytes>>>, lease: ChannelLease) -> Self {
        Self {
            sink,
            buffer: BytesMut::new(),
            lease,
        }
    }

    /// Write raw text; the caller supplies delimiters, escapes and newlines.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn write(&mut self, text: &str) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.buffer.extend_from_slice(text.as_bytes());
        self.flush_if_full().await
    }

    /// Write one already formatted line and a newline.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn write_line(&mut self, line: &str) -> Result<(), SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.buffer.extend_from_slice(line.as_bytes());
        self.buffer.extend_from_slice(b"\n");
        self.flush_if_full().await
    }

    /// Write one row, escaping each field for the text format; `None` is written as NULL.
    ///
    /// # Errors
    /// Returns the backend error unchanged.
    pub async fn write_row(&mut self, fields: &[Option<&str>]) -> Result<(), SqlMiddlewareDbError> {
        let line = format_row(fields);
        self.write_line(&line).await
    }

    /// Send buffered data and complete the COPY; returns the number of rows imported.
    ///
    /// # Errors
    /// Returns the backend error unchanged (e.g. a constraint violation raised at the end).
    pub async fn finish(mut self) -> Result<u64, SqlMiddlewareDbError> {
        self.lease.ensure_usable()?;
        self.flush().await?;
        Ok(self.sink.as_mut().finish().await?)
    }

    /// Abort the import; nothing written so far is kept.
    pub fn cancel(self) {
        tracing::debug!("text COPY import cancelled");
    }

    async fn flush_if_full(&mut self) -> Result<(), SqlMiddlewareDbError> {
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SqlMiddlewareDbError> {
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.sink.send(chunk).await?;
        }
        Ok(())
    }
}

fn decode(bytes: &[u8]) -> Result<String, SqlMiddlewareDbError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| SqlMiddlewareDbError::ProtocolError(format!("COPY output is not UTF-8: {e}")))
}

/// Render fields as one text-format line (tab separated, `\N` for NULL).
pub(crate) fn format_row(fields: &[Option<&str>]) -> String {
    let mut line = String::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            line.push('\t');
        }
        match field {
            None => line.push_str("\\N"),
            Some(value) => {
                for ch in value.chars() {
                    match ch {
                        '\\' => line.push_str("\\\\"),
                        '\n' => line.push_str("\\n"),
                        '\r' => line.push_str("\\r"),
                        '\t' => line.push_str("\\t"),
                        other => line.push(other),
                    }
                }
            }
        }
    }
    line
}

/// Split a text-format line into fields, undoing backslash escapes.
pub(crate) fn parse_row(line: &str) -> Vec<Option<String>> {
    line.split('\t').map(parse_field).collect()
}

fn parse_field(raw: &str) -> Option<String> {
    if raw == "\\N" {
        return None;
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        match next {
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{b}'),
            'x' => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match chars.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d;
                            chars.next();
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    out.push('x');
                } else {
                    out.push(char::from_u32(value).unwrap_or('\u{fffd}'));
                }
            }
            '0'..='7' => {
                let mut value = next.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value).unwrap_or('\u{fffd}'));
            }
            other => out.push(other),
        }
    }
    Some(out)
}
