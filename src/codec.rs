use bytes::{Buf, BytesMut};
use memchr::memchr3_iter;
use std::io;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Re-encodes a byte stream of any `encoding_rs` charset into UTF-8.
pub struct Transcoder {
    decoder: encoding_rs::Decoder,
}

impl Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder(),
        }
    }

    fn transcode(&mut self, src: &[u8], last: bool) -> (usize, BytesMut) {
        let cap = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 4);
        let mut out = vec![0; cap];
        let (_result, read, written, _replaced) = self.decoder.decode_to_utf8(src, &mut out, last);
        (read, BytesMut::from(&out[..written]))
    }
}

impl Decoder for Transcoder {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let (read, out) = self.transcode(src, false);
        if read == 0 && out.is_empty() {
            return Ok(None);
        }
        src.advance(read);
        Ok(Some(out))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let (_read, out) = self.transcode(buf, true);
        buf.clear();
        Ok((!out.is_empty()).then_some(out))
    }
}

/// Raised (wrapped in an `io::Error`) when a single row outgrows the limit.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("row at line {line} exceeds {limit} bytes")]
pub struct RowLimitExceeded {
    pub limit: usize,
    /// 1-based physical line where the row starts (header is line 1).
    pub line: u64,
}

/// Quoting state of the field under the cursor, following the CSV rules: a
/// quote only opens a quoted field as the first byte of that field, `""`
/// inside quotes is an escaped quote, any other quote is literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    FieldStart,
    Unquoted,
    Quoted,
    /// A quote inside a quoted field; the next byte decides escape or close.
    MaybeClosed,
}

/// Pass-through decoder that fails the stream once the current row is longer
/// than `limit` bytes.
///
/// Runs ahead of the CSV parser so an unterminated or giant row is refused
/// while it is still arriving. Newlines inside quoted fields do not end a row.
/// Complete rows in front of the offending one are still handed on; the error
/// comes with the next read.
pub struct RowGuard {
    limit: usize,
    delimiter: u8,
    current: usize,
    quoting: Quoting,
    line: u64,
    row_start_line: u64,
    tripped: Option<RowLimitExceeded>,
}

impl RowGuard {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            delimiter: b',',
            current: 0,
            quoting: Quoting::FieldStart,
            line: 1,
            row_start_line: 1,
            tripped: None,
        }
    }

    /// On a trip, returns how many leading bytes of `chunk` are complete rows.
    fn scan(&mut self, chunk: &[u8]) -> Result<(), (usize, RowLimitExceeded)> {
        let mut row_start = 0usize;
        // index right after the last byte we looked at; a byte at this index
        // directly follows it
        let mut next = 0usize;

        for pos in memchr3_iter(b'"', b'\n', self.delimiter, chunk) {
            let byte = chunk[pos];
            let adjacent = pos == next;
            next = pos + 1;

            match self.quoting {
                Quoting::MaybeClosed if adjacent && byte == b'"' => {
                    self.quoting = Quoting::Quoted;
                    continue;
                }
                Quoting::MaybeClosed => self.quoting = Quoting::Unquoted,
                Quoting::FieldStart if !adjacent => self.quoting = Quoting::Unquoted,
                _ => {}
            }

            match (self.quoting, byte) {
                (Quoting::Quoted, b'"') => self.quoting = Quoting::MaybeClosed,
                (Quoting::Quoted, b'\n') => self.line += 1,
                (Quoting::Quoted, _) => {}
                (Quoting::FieldStart, b'"') => self.quoting = Quoting::Quoted,
                (_, b'"') => self.quoting = Quoting::Unquoted,
                (_, b'\n') => {
                    self.line += 1;
                    if self.current + (pos - row_start) > self.limit {
                        return Err((row_start, self.exceeded()));
                    }
                    self.current = 0;
                    row_start = pos + 1;
                    self.row_start_line = self.line;
                    self.quoting = Quoting::FieldStart;
                }
                _ => self.quoting = Quoting::FieldStart,
            }
        }

        // trailing plain bytes mean the open field did not start with a quote
        if next < chunk.len() && matches!(self.quoting, Quoting::FieldStart | Quoting::MaybeClosed) {
            self.quoting = Quoting::Unquoted;
        }
        self.current += chunk.len() - row_start;
        if self.current > self.limit {
            return Err((row_start, self.exceeded()));
        }
        Ok(())
    }

    fn exceeded(&self) -> RowLimitExceeded {
        RowLimitExceeded {
            limit: self.limit,
            line: self.row_start_line,
        }
    }
}

impl From<RowLimitExceeded> for io::Error {
    fn from(hit: RowLimitExceeded) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, hit)
    }
}

impl Decoder for RowGuard {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(hit) = self.tripped {
            return Err(hit.into());
        }
        if src.is_empty() {
            return Ok(None);
        }
        match self.scan(src) {
            Ok(()) => Ok(Some(src.split())),
            Err((complete, hit)) => {
                self.tripped = Some(hit);
                let rows = src.split_to(complete);
                src.clear();
                if rows.is_empty() {
                    Err(hit.into())
                } else {
                    Ok(Some(rows))
                }
            }
        }
    }
}
