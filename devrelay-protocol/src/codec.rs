//! Streaming decoder for concatenated JSON records.

use crate::error::ProtocolError;
use crate::record::DeviceRecord;
use crate::INITIAL_BUFFER_CAPACITY;
use bytes::{Buf, BytesMut};
use serde_json::Deserializer;

/// Decodes a stream of back-to-back JSON objects into [`DeviceRecord`]s.
///
/// The decoder is transport-agnostic: callers push raw bytes with
/// [`extend`](Self::extend) in whatever chunks they arrive and pull records
/// with [`decode_next`](Self::decode_next). Objects may straddle chunk
/// boundaries and one chunk may carry several objects. Whitespace between
/// objects is skipped.
///
/// Bytes of a pending object are scanned once for its closing brace, so the
/// cost of decoding stays linear in the record size however it is chunked.
/// The partial object is also handed to the JSON parser whenever it has
/// doubled in size, which surfaces malformed input without waiting for the
/// object to close.
///
/// A decoder belongs to exactly one stream and only moves forward. After an
/// error the stream is considered poisoned and the decoder should be dropped.
pub struct RecordDecoder {
    buffer: BytesMut,
    /// Upper bound on a single record's encoded size (0 = unlimited).
    max_record_bytes: usize,
    scan: ObjectScan,
    /// Buffered size at which the pending object is next parsed eagerly.
    next_partial_check: usize,
    #[cfg(test)]
    examined: usize,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            max_record_bytes: 0,
            scan: ObjectScan::default(),
            next_partial_check: 0,
            #[cfg(test)]
            examined: 0,
        }
    }

    /// Limits the encoded size of a single record. Zero disables the limit.
    ///
    /// The size is measured from the record's opening brace; whitespace in
    /// front of it does not count.
    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next record from the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds only whitespace or the
    /// beginning of a record that is not yet complete.
    pub fn decode_next(&mut self) -> Result<Option<DeviceRecord>, ProtocolError> {
        if self.scan.pos == 0 {
            let skip = self
                .buffer
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(self.buffer.len());
            self.buffer.advance(skip);
        }

        match self.buffer.first().copied() {
            None => Ok(None),
            Some(b'{') => self.decode_object(),
            Some(b'[' | b'"' | b'-' | b'0'..=b'9' | b't' | b'f') => Err(ProtocolError::NotAnObject),
            // `null`, or bytes that are not JSON at all
            Some(_) => self.decode_other(),
        }
    }

    fn decode_object(&mut self) -> Result<Option<DeviceRecord>, ProtocolError> {
        #[cfg(test)]
        let scanned_from = self.scan.pos;
        let found = self.scan.advance(&self.buffer);
        #[cfg(test)]
        {
            self.examined += self.scan.pos - scanned_from;
        }

        let Some(end) = found else {
            self.check_size(self.buffer.len())?;
            if self.buffer.len() >= self.next_partial_check {
                self.next_partial_check = self.buffer.len() * 2;
                self.check_partial()?;
            }
            return Ok(None);
        };

        self.scan = ObjectScan::default();
        self.next_partial_check = 0;
        self.check_size(end)?;

        #[cfg(test)]
        {
            self.examined += end;
        }

        let record = serde_json::from_slice(&self.buffer[..end])?;
        self.buffer.advance(end);
        Ok(Some(record))
    }

    /// Parses the incomplete object so far, failing on anything but running
    /// out of input.
    fn check_partial(&mut self) -> Result<(), ProtocolError> {
        #[cfg(test)]
        {
            self.examined += self.buffer.len();
        }

        match Deserializer::from_slice(&self.buffer)
            .into_iter::<DeviceRecord>()
            .next()
        {
            Some(Err(e)) if !e.is_eof() => Err(ProtocolError::Json(e)),
            _ => Ok(()),
        }
    }

    fn decode_other(&mut self) -> Result<Option<DeviceRecord>, ProtocolError> {
        let (next, consumed) = {
            let mut stream = Deserializer::from_slice(&self.buffer).into_iter::<DeviceRecord>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            None => Ok(None),
            Some(Ok(record)) => {
                self.buffer.advance(consumed);
                Ok(Some(record))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(ProtocolError::Json(e)),
        }
    }

    /// Signals that the stream has ended.
    ///
    /// Succeeds when nothing but whitespace was left over; otherwise the peer
    /// hung up in the middle of a record.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        let pending = self
            .buffer
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .map(|start| self.buffer.len() - start);

        match pending {
            Some(buffered) => Err(ProtocolError::UnexpectedEof { buffered }),
            None => {
                self.buffer.clear();
                Ok(())
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if self.max_record_bytes > 0 && size > self.max_record_bytes {
            return Err(ProtocolError::RecordTooLarge {
                size,
                max: self.max_record_bytes,
            });
        }
        Ok(())
    }
}

/// Tracks nesting through a pending object so each byte is looked at once.
#[derive(Debug, Default)]
struct ObjectScan {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ObjectScan {
    /// Resumes scanning `buf`, which starts with the object's opening brace.
    /// Returns the object's length once its closing brace has been seen.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        while self.pos < buf.len() {
            let b = buf[self.pos];
            self.pos += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(self.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}
