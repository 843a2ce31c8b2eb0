//! Record framing over a chunked byte stream.
//!
//! The amplifier's TCP stream delivers arbitrary-length chunks; records are
//! delimiter-terminated. The extractor buffers partial input across chunks
//! and yields complete records in arrival order. No size limit is enforced:
//! the peer is a single trusted device, and a record that never terminates
//! would grow the buffer unboundedly.

/// Splits a byte stream into delimiter-terminated records.
#[derive(Debug)]
pub struct RecordExtractor {
    delimiter: u8,
    buffer: Vec<u8>,
}

impl RecordExtractor {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buffer: Vec::new(),
        }
    }

    /// Append a chunk of incoming bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Remove and return the earliest complete record, without its delimiter.
    ///
    /// Returns `None` when no complete record is buffered; callers loop until
    /// then. Zero-length records are passed through — record-shape validation
    /// belongs to the caller.
    pub fn next_record(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == self.delimiter)?;
        let mut record: Vec<u8> = self.buffer.drain(..=pos).collect();
        record.pop(); // drop the delimiter
        Some(String::from_utf8_lossy(&record).into_owned())
    }
}
