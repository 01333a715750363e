/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Pluggable byte sources and sinks.
//!
//! The codec never touches files or sockets itself: it pulls from a
//! [`ByteSource`] and pushes to a [`ByteSink`]. The adapters here cover the
//! in-memory cases used by tests and by catalog reloading; transports supply
//! their own implementations.

use ferrofast_core::FastError;

/// Status of a source or sink transfer that could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// No bytes can move right now; retry later.
    WouldBlock,
    /// The stream has ended; no further bytes will arrive.
    EndOfStream,
    /// The underlying transport failed.
    Io(String),
}

impl TransferError {
    /// Maps to the engine error space, reporting end-of-stream at the given
    /// byte offset.
    #[must_use]
    pub fn into_fast_error(self, byte_offset: u64) -> FastError {
        match self {
            Self::WouldBlock => FastError::WouldBlock,
            Self::EndOfStream => FastError::UnexpectedEndOfStream(
                ferrofast_core::DecodeContext::at_offset(byte_offset),
            ),
            Self::Io(message) => FastError::Io(message),
        }
    }
}

/// A pull-based byte stream the decoder reads from.
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes, returning how many were read.
    ///
    /// A return of `Ok(0)` is not allowed; sources report
    /// [`TransferError::WouldBlock`] or [`TransferError::EndOfStream`]
    /// instead.
    ///
    /// # Errors
    /// [`TransferError`] when no bytes can be produced.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError>;
}

/// A push-based byte stream the encoder writes to.
pub trait ByteSink {
    /// Writes up to `data.len()` bytes, returning how many were accepted.
    ///
    /// # Errors
    /// [`TransferError`] when no bytes can be accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransferError>;
}

/// In-memory source over a borrowed byte slice.
#[derive(Debug)]
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    /// Creates a source over the full slice.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet handed out.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Rewinds to the beginning of the slice.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

impl ByteSource for SliceSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        if self.pos == self.data.len() {
            return Err(TransferError::EndOfStream);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// In-memory sink accumulating into a `Vec<u8>`.
#[derive(Debug, Default)]
pub struct VecSink {
    buf: Vec<u8>,
}

impl VecSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// The bytes written so far.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the sink and returns its buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Discards all written bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl ByteSink for VecSink {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransferError> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_source_reads_and_ends() {
        let mut source = SliceSource::new(&[1, 2, 3]);
        let mut buf = [0u8; 2];
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(source.read(&mut buf).unwrap(), 1);
        assert_eq!(source.read(&mut buf), Err(TransferError::EndOfStream));
        source.reset();
        assert_eq!(source.remaining(), 3);
    }

    #[test]
    fn test_vec_sink_accumulates() {
        let mut sink = VecSink::new();
        assert_eq!(sink.write(&[9, 8]).unwrap(), 2);
        assert_eq!(sink.write(&[7]).unwrap(), 1);
        assert_eq!(sink.as_bytes(), &[9, 8, 7]);
    }

    #[test]
    fn test_transfer_error_mapping() {
        assert_eq!(
            TransferError::WouldBlock.into_fast_error(0),
            FastError::WouldBlock
        );
        assert!(matches!(
            TransferError::EndOfStream.into_fast_error(5),
            FastError::UnexpectedEndOfStream(ctx) if ctx.byte_offset == 5
        ));
    }
}
