use crate::command::Stream;
use crate::error::{Result, SubprocError};

/// Caller-supplied input waiting to be written to a child's stdin.
#[derive(Debug)]
pub(crate) struct PendingInput<'a> {
    data: &'a [u8],
    written: usize,
}

impl<'a> PendingInput<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, written: 0 }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        self.data.get(self.written..).unwrap_or_default()
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.written = self.written.saturating_add(n).min(self.data.len());
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.written == self.data.len()
    }
}

/// Output captured from one of the child's streams.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    limit: Option<usize>,
}

impl OutputBuffer {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    /// Append a chunk, failing once the stream would grow past its limit.
    pub(crate) fn append(&mut self, stream: Stream, chunk: &[u8]) -> Result<()> {
        if let Some(limit) = self.limit
            && self.bytes.len().saturating_add(chunk.len()) > limit
        {
            return Err(SubprocError::OutputLimitExceeded { stream, limit });
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
