//! Inbound audio chunker
//!
//! The carrier delivers 20 ms (160-byte) mu-law frames; the STT provider
//! wants 100 ms (1600-byte) sends. The chunker buffers carrier frames and
//! emits full STT chunks. Frames arriving before the STT socket is ready
//! are dropped silently by the caller.

use crate::STT_CHUNK_BYTES;

/// Accumulates carrier frames into STT-sized chunks
#[derive(Debug, Default)]
pub struct InboundChunker {
    buffer: Vec<u8>,
}

impl InboundChunker {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(2 * STT_CHUNK_BYTES),
        }
    }

    /// Feed one carrier frame; returns any completed chunks.
    pub fn push(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(frame);
        let mut chunks = Vec::new();
        while self.buffer.len() >= STT_CHUNK_BYTES {
            let rest = self.buffer.split_off(STT_CHUNK_BYTES);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// Remaining partial chunk, if any; used at teardown
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_to_chunk_size() {
        let mut chunker = InboundChunker::new();
        // Nine 160-byte frames: not enough for a 1600-byte chunk
        for _ in 0..9 {
            assert!(chunker.push(&[0u8; 160]).is_empty());
        }
        // The tenth completes one chunk
        let chunks = chunker.push(&[0u8; 160]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), STT_CHUNK_BYTES);
    }

    #[test]
    fn test_oversized_frame_yields_multiple_chunks() {
        let mut chunker = InboundChunker::new();
        let chunks = chunker.push(&vec![1u8; 3 * STT_CHUNK_BYTES + 40]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunker.flush().unwrap().len(), 40);
        assert!(chunker.flush().is_none());
    }

    #[test]
    fn test_flush_empty() {
        let mut chunker = InboundChunker::new();
        assert!(chunker.flush().is_none());
    }
}
