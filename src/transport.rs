//! Fragmentation layer for the 20-byte GATT pipe.
//!
//! Every frame on the RX/TX characteristics is at most 20 bytes: one header
//! byte plus up to [`MTU`] payload bytes. The header's low bit marks the
//! first chunk of a frame; bits 1–2 carry the segment kind, which doubles as
//! the end-of-frame marker (a non-`0` kind terminates the frame).

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Payload bytes per chunk (20-byte GATT write minus the header byte).
pub const MTU: usize = 19;

const HEADER_IS_START: u8 = 0b01;

/// How the bytes of a completed frame are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// The frame is cleartext (only used before login).
    Plaintext = 1,
    /// The frame is AES-CCM ciphertext.
    Ciphertext = 2,
}

impl SegmentKind {
    fn from_header_bits(bits: u8) -> Result<Option<Self>> {
        match bits {
            0 => Ok(None),
            1 => Ok(Some(SegmentKind::Plaintext)),
            2 => Ok(Some(SegmentKind::Ciphertext)),
            other => Err(Error::Protocol(format!(
                "invalid segment kind bits {other:#04b} in fragment header"
            ))),
        }
    }
}

/// Splits one outgoing frame into MTU-sized chunks.
///
/// The first chunk carries the start bit; only the last chunk carries the
/// frame's [`SegmentKind`], all intermediate chunks carry kind `0` ("more to
/// come"). A frame that fits a single chunk sets both in one header byte.
#[derive(Debug)]
pub struct Transmitter {
    kind: SegmentKind,
    chunks: VecDeque<Vec<u8>>,
    first: bool,
}

impl Transmitter {
    pub fn new(kind: SegmentKind, payload: &[u8]) -> Self {
        let mut chunks: VecDeque<Vec<u8>> =
            payload.chunks(MTU).map(<[u8]>::to_vec).collect();
        if chunks.is_empty() {
            chunks.push_back(Vec::new());
        }
        tracing::debug!(chunks = chunks.len(), "fragmenting outgoing frame");
        Transmitter {
            kind,
            chunks,
            first: true,
        }
    }

    /// The next wire-ready chunk (header byte included), or `None` once the
    /// whole frame has been emitted.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let body = self.chunks.pop_front()?;
        let kind_bits = if self.chunks.is_empty() {
            self.kind as u8
        } else {
            0
        };
        let start_bit = if self.first { HEADER_IS_START } else { 0 };
        self.first = false;

        let mut chunk = Vec::with_capacity(1 + body.len());
        chunk.push(start_bit | (kind_bits << 1));
        chunk.extend_from_slice(&body);
        Some(chunk)
    }
}

/// Reassembles incoming chunks into complete frames.
///
/// There is no length field on the wire: a frame only completes when a chunk
/// with a non-zero kind arrives, and a lost trailing chunk leaves the buffer
/// parked until the next start chunk replaces it.
#[derive(Debug, Default)]
pub struct Receiver {
    buffer: Vec<u8>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received chunk. Returns `Ok(None)` while the frame is still
    /// incomplete, and `Ok(Some((kind, frame)))` when the terminal chunk
    /// arrives.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<(SegmentKind, Vec<u8>)>> {
        let (&header, body) = chunk
            .split_first()
            .ok_or_else(|| Error::Protocol("empty fragment".into()))?;

        if header & HEADER_IS_START != 0 {
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(body);

        match SegmentKind::from_header_bits(header >> 1)? {
            None => {
                tracing::debug!("fragment is part of a larger frame");
                Ok(None)
            }
            Some(kind) => Ok(Some((kind, std::mem::take(&mut self.buffer)))),
        }
    }
}
