// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chunked message codec for low-MTU transports.
//!
//! Radio links (BLE in particular) cap a single write far below a useful
//! message size, so payloads are split into frames that each fit one MTU:
//!
//! ```text
//! [seq u16 BE][total u16 BE][payload ≤ mtu − 4]
//! ```
//!
//! The radio itself lives behind a transport interface owned by the platform
//! shells; this codec is the shared wire format.

/// Frame header: sequence number + total frame count, both big-endian u16.
const HEADER_BYTES: usize = 4;

/// Frames per message are bounded by the u16 `total` field.
const MAX_FRAMES: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("mtu {0} too small: a frame must fit the header plus one byte")]
    MtuTooSmall(usize),
    #[error("message needs {needed} frames but the header caps at {MAX_FRAMES}")]
    TooManyFrames { needed: usize },
    #[error("frame {index} is shorter than the {HEADER_BYTES}-byte header")]
    FrameTooShort { index: usize },
    #[error("frame {index} claims total {claimed}, expected {expected}")]
    InconsistentTotal {
        index: usize,
        claimed: u16,
        expected: u16,
    },
    #[error("missing frame {seq}")]
    MissingFrame { seq: u16 },
    #[error("duplicate frame {seq}")]
    DuplicateFrame { seq: u16 },
    #[error("no frames")]
    Empty,
}

/// Split `data` into MTU-sized frames. An empty payload still produces one
/// (header-only) frame so the receiver can distinguish "empty message" from
/// "no message".
pub fn encode(data: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, ChunkError> {
    if mtu <= HEADER_BYTES {
        return Err(ChunkError::MtuTooSmall(mtu));
    }
    let chunk_size = mtu - HEADER_BYTES;
    let total = if data.is_empty() {
        1
    } else {
        data.len().div_ceil(chunk_size)
    };
    if total > MAX_FRAMES {
        return Err(ChunkError::TooManyFrames { needed: total });
    }

    let mut frames = Vec::with_capacity(total);
    for seq in 0..total {
        let start = seq * chunk_size;
        let end = (start + chunk_size).min(data.len());
        let mut frame = Vec::with_capacity(HEADER_BYTES + end.saturating_sub(start));
        frame.extend_from_slice(&(seq as u16).to_be_bytes());
        frame.extend_from_slice(&(total as u16).to_be_bytes());
        if start < data.len() {
            frame.extend_from_slice(&data[start..end]);
        }
        frames.push(frame);
    }
    Ok(frames)
}

/// Reassemble frames produced by [`encode`]. Frames may arrive in any order;
/// duplicates and gaps are detected.
pub fn decode(frames: &[Vec<u8>]) -> Result<Vec<u8>, ChunkError> {
    if frames.is_empty() {
        return Err(ChunkError::Empty);
    }

    let mut expected_total: Option<u16> = None;
    let mut slots: Vec<Option<&[u8]>> = Vec::new();

    for (index, frame) in frames.iter().enumerate() {
        if frame.len() < HEADER_BYTES {
            return Err(ChunkError::FrameTooShort { index });
        }
        let seq = u16::from_be_bytes([frame[0], frame[1]]);
        let total = u16::from_be_bytes([frame[2], frame[3]]);
        match expected_total {
            None => {
                expected_total = Some(total);
                slots.resize(total as usize, None);
            }
            Some(expected) if expected != total => {
                return Err(ChunkError::InconsistentTotal {
                    index,
                    claimed: total,
                    expected,
                });
            }
            Some(_) => {}
        }
        let slot = slots
            .get_mut(seq as usize)
            .ok_or(ChunkError::MissingFrame { seq })?;
        if slot.is_some() {
            return Err(ChunkError::DuplicateFrame { seq });
        }
        *slot = Some(&frame[HEADER_BYTES..]);
    }

    let mut out = Vec::new();
    for (seq, slot) in slots.iter().enumerate() {
        match slot {
            Some(payload) => out.extend_from_slice(payload),
            None => return Err(ChunkError::MissingFrame { seq: seq as u16 }),
        }
    }
    Ok(out)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
