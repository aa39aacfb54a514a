//! Binary transform frames.
//!
//! A frame is a sequence of 32-bit little-endian words. Each per-sender group
//! is laid out as:
//!
//! ```text
//! word 0      sender session id (never 0)
//! word 1      entry count N (<= MAX_ENTRIES_PER_GROUP)
//! N x 7 words sync_id, rot.x, rot.y, rot.z, pos.x, pos.y, pos.z
//! ```
//!
//! The relay concatenates groups from several senders into one buffer and may
//! leave zero words between them. Decoders skip any run of zero words where a
//! group header is expected.

use fastsync_core::{SessionId, SyncId, TRANSFORM_FIELDS, Transform};
use thiserror::Error;

// ============================================================================
// Layout Constants
// ============================================================================

/// Words in a group header (sender id, entry count).
pub const HEADER_WORDS: usize = 2;

/// Words per entry (sync id plus six transform fields).
pub const ENTRY_WORDS: usize = 1 + TRANSFORM_FIELDS;

/// Largest entry count a well-formed group may declare.
pub const MAX_ENTRIES_PER_GROUP: u32 = 1024;

/// Filler word between groups; doubles as the reserved sender id.
pub const PADDING_WORD: u32 = 0;

/// Zero-centre offset of the quantized encoding (2^31).
const QUANTIZE_OFFSET: f64 = 2_147_483_648.0;

/// Default fixed-point factor of the quantized encoding.
pub const DEFAULT_QUANTIZE_SCALE: f64 = 1000.0;

// ============================================================================
// Frame Types
// ============================================================================

/// One object's state inside a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub sync_id: SyncId,
    pub transform: Transform,
}

impl Entry {
    pub fn new(sync_id: SyncId, transform: Transform) -> Self {
        Self { sync_id, transform }
    }
}

/// All entries one sender contributed to a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub sender: SessionId,
    pub entries: Vec<Entry>,
}

/// Errors that abort decoding of a whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame length {len} is not a multiple of 4 bytes")]
    UnalignedLength { len: usize },

    #[error("sender {sender} declares {count} entries, more than the limit of 1024")]
    EntryCountExceeded { sender: SessionId, count: u32 },

    #[error("group of sender {sender} at word {offset} needs {needed} words, only {available} remain")]
    Truncated {
        sender: SessionId,
        offset: usize,
        needed: usize,
        available: usize,
    },
}

// ============================================================================
// Field Encoding
// ============================================================================

/// How a transform float is stored in a 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FieldEncoding {
    /// IEEE-754 bit pattern, bit-exact.
    #[default]
    Exact,
    /// Fixed point: `round(v * scale + 2^31)`, saturating to the u32 range.
    Quantized { scale: f64 },
}

impl FieldEncoding {
    /// Quantized encoding with the default factor of 1000 (three decimals).
    pub fn quantized() -> Self {
        Self::Quantized {
            scale: DEFAULT_QUANTIZE_SCALE,
        }
    }

    pub fn encode_field(self, value: f32) -> u32 {
        match self {
            Self::Exact => value.to_bits(),
            Self::Quantized { scale } => {
                let scaled = (f64::from(value) * scale + QUANTIZE_OFFSET).round();
                // Float-to-int `as` saturates and maps NaN to 0.
                scaled as u32
            }
        }
    }

    pub fn decode_field(self, word: u32) -> f32 {
        match self {
            Self::Exact => f32::from_bits(word),
            Self::Quantized { scale } => ((f64::from(word) - QUANTIZE_OFFSET) / scale) as f32,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Encoder/decoder for transform frames under one field encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameCodec {
    encoding: FieldEncoding,
}

impl FrameCodec {
    pub fn new(encoding: FieldEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> FieldEncoding {
        self.encoding
    }

    /// Encode one sender's group.
    pub fn encode(&self, sender: SessionId, entries: &[Entry]) -> Vec<u8> {
        let words = HEADER_WORDS + entries.len() * ENTRY_WORDS;
        let mut out = Vec::with_capacity(words * 4);
        push_word(&mut out, sender);
        push_word(&mut out, entries.len() as u32);
        for entry in entries {
            push_word(&mut out, entry.sync_id);
            for field in entry.transform.to_array() {
                push_word(&mut out, self.encoding.encode_field(field));
            }
        }
        out
    }

    /// Decode every group in `bytes`.
    ///
    /// Groups sent by `receiver` are validated but left out of the result so a
    /// session never applies its own echo. Any error discards the whole frame.
    pub fn decode(
        &self,
        bytes: &[u8],
        receiver: Option<SessionId>,
    ) -> Result<Vec<Group>, DecodeError> {
        if bytes.len() % 4 != 0 {
            return Err(DecodeError::UnalignedLength { len: bytes.len() });
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut groups = Vec::new();
        let mut idx = 0;
        while idx < words.len() {
            let sender = words[idx];
            if sender == PADDING_WORD {
                idx += 1;
                continue;
            }

            let available = words.len() - idx;
            let Some(&count) = words.get(idx + 1) else {
                return Err(DecodeError::Truncated {
                    sender,
                    offset: idx,
                    needed: HEADER_WORDS,
                    available,
                });
            };
            if count > MAX_ENTRIES_PER_GROUP {
                return Err(DecodeError::EntryCountExceeded { sender, count });
            }
            let needed = HEADER_WORDS + count as usize * ENTRY_WORDS;
            if needed > available {
                return Err(DecodeError::Truncated {
                    sender,
                    offset: idx,
                    needed,
                    available,
                });
            }

            let body = &words[idx + HEADER_WORDS..idx + needed];
            idx += needed;

            if receiver == Some(sender) {
                continue;
            }
            let entries = body
                .chunks_exact(ENTRY_WORDS)
                .map(|w| {
                    let mut fields = [0.0f32; TRANSFORM_FIELDS];
                    for (field, word) in fields.iter_mut().zip(&w[1..]) {
                        *field = self.encoding.decode_field(*word);
                    }
                    Entry::new(w[0], Transform::from_array(fields))
                })
                .collect();
            groups.push(Group { sender, entries });
        }
        Ok(groups)
    }
}

fn push_word(out: &mut Vec<u8>, word: u32) {
    out.extend_from_slice(&word.to_le_bytes());
}

/// Encode with the exact (bit-pattern) encoding.
pub fn encode(sender: SessionId, entries: &[Entry]) -> Vec<u8> {
    FrameCodec::default().encode(sender, entries)
}

/// Decode with the exact encoding, keeping every group.
pub fn decode(bytes: &[u8]) -> Result<Vec<Group>, DecodeError> {
    FrameCodec::default().decode(bytes, None)
}

// ============================================================================
// Tests
// ============================================================================
