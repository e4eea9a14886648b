//! On-disk frame format.
//!
//! Every persisted record is wrapped in a frame:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | len (4) | CBOR payload (len) | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers header and payload. A frame
//! cut short at the end of a file is a torn write and marks the end of the
//! valid data; a bad magic or checksum is corruption.

use crate::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes identifying a frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DSYN";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

const HEADER_SIZE: usize = 11;
const CRC_SIZE: usize = 4;

/// Payload type carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A delta record.
    Delta = 1,
    /// An offline queue item.
    QueueItem = 2,
    /// A per-device version state.
    VersionState = 3,
    /// The set of applied remote delta ids.
    AppliedIds = 4,
    /// A conflict history entry.
    Conflict = 5,
    /// The highest delta version ever appended.
    HighWater = 6,
}

impl FrameKind {
    /// Converts a byte to a frame kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Delta),
            2 => Some(Self::QueueItem),
            3 => Some(Self::VersionState),
            4 => Some(Self::AppliedIds),
            5 => Some(Self::Conflict),
            6 => Some(Self::HighWater),
            _ => None,
        }
    }

    /// Converts to a byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Encodes a value into a complete frame.
pub fn encode_frame<T: Serialize>(kind: FrameKind, value: &T) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload).map_err(|e| StorageError::codec(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::codec("frame payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&FRAME_MAGIC);
    data.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    data.push(kind.as_byte());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&payload);

    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Decodes a frame payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> StorageResult<T> {
    ciborium::from_reader(payload).map_err(|e| StorageError::codec(e.to_string()))
}

/// Frames read from a buffer.
#[derive(Debug, Default)]
pub struct DecodedFrames<'a> {
    /// Complete, verified frames in file order.
    pub frames: Vec<(FrameKind, &'a [u8])>,
    /// Length of the valid prefix; anything after it is a torn tail.
    pub valid_len: usize,
}

/// Splits a buffer into verified frames.
///
/// # Errors
///
/// Returns an error on bad magic, unsupported version, unknown kind or
/// checksum mismatch. A truncated final frame is not an error.
pub fn decode_frames(buf: &[u8]) -> StorageResult<DecodedFrames<'_>> {
    let mut decoded = DecodedFrames::default();
    let mut pos = 0;

    while pos < buf.len() {
        if buf.len() - pos < HEADER_SIZE {
            break;
        }
        let header = &buf[pos..pos + HEADER_SIZE];
        if header[0..4] != FRAME_MAGIC {
            return Err(StorageError::corrupted(format!("invalid magic at offset {pos}")));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > FRAME_VERSION {
            return Err(StorageError::corrupted(format!(
                "unsupported frame version {version} at offset {pos}"
            )));
        }
        let kind = FrameKind::from_byte(header[6]).ok_or_else(|| {
            StorageError::corrupted(format!("unknown frame kind {} at offset {pos}", header[6]))
        })?;
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if buf.len() - pos < total_len {
            break;
        }

        let payload_end = pos + HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            buf[payload_end],
            buf[payload_end + 1],
            buf[payload_end + 2],
            buf[payload_end + 3],
        ]);
        let computed_crc = compute_crc32(&buf[pos..payload_end]);
        if stored_crc != computed_crc {
            return Err(StorageError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        decoded
            .frames
            .push((kind, &buf[pos + HEADER_SIZE..payload_end]));
        pos += total_len;
        decoded.valid_len = pos;
    }

    Ok(decoded)
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
