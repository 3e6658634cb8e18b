//! On-disk record framing.
//!
//! Format (see `SPEC_FULL.md` §6): `[id_len: u32 BE][id bytes][payload_len:
//! u64 BE][payload bytes][crc32c trailer: u32 BE]`. The checksum covers
//! everything preceding the trailer itself, following the same formula as
//! `vector_buffers::disk_v2::record` (`CRC32(BE(len-prefixed fields) +
//! payload)`), adapted from that module's zero-copy `rkyv` archive to a
//! plain sequentially-scannable frame so that `scan` can find "the longest
//! prefix of well-framed records" with nothing fancier than a byte cursor.

use crc32fast::Hasher;

use crate::ids::MessageId;

const LEN_PREFIX: usize = 4;
const PAYLOAD_LEN_PREFIX: usize = 8;
const TRAILER_LEN: usize = 4;

/// Result of attempting to decode one record from the head of a buffer.
pub enum RecordStatus {
    /// A complete, checksum-valid record was decoded.
    Valid {
        id: MessageId,
        payload: Vec<u8>,
        /// Total on-disk size of this record's frame, in bytes.
        total_size: u64,
    },
    /// A complete frame was read, but the checksum did not match.
    Corrupted { calculated: u32, actual: u32 },
    /// The buffer does not yet contain a complete frame.
    Incomplete,
}

/// Encodes `(id, payload)` into its on-disk frame.
pub fn encode_record(id: MessageId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LEN_PREFIX + MessageId::LEN + PAYLOAD_LEN_PREFIX + payload.len() + TRAILER_LEN);
    buf.extend_from_slice(&(MessageId::LEN as u32).to_be_bytes());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let checksum = hasher.finalize();
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf
}

/// Size, in bytes, of the on-disk frame for a record with the given
/// payload length.
pub fn framed_len(payload_len: usize) -> u64 {
    (LEN_PREFIX + MessageId::LEN + PAYLOAD_LEN_PREFIX + payload_len + TRAILER_LEN) as u64
}

/// Attempts to decode one record from the head of `buf`.
///
/// Returns [`RecordStatus::Incomplete`] if `buf` does not yet hold a full
/// frame; callers performing a recovery scan treat this as "stop here, the
/// rest is either in-flight or torn by a crash" and truncate.
pub fn try_decode_record(buf: &[u8]) -> RecordStatus {
    if buf.len() < LEN_PREFIX {
        return RecordStatus::Incomplete;
    }
    let id_len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if id_len != MessageId::LEN {
        // Not a frame we understand; treat as end-of-valid-data rather
        // than a hard error so a scan can still recover the valid prefix.
        return RecordStatus::Incomplete;
    }
    let header_end = LEN_PREFIX + id_len + PAYLOAD_LEN_PREFIX;
    if buf.len() < header_end {
        return RecordStatus::Incomplete;
    }

    let id_bytes: [u8; 16] = buf[LEN_PREFIX..LEN_PREFIX + id_len].try_into().unwrap();
    let payload_len =
        u64::from_be_bytes(buf[LEN_PREFIX + id_len..header_end].try_into().unwrap()) as usize;

    let payload_end = header_end + payload_len;
    let frame_end = payload_end + TRAILER_LEN;
    if buf.len() < frame_end {
        return RecordStatus::Incomplete;
    }

    let actual = u32::from_be_bytes(buf[payload_end..frame_end].try_into().unwrap());

    let mut hasher = Hasher::new();
    hasher.update(&buf[0..payload_end]);
    let calculated = hasher.finalize();

    if calculated != actual {
        return RecordStatus::Corrupted { calculated, actual };
    }

    RecordStatus::Valid {
        id: MessageId::from_bytes(id_bytes),
        payload: buf[header_end..payload_end].to_vec(),
        total_size: frame_end as u64,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips() {
        let id = MessageId::from_bytes([7; 16]);
        let frame = encode_record(id, b"hello world");
        assert_eq!(frame.len() as u64, framed_len(11));

        match try_decode_record(&frame) {
            RecordStatus::Valid {
                id: got_id,
                payload,
                total_size,
            } => {
                assert_eq!(got_id, id);
                assert_eq!(payload, b"hello world");
                assert_eq!(total_size, frame.len() as u64);
            }
            _ => panic!("expected a valid record"),
        }
    }

    #[test]
    fn detects_truncation() {
        let id = MessageId::from_bytes([1; 16]);
        let frame = encode_record(id, b"payload");
        let truncated = &frame[..frame.len() - 2];
        assert!(matches!(try_decode_record(truncated), RecordStatus::Incomplete));
    }

    #[test]
    fn detects_corruption() {
        let id = MessageId::from_bytes([1; 16]);
        let mut frame = encode_record(id, b"payload");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            try_decode_record(&frame),
            RecordStatus::Corrupted { .. }
        ));
    }
}
