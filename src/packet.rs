use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use thiserror::Error;
use crate::sequence::SequenceBit;

/// seq (1) + payload length (2) + is_last (1) + checksum (4)
pub const HEADER_LEN: usize = 8;

/// The acknowledgement is a single byte with this value. It does not echo the sequence bit it
///  confirms.
pub const ACK_SENTINEL: u8 = 0xFF;
pub const ACK_DATAGRAM: [u8; 1] = [ACK_SENTINEL];

static CRC_32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC, i.e. the 'standard' CRC-32 used by zip, ethernet etc.)
pub fn checksum(payload: &[u8]) -> u32 {
    CRC_32.checksum(payload)
}

pub fn is_ack(datagram: &[u8]) -> bool {
    datagram == ACK_DATAGRAM
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated packet: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("payload length {len} exceeds the maximum segment size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("invalid sequence bit: {0}")]
    InvalidSequence(u8),

    #[error("invalid is_last flag: {0}")]
    InvalidLastFlag(u8),
}

/// A single data packet. The wire format is fixed and independent of the host's endianness or
///  struct layout - all numbers in network byte order (BE):
///
/// ```ascii
/// 0: sequence bit (u8) - 0 or 1
/// 1: payload length (u16)
/// 3: is_last flag (u8) - 0 or 1
/// 4: CRC-32 checksum of the payload (u32) - the header is *not* covered
/// 8: payload
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub sequence: SequenceBit,
    pub is_last: bool,
    pub checksum: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence: SequenceBit, payload: Bytes, is_last: bool) -> Packet {
        Packet {
            sequence,
            is_last,
            checksum: checksum(&payload),
            payload,
        }
    }

    /// Serializes a packet for the given payload, calculating the checksum on the fly
    pub fn encode(sequence: SequenceBit, payload: &[u8], is_last: bool) -> Result<Bytes, CodecError> {
        let payload_len = u16::try_from(payload.len())
            .map_err(|_| CodecError::PayloadTooLarge { len: payload.len(), max: u16::MAX as usize })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        Self::ser_header(&mut buf, sequence, payload_len, is_last, checksum(payload));
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload_len = self.payload_length()?;
        Self::ser_header(buf, self.sequence, payload_len, self.is_last, self.checksum);
        buf.put_slice(&self.payload);
        Ok(())
    }

    fn ser_header(buf: &mut BytesMut, sequence: SequenceBit, payload_len: u16, is_last: bool, checksum: u32) {
        buf.put_u8(sequence.to_wire());
        buf.put_u16(payload_len);
        buf.put_u8(is_last as u8);
        buf.put_u32(checksum);
    }

    /// Parses a packet without verifying its checksum: A structurally valid packet with a
    ///  corrupted payload is returned as `Ok`, leaving it to the caller to [Packet::verify] it.
    ///
    /// Bytes after the declared payload are ignored.
    pub fn decode(datagram: &[u8], max_segment: usize) -> Result<Packet, CodecError> {
        if datagram.len() < HEADER_LEN {
            return Err(CodecError::Truncated { expected: HEADER_LEN, actual: datagram.len() });
        }

        let mut buf = datagram;
        let raw_sequence = buf.get_u8();
        let payload_len = buf.get_u16() as usize;
        let raw_is_last = buf.get_u8();
        let checksum = buf.get_u32();

        if buf.remaining() < payload_len {
            return Err(CodecError::Truncated { expected: HEADER_LEN + payload_len, actual: datagram.len() });
        }
        if payload_len > max_segment {
            return Err(CodecError::PayloadTooLarge { len: payload_len, max: max_segment });
        }

        let sequence = SequenceBit::from_wire(raw_sequence)
            .ok_or(CodecError::InvalidSequence(raw_sequence))?;
        let is_last = match raw_is_last {
            0 => false,
            1 => true,
            other => return Err(CodecError::InvalidLastFlag(other)),
        };

        Ok(Packet {
            sequence,
            is_last,
            checksum,
            payload: Bytes::copy_from_slice(&buf[..payload_len]),
        })
    }

    /// Recomputes the checksum over the payload and compares it to the transmitted one
    pub fn verify(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }

    pub fn payload_length(&self) -> Result<u16, CodecError> {
        u16::try_from(self.payload.len())
            .map_err(|_| CodecError::PayloadTooLarge { len: self.payload.len(), max: u16::MAX as usize })
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_checksum_reference_value() {
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn test_encode_layout() {
        let encoded = Packet::encode(SequenceBit::ONE, b"123456789", true).unwrap();
        assert_eq!(encoded.as_ref(), b"\x01\x00\x09\x01\xcb\xf4\x39\x26123456789");
    }

    #[test]
    fn test_decode_encoded() {
        for len in 0..=1024 {
            let sequence = if len % 2 == 0 { SequenceBit::ZERO } else { SequenceBit::ONE };
            let is_last = len % 3 == 0;
            let payload = (0..len).map(|i| (i * 7) as u8).collect::<Vec<_>>();

            let encoded = Packet::encode(sequence, &payload, is_last).unwrap();
            assert_eq!(encoded.len(), HEADER_LEN + len);

            let decoded = Packet::decode(&encoded, 1024).unwrap();
            assert_eq!(decoded.sequence, sequence, "len {}", len);
            assert_eq!(decoded.is_last, is_last, "len {}", len);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice(), "len {}", len);
            assert!(decoded.verify(), "len {}", len);
        }
    }

    #[test]
    fn test_ser_matches_encode() {
        let packet = Packet::new(SequenceBit::ZERO, Bytes::from_static(b"abc"), false);
        let mut buf = BytesMut::new();
        packet.ser(&mut buf).unwrap();
        assert_eq!(buf.freeze(), Packet::encode(SequenceBit::ZERO, b"abc", false).unwrap());
        assert_eq!(packet.encoded_len(), 11);
    }

    #[rstest]
    #[case::empty(b"", CodecError::Truncated { expected: 8, actual: 0 })]
    #[case::partial_header(b"\0\0\x03\0\0\0\0", CodecError::Truncated { expected: 8, actual: 7 })]
    #[case::missing_payload(b"\0\0\x03\0\0\0\0\0ab", CodecError::Truncated { expected: 11, actual: 10 })]
    #[case::short_and_too_long(b"\0\x04\x01\0\0\0\0\0", CodecError::Truncated { expected: 1033, actual: 8 })]
    #[case::bad_sequence(b"\x02\0\0\0\0\0\0\0", CodecError::InvalidSequence(2))]
    #[case::bad_last_flag(b"\0\0\0\x07\0\0\0\0", CodecError::InvalidLastFlag(7))]
    fn test_decode_malformed(#[case] datagram: &[u8], #[case] expected: CodecError) {
        assert_eq!(Packet::decode(datagram, 1024), Err(expected));
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let mut datagram = vec![0u8; HEADER_LEN + 1025];
        datagram[1..3].copy_from_slice(&1025u16.to_be_bytes());

        assert_eq!(Packet::decode(&datagram, 1024), Err(CodecError::PayloadTooLarge { len: 1025, max: 1024 }));
        assert!(Packet::decode(&datagram, 1025).is_ok());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut datagram = Packet::encode(SequenceBit::ONE, b"xy", false).unwrap().to_vec();
        datagram.extend_from_slice(b"garbage");

        let decoded = Packet::decode(&datagram, 1024).unwrap();
        assert_eq!(decoded.payload.as_ref(), b"xy");
        assert!(decoded.verify());
    }

    #[rstest]
    #[case::first_byte(0)]
    #[case::middle(50)]
    #[case::last_byte(99)]
    fn test_flipped_payload_bit_fails_verification(#[case] offset: usize) {
        let mut datagram = Packet::encode(SequenceBit::ZERO, &[0x5a; 100], false).unwrap().to_vec();
        datagram[HEADER_LEN + offset] ^= 0x01;

        let decoded = Packet::decode(&datagram, 1024).unwrap();
        assert!(!decoded.verify());
    }

    #[test]
    fn test_flipped_header_bit_is_not_covered() {
        let mut datagram = Packet::encode(SequenceBit::ZERO, b"payload", false).unwrap().to_vec();
        datagram[0] ^= 0x01;

        let decoded = Packet::decode(&datagram, 1024).unwrap();
        assert_eq!(decoded.sequence, SequenceBit::ONE);
        assert!(decoded.verify());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; 65536];
        assert_eq!(
            Packet::encode(SequenceBit::ZERO, &payload, true),
            Err(CodecError::PayloadTooLarge { len: 65536, max: 65535 })
        );
    }

    #[rstest]
    #[case::ack(&[0xff], true)]
    #[case::empty(&[], false)]
    #[case::other_byte(&[0x00], false)]
    #[case::too_long(&[0xff, 0xff], false)]
    fn test_is_ack(#[case] datagram: &[u8], #[case] expected: bool) {
        assert_eq!(is_ack(datagram), expected);
    }
}
