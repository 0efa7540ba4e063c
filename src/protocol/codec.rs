use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{Buffer, Packet, PACKET_HEADER_SIZE};

/// MySQL packet codec for use with tokio Framed
///
/// Only complete frames are ever yielded; bytes past a frame boundary stay
/// in the accumulator and are consumed before the next socket read. When
/// the header declares more payload than is buffered, capacity is reserved
/// up front so oversized frames don't grow the buffer a read at a time.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= PACKET_HEADER_SIZE {
            let declared =
                src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);
            let total = PACKET_HEADER_SIZE + declared;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
        }
        Ok(Packet::decode(src))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Encoder for pre-framed buffers: the frames are written as-is
impl Encoder<Buffer> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Buffer, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}

/// Encoder that can encode raw bytes directly
impl Encoder<&[u8]> for PacketCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::test_util::frame;

    #[test]
    fn test_framing_roundtrip() {
        // Property: a concatenation of valid frames decodes to exactly those
        // frames, and re-encoding reproduces the input byte for byte.
        let input: Vec<Vec<u8>> = vec![
            frame(0, &[0x03, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1']),
            frame(1, &[0x01]),
            frame(2, &[]),
            frame(3, &vec![0xAB; 300]),
        ];
        let mut stream = BytesMut::new();
        for f in &input {
            stream.extend_from_slice(f);
        }
        let original = stream.clone();

        let mut codec = PacketCodec;
        let mut decoded = Vec::new();
        while let Some(p) = codec.decode(&mut stream).unwrap() {
            decoded.push(p);
        }
        assert_eq!(decoded.len(), input.len());

        let mut reencoded = BytesMut::new();
        for p in decoded {
            codec.encode(p, &mut reencoded).unwrap();
        }
        assert_eq!(&reencoded[..], &original[..]);
    }

    #[test]
    fn test_no_partial_frame_yielded() {
        let full = frame(0, &[0x03, b'a', b'b', b'c']);
        let mut codec = PacketCodec;

        // Feed the frame one byte at a time; nothing may come out early.
        let mut src = BytesMut::new();
        for (i, b) in full.iter().enumerate() {
            src.extend_from_slice(&[*b]);
            let out = codec.decode(&mut src).unwrap();
            if i + 1 < full.len() {
                assert!(out.is_none(), "partial frame yielded at byte {}", i);
            } else {
                let p = out.expect("complete frame not yielded");
                assert_eq!(&p.payload[..], &[0x03, b'a', b'b', b'c']);
            }
        }
    }

    #[test]
    fn test_residue_preserved_across_decodes() {
        let mut src = BytesMut::new();
        src.extend_from_slice(&frame(0, &[0x0e]));
        // half of a second frame
        let second = frame(1, &[0x03, b'x', b'y']);
        src.extend_from_slice(&second[..3]);

        let mut codec = PacketCodec;
        let first = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&first.payload[..], &[0x0e]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        // Deliver the rest; the residue completes the frame.
        src.extend_from_slice(&second[3..]);
        let p = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(p.sequence_id, 1);
        assert_eq!(&p.payload[..], &[0x03, b'x', b'y']);
    }

    #[test]
    fn test_reserves_for_declared_length() {
        // A header declaring a large payload must not be consumed until the
        // payload arrives.
        let mut src = BytesMut::new();
        src.extend_from_slice(&[0x00, 0x10, 0x00, 0x00]); // 4096-byte payload
        let mut codec = PacketCodec;
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), 4);

        src.extend_from_slice(&vec![0u8; 4096]);
        let p = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(p.payload.len(), 4096);
    }
}
