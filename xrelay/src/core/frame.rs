//! Frame definition and serialization.
//!
//! A byte stream has no message boundaries, so every packet travels with an
//! explicit length in front of it. The receiver reads the header first and
//! then exactly as many payload bytes as it announces, whatever chunking the
//! stream applies in between.
//!
//! # Frame Format
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                   Payload Length (big endian)                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Payload...                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! No version byte, no checksum, no stream identifier: one connection
//! carries exactly one tunnel, identically framed in both directions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::MAX_PACKET_SIZE;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Frames a packet, returning header and payload as one buffer.
pub fn encode(packet: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + packet.len());
    encode_into(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Appends the framed packet to `dst`.
pub fn encode_into(packet: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(packet.len()).map_err(|_| Error::FrameTooLarge {
        len: packet.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(FRAME_HEADER_SIZE + packet.len());
    dst.put_u32(len);
    dst.put_slice(packet);
    Ok(())
}

/// Parses the length field from the first four bytes of `header`.
pub fn decode_header(header: &[u8]) -> Result<u32> {
    match header.get(..FRAME_HEADER_SIZE) {
        Some(&[a, b, c, d]) => Ok(u32::from_be_bytes([a, b, c, d])),
        _ => Err(Error::MalformedFrame {
            actual: header.len(),
            expected: FRAME_HEADER_SIZE,
        }),
    }
}

/// Codec for the relay wire format, for use with `Framed` streams.
///
/// Decoding yields the payload of each frame, possibly empty. A declared
/// length above `max_frame_length` is an error because the stream cannot be
/// resynchronised after it.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    /// Creates a codec accepting payloads up to [`MAX_PACKET_SIZE`].
    pub fn new() -> Self {
        Self {
            max_frame_length: MAX_PACKET_SIZE,
        }
    }

    /// Sets the maximum accepted payload length.
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    /// Returns the maximum accepted payload length.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = decode_header(&src[..FRAME_HEADER_SIZE])? as usize;
        if len > self.max_frame_length {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame_length,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        <Self as Encoder<&[u8]>>::encode(self, item.as_ref(), dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame_length {
            return Err(Error::FrameTooLarge {
                len: item.len(),
                max: self.max_frame_length,
            });
        }
        encode_into(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let frame = encode(b"abc").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let big = vec![0x11; 0x0102];
        let frame = encode(&big).unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x00, 0x01, 0x02]);
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + big.len());
    }

    #[test]
    fn test_decode_header() {
        assert_eq!(decode_header(&[0, 0, 5, 0xDC]).unwrap(), 1500);
        assert_eq!(decode_header(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), u32::MAX);
    }

    #[test]
    fn test_decode_header_short() {
        let err = decode_header(&[0, 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedFrame);
        assert!(decode_header(&[]).is_err());
    }

    #[test]
    fn test_roundtrip_through_codec() {
        let mut codec = FrameCodec::new();
        for len in [1usize, 20, 1400, MAX_PACKET_SIZE] {
            let packet: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = BytesMut::from(&encode(&packet).unwrap()[..]);
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded[..], &packet[..]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let first = vec![0xA1; 10];
        let second = vec![0xB2; 20];
        let mut chunk = BytesMut::new();
        encode_into(&first, &mut chunk).unwrap();
        encode_into(&second, &mut chunk).unwrap();
        assert_eq!(chunk.len(), 38);

        let mut codec = FrameCodec::new();
        let a = codec.decode(&mut chunk).unwrap().unwrap();
        let b = codec.decode(&mut chunk).unwrap().unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 20);
        assert_eq!(&a[..], &first[..]);
        assert_eq!(&b[..], &second[..]);
        assert!(codec.decode(&mut chunk).unwrap().is_none());
    }

    #[test]
    fn test_partial_header_waits_for_more() {
        let mut codec = FrameCodec::new();
        let frame = encode(b"hello").unwrap();

        let mut buf = BytesMut::from(&frame[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[2..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[6..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_length(16);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 17][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FrameTooLarge);

        let mut out = BytesMut::new();
        assert!(Encoder::<&[u8]>::encode(&mut codec, &[0u8; 17][..], &mut out).is_err());
    }

    #[test]
    fn test_empty_frame_decodes_to_empty_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let payload = codec.decode(&mut buf).unwrap().unwrap();
        assert!(payload.is_empty());
    }
}
