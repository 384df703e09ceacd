//! Framing for the multiplexer: length-prefix (4 bytes LE) + bincode payload.

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Control and data frames exchanged over one connection.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame in each direction.
    Hello { version: u8, public_key: PublicKey },
    /// Offer a new sub-stream running `protocol`.
    Open { stream: u64, protocol: String },
    Accept { stream: u64 },
    Reject { stream: u64, reason: String },
    Data { stream: u64, payload: Vec<u8> },
    Close { stream: u64 },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Open { .. } => "open",
            Frame::Accept { .. } => "accept",
            Frame::Reject { .. } => "reject",
            Frame::Data { .. } => "data",
            Frame::Close { .. } => "close",
        }
    }

    /// Stream id, for every frame except `Hello`.
    pub fn stream(&self) -> Option<u64> {
        match self {
            Frame::Hello { .. } => None,
            Frame::Open { stream, .. }
            | Frame::Accept { stream }
            | Frame::Reject { stream, .. }
            | Frame::Data { stream, .. }
            | Frame::Close { stream } => Some(*stream),
        }
    }
}

/// Encode a frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// On a partial buffer returns `NeedMore`; call again once more bytes arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame: Frame =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn hello() -> Frame {
        Frame::Hello {
            version: 1,
            public_key: *Identity::generate().public_key(),
        }
    }

    #[test]
    fn hello_decodes_to_same_frame() {
        let frame = hello();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
        assert_eq!(decoded.kind(), "hello");
        assert_eq!(decoded.stream(), None);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&hello()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let a = Frame::Open {
            stream: 1,
            protocol: "/ping/1.0.0".into(),
        };
        let b = Frame::Data {
            stream: 1,
            payload: vec![7; 100],
        };
        let mut buf = encode_frame(&a).unwrap();
        buf.extend(encode_frame(&b).unwrap());
        let (first, n) = decode_frame(&buf).unwrap();
        let (second, m) = decode_frame(&buf[n..]).unwrap();
        assert_eq!(first, a);
        assert_eq!(second.stream(), Some(1));
        assert_eq!(n + m, buf.len());
    }

    #[test]
    fn oversized_length_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut buf = 2u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff]);
        assert!(matches!(decode_frame(&buf), Err(FrameDecodeError::Decode(_))));
    }
}
