//! Multiplexer wire frames.
//!
//! Every frame is a 9-byte header (`type: u8`, `stream_id: u32 BE`,
//! `length: u32 BE`) followed by `length` payload bytes. Connection-scoped
//! frames (ping, pong, goaway) carry stream id 0.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

pub(crate) const HEADER_LEN: usize = 9;

/// Hard cap on a single frame payload; data frames are chunked well below
/// this by the sender.
pub(crate) const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

const TYPE_OPEN: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_WINDOW: u8 = 3;
const TYPE_EOF: u8 = 4;
const TYPE_RESET: u8 = 5;
const TYPE_PING: u8 = 6;
const TYPE_PONG: u8 = 7;
const TYPE_GOAWAY: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Opens stream `id`. Both sides start from the protocol-default
    /// receive window and adjust with `Window` credits.
    Open { id: u32 },
    Data { id: u32, payload: Bytes },
    /// Grants the peer `credit` more bytes of send window on stream `id`.
    Window { id: u32, credit: u32 },
    /// Half-close: the sender will not send more data on stream `id`.
    Eof { id: u32 },
    /// Abrupt close of stream `id`, both directions.
    Reset { id: u32 },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    /// Orderly connection shutdown.
    GoAway,
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Open { .. } => TYPE_OPEN,
            Frame::Data { .. } => TYPE_DATA,
            Frame::Window { .. } => TYPE_WINDOW,
            Frame::Eof { .. } => TYPE_EOF,
            Frame::Reset { .. } => TYPE_RESET,
            Frame::Ping { .. } => TYPE_PING,
            Frame::Pong { .. } => TYPE_PONG,
            Frame::GoAway => TYPE_GOAWAY,
        }
    }

    fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { id }
            | Frame::Data { id, .. }
            | Frame::Window { id, .. }
            | Frame::Eof { id }
            | Frame::Reset { id } => *id,
            Frame::Ping { .. } | Frame::Pong { .. } | Frame::GoAway => 0,
        }
    }
}

pub(crate) struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[5..9]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(io::Error::other(format!("oversized mux frame: {length} bytes")));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let kind = header.get_u8();
        let id = header.get_u32();
        let _ = header.get_u32();
        let mut payload = src.split_to(length);

        let frame = match kind {
            TYPE_OPEN => Frame::Open { id },
            TYPE_DATA => Frame::Data { id, payload: payload.freeze() },
            TYPE_WINDOW => {
                if payload.len() != 4 {
                    return Err(io::Error::other("malformed WINDOW frame"));
                }
                Frame::Window { id, credit: payload.get_u32() }
            }
            TYPE_EOF => Frame::Eof { id },
            TYPE_RESET => Frame::Reset { id },
            TYPE_PING | TYPE_PONG => {
                if payload.len() != 8 {
                    return Err(io::Error::other("malformed PING frame"));
                }
                let nonce = payload.get_u64();
                if kind == TYPE_PING {
                    Frame::Ping { nonce }
                } else {
                    Frame::Pong { nonce }
                }
            }
            TYPE_GOAWAY => Frame::GoAway,
            other => return Err(io::Error::other(format!("unknown mux frame type {other}"))),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload_len = match &frame {
            Frame::Data { payload, .. } => payload.len(),
            Frame::Window { .. } => 4,
            Frame::Ping { .. } | Frame::Pong { .. } => 8,
            _ => 0,
        };
        dst.reserve(HEADER_LEN + payload_len);
        dst.put_u8(frame.kind());
        dst.put_u32(frame.stream_id());
        dst.put_u32(payload_len as u32);
        match frame {
            Frame::Data { payload, .. } => dst.extend_from_slice(&payload),
            Frame::Window { credit, .. } => dst.put_u32(credit),
            Frame::Ping { nonce } | Frame::Pong { nonce } => dst.put_u64(nonce),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_codec() {
        let frames = vec![
            Frame::Open { id: 1 },
            Frame::Data { id: 1, payload: Bytes::from_static(b"hello") },
            Frame::Window { id: 1, credit: 4096 },
            Frame::Eof { id: 1 },
            Frame::Reset { id: 3 },
            Frame::Ping { nonce: 7 },
            Frame::Pong { nonce: 7 },
            Frame::GoAway,
        ];

        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for frame in &frames {
            codec.encode(frame.clone(), &mut buf).unwrap();
        }
        for expected in &frames {
            let got = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[TYPE_OPEN, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TYPE_DATA);
        buf.put_u32(1);
        buf.put_u32((MAX_FRAME_PAYLOAD as u32) + 1);
        assert!(codec.decode(&mut buf).is_err());
    }
}
