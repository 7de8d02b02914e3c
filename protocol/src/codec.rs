//! # Length-Prefixed Framed Codec
//!
//! Reads and writes control envelopes on any byte-stream pair. Frame layout
//! is a big-endian `u32` length followed by that many bytes of JSON payload.
//!
//! The read side and the write side each hold their own mutex: one reader
//! and one writer run concurrently, while concurrent writers (and readers)
//! are serialised so frames never interleave.

use crate::error::ProtocolError;
use crate::messages::{Envelope, MessageType, StreamHeader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Maximum serialized size of a control envelope.
pub const MAX_ENVELOPE_FRAME: usize = 65_536;

/// Maximum serialized size of a stream header.
pub const MAX_HEADER_FRAME: usize = 4_096;

/// Writes one length-prefixed frame, enforcing `max`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max: usize,
) -> Result<(), ProtocolError> {
    if payload.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame, enforcing `max` and rejecting empty
/// frames. EOF before the first length byte is a clean close; EOF anywhere
/// after it is a truncated frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    if reader.read(&mut len_bytes[..1]).await? == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    reader
        .read_exact(&mut len_bytes[1..])
        .await
        .map_err(truncated)?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 {
        return Err(ProtocolError::InvalidMessage("zero-length frame".into()));
    }
    if len > max {
        return Err(ProtocolError::FrameTooLarge { size: len, max });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(truncated)?;
    Ok(payload)
}

fn truncated(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::InvalidMessage("connection closed mid-frame".into())
    } else {
        ProtocolError::Io(e)
    }
}

/// Writes one stream header frame (4 KiB limit).
pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &StreamHeader,
) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(header)?;
    write_frame(writer, &payload, MAX_HEADER_FRAME).await
}

/// Reads one stream header frame (4 KiB limit).
pub async fn read_stream_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<StreamHeader, ProtocolError> {
    let payload = read_frame(reader, MAX_HEADER_FRAME).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| ProtocolError::InvalidMessage(format!("bad stream header: {e}")))
}

/// First frame of a server-opened stream.
///
/// Both envelopes and stream headers are JSON objects with a `type` field;
/// the dispatcher branches on it. A control type (e.g. `shutdown` on a fresh
/// control stream) parses as an envelope, anything else as a stream header.
#[derive(Debug)]
pub enum FirstFrame {
    Control(Envelope),
    Header(StreamHeader),
}

/// Reads the first frame of a server-opened stream and dispatches on its
/// `type` field.
pub async fn read_first_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FirstFrame, ProtocolError> {
    #[derive(serde::Deserialize)]
    struct TypeProbe {
        #[serde(rename = "type")]
        kind: String,
    }

    let payload = read_frame(reader, MAX_HEADER_FRAME).await?;
    let probe: TypeProbe = serde_json::from_slice(&payload)
        .map_err(|e| ProtocolError::InvalidMessage(format!("untyped first frame: {e}")))?;
    match probe.kind.as_str() {
        "http" | "tcp" | "websocket" => {
            let header = serde_json::from_slice(&payload)
                .map_err(|e| ProtocolError::InvalidMessage(format!("bad stream header: {e}")))?;
            Ok(FirstFrame::Header(header))
        }
        _ => {
            let envelope = serde_json::from_slice(&payload)
                .map_err(|e| ProtocolError::InvalidMessage(format!("bad control envelope: {e}")))?;
            Ok(FirstFrame::Control(envelope))
        }
    }
}

/// Envelope codec over a split byte stream.
pub struct FramedCodec<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl<S: AsyncRead + AsyncWrite> FramedCodec<ReadHalf<S>, WriteHalf<S>> {
    /// Splits a duplex stream and wraps both halves.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> FramedCodec<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Reads one envelope. Holding the read mutex for the whole frame keeps
    /// concurrent readers from splitting a frame between them.
    pub async fn read_message(&self) -> Result<Envelope, ProtocolError> {
        let mut reader = self.reader.lock().await;
        let payload = read_frame(&mut *reader, MAX_ENVELOPE_FRAME).await?;
        serde_json::from_slice(&payload)
            .map_err(|e| ProtocolError::InvalidMessage(format!("bad envelope: {e}")))
    }

    /// Serialises and writes one envelope under the write mutex.
    pub async fn write_message(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(envelope)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &payload, MAX_ENVELOPE_FRAME).await
    }

    /// Convenience for request/response exchanges: writes, then reads one
    /// envelope and checks its type.
    pub async fn round_trip(
        &self,
        envelope: &Envelope,
        expect: MessageType,
    ) -> Result<Envelope, ProtocolError> {
        self.write_message(envelope).await?;
        let reply = self.read_message().await?;
        if reply.kind != expect {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected {expect:?} reply, got {:?}",
                reply.kind
            )));
        }
        Ok(reply)
    }

    /// Half-closes the write side, signalling the peer we are done sending.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}
