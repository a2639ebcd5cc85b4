//! Length-delimited frame codec for node connections and job subprocesses.
//!
//! Socket wire format: ASCII decimal byte length, `\n`, then exactly that
//! many bytes of gzip-compressed JSON. The subprocess pipe speaks the same
//! header but an uncompressed payload.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;
use crate::ProtocolError;

/// Longest header we accept: 20 decimal digits covers any u64 length.
const MAX_HEADER_LEN: usize = 20;

/// Codec for framing `Message` values over a byte stream.
///
/// The length prefix delimits interleaved frames on a long-lived duplex
/// connection while staying readable in a packet capture.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        FrameCodec { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Wait for the header line
        let newline = match src.iter().position(|&b| b == b'\n') {
            Some(pos) => pos,
            None => {
                if src.len() > MAX_HEADER_LEN {
                    return Err(ProtocolError::FrameDecode("header line too long".into()));
                }
                return Ok(None);
            }
        };

        let length: usize = std::str::from_utf8(&src[..newline])
            .ok()
            .and_then(|s| s.trim_end_matches('\r').parse().ok())
            .ok_or_else(|| ProtocolError::FrameDecode("malformed length header".into()))?;

        // Refuse before reading the payload
        if length > self.max_frame_size {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = newline + 1 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(newline + 1);
        let payload = src.split_to(length);

        let mut json = Vec::new();
        GzDecoder::new(&payload[..])
            .read_to_end(&mut json)
            .map_err(|e| ProtocolError::FrameDecode(format!("gzip: {e}")))?;

        let message: Message = serde_json::from_slice(&json)?;
        Ok(Some(message))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let payload = encoder.finish()?;

        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }

        let header = format!("{}\n", payload.len());
        dst.reserve(header.len() + payload.len());
        dst.put_slice(header.as_bytes());
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

/// Frame an uncompressed payload for the job subprocess pipe.
pub fn encode_pipe_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + MAX_HEADER_LEN);
    out.extend_from_slice(format!("{}\n", payload.len()).as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Read one uncompressed frame from a subprocess pipe.
pub async fn read_pipe_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = String::new();
    let read = reader.read_line(&mut header).await?;
    if read == 0 {
        return Err(ProtocolError::FrameDecode("pipe closed before header".into()));
    }

    let length: usize = header
        .trim()
        .parse()
        .map_err(|_| ProtocolError::FrameDecode("malformed pipe header".into()))?;

    if length > max {
        return Err(ProtocolError::MessageTooLarge { size: length, max });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
