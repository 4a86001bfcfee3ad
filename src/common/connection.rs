//! # Frame Codec
//!
//! Encodes and decodes single protocol frames over a byte stream.
//!
//! ## Wire Protocol
//!
//! Every envelope is serialized to JSON, compressed with zlib, and sent with a
//! 4-byte length prefix (big-endian) describing the *compressed* size:
//! ```text
//! [4 bytes: compressed length] [N bytes: zlib(JSON envelope)]
//! ```
//!
//! Frames longer than [`MAX_FRAME_SIZE`] are rejected as soon as the header is
//! read. The connection that produced them cannot be resynchronized and must be
//! dropped by the caller.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::messages::Envelope;

/// Maximum allowed compressed frame body (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Size of the length prefix in bytes.
const HEADER_LEN: usize = 4;

/// Errors that terminate the connection they occur on.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length prefix announces a body above [`MAX_FRAME_SIZE`].
    #[error("frame too large: {length} bytes (max: {max} bytes)")]
    TooLarge { length: usize, max: usize },

    /// The body could not be decompressed or parsed as an envelope.
    #[error("corrupt frame: {0}")]
    Corrupt(String),

    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode an envelope into one complete frame.
///
/// # Returns
/// - `Ok(Vec<u8>)`: length prefix followed by the compressed body
/// - `Err(FrameError::TooLarge)`: the compressed body would exceed [`MAX_FRAME_SIZE`]
///
/// Output is deterministic for identical input.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(envelope).map_err(|e| FrameError::Corrupt(e.to_string()))?;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    if compressed.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            length: compressed.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + compressed.len());
    frame.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// Decompress and parse a frame body.
fn decode_body(body: &[u8]) -> Result<Envelope, FrameError> {
    let mut json = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut json)
        .map_err(|e| FrameError::Corrupt(format!("decompression failed: {}", e)))?;

    serde_json::from_slice(&json).map_err(|e| FrameError::Corrupt(format!("invalid envelope: {}", e)))
}

/// Read exactly one frame from the stream.
///
/// # Returns
/// - `Ok(Some(Envelope))`: a complete frame was read and decoded
/// - `Ok(None)`: the stream ended, either cleanly or in the middle of a frame
/// - `Err(FrameError)`: oversized or corrupt frame, or an I/O failure
///
/// # Protocol
/// 1. Reads the 4-byte length prefix (big-endian u32)
/// 2. Rejects lengths above [`MAX_FRAME_SIZE`] before touching the body
/// 3. Reads the body, looping over partial reads until it is complete
/// 4. Decompresses and deserializes the envelope
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; HEADER_LEN];
    if !read_full(reader, &mut length_buf).await? {
        return Ok(None);
    }

    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    if !read_full(reader, &mut body).await? {
        return Ok(None);
    }

    decode_body(&body).map(Some)
}

/// Encode an envelope and write the complete frame, then flush.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` completely. Returns `false` if the stream closed first.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::messages::MessageType;

    #[tokio::test]
    async fn test_round_trip() {
        let envelope = Envelope::chat_at("10:00:00", "alice", &"x".repeat(1000));
        let frame = encode(&envelope).unwrap();

        let mut reader = frame.as_slice();
        let decoded = read_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, Some(envelope));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_unicode_broadcast() {
        let envelope = Envelope::broadcast("[10:00:00] zoë: héllo 👋".to_string());
        let frame = encode(&envelope).unwrap();
        let decoded = read_frame(&mut frame.as_slice()).await.unwrap().unwrap();
        assert_eq!(decoded.kind, MessageType::Broadcast);
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_length_prefix_is_compressed_size() {
        let frame = encode(&Envelope::chat_at("10:00:00", "alice", "hi")).unwrap();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - HEADER_LEN);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let envelope = Envelope::chat_at("12:34:56", "bob", "same input");
        assert_eq!(encode(&envelope).unwrap(), encode(&envelope).unwrap());
    }

    #[tokio::test]
    async fn test_consecutive_frames_stay_aligned() {
        let first = Envelope::chat_at("10:00:00", "alice", "one");
        let second = Envelope::chat_at("10:00:01", "alice", "two");
        let mut bytes = encode(&first).unwrap();
        bytes.extend(encode(&second).unwrap());

        let mut reader = bytes.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let envelope = Envelope::chat_at("10:00:00", "alice", &"partial ".repeat(200));
        let frame = encode(&envelope).unwrap();

        // A tiny pipe forces the reader to collect the frame in small pieces.
        let (mut tx, mut rx) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            for chunk in frame.chunks(5) {
                tx.write_all(chunk).await.unwrap();
            }
        });

        let decoded = read_frame(&mut rx).await.unwrap();
        writer.await.unwrap();
        assert_eq!(decoded, Some(envelope));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_before_body() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        // No body follows: a body read would report end-of-stream instead.
        let result = read_frame(&mut header.as_slice()).await;
        assert!(matches!(
            result,
            Err(FrameError::TooLarge { length, max }) if length == MAX_FRAME_SIZE + 1 && max == MAX_FRAME_SIZE
        ));
    }

    #[tokio::test]
    async fn test_empty_stream_is_end_of_stream() {
        assert!(read_frame(&mut &b""[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_is_end_of_stream() {
        assert!(read_frame(&mut &[0u8, 0][..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_end_of_stream() {
        let frame = encode(&Envelope::chat_at("10:00:00", "alice", "cut short")).unwrap();
        let truncated = &frame[..frame.len() - 2];
        assert!(read_frame(&mut &truncated[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_body_is_corrupt() {
        let mut bytes = 4u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"nope");
        let result = read_frame(&mut bytes.as_slice()).await;
        assert!(matches!(result, Err(FrameError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_invalid_json_is_corrupt() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"message\": 42}").unwrap();
        let body = encoder.finish().unwrap();

        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend(body);
        let result = read_frame(&mut bytes.as_slice()).await;
        assert!(matches!(result, Err(FrameError::Corrupt(_))));
    }

    #[test]
    fn test_encode_refuses_oversized_body() {
        // Pseudo-random text barely compresses, so 2M characters stay above the limit.
        let mut state: u32 = 0x2545_f491;
        let text: String = (0..2 * MAX_FRAME_SIZE)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                char::from(b'!' + ((state >> 16) % 90) as u8)
            })
            .collect();

        let result = encode(&Envelope::chat_at("10:00:00", "alice", &text));
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_write_frame_round_trip() {
        let envelope = Envelope::system("hello");
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();
        assert_eq!(read_frame(&mut buf.as_slice()).await.unwrap(), Some(envelope));
    }
}
