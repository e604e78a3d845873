//! Wire protocol: length-prefixed tagged frames.
//!
//! Frame layout: `[u32 BE length][u8 type][payload]` where `length` counts
//! the type byte plus the payload. Control payloads are compact JSON with a
//! fixed per-variant schema; `FILE_DATA` is binary
//! (`[u32 chunk_index][u32 chunk_len][bytes]`) to avoid base64 overhead.
//!
//! The message set is a closed tagged union. An unknown type byte is a
//! protocol error, never skipped.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length-prefix size on the wire.
pub const HEADER_LEN: usize = 4;

/// Frame type bytes. Gaps are reserved, never reused.
mod tag {
    pub const HELLO: u8 = 1;
    pub const HELLO_ACK: u8 = 2;
    pub const PAIR_REQ: u8 = 3;
    pub const PAIR_OK: u8 = 4;
    pub const PAIR_FAIL: u8 = 5;
    pub const FILE_INFO: u8 = 6;
    pub const FILE_INFO_ACK: u8 = 7;
    pub const FILE_RESUME: u8 = 8;
    pub const FILE_RESUME_OK: u8 = 9;
    pub const FILE_DATA: u8 = 10;
    pub const FILE_ACK: u8 = 11;
    pub const FILE_ACK_BATCH: u8 = 12;
    pub const FILE_COMPLETE: u8 = 13;
    pub const FILE_COMPLETE_ACK: u8 = 14;
    pub const HEARTBEAT: u8 = 15;
    pub const BYE: u8 = 16;
    pub const ERROR: u8 = 17;
}

// ── Decode failures ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The peer closed the connection at a frame boundary.
    #[error("connection closed")]
    Closed,
    /// EOF in the middle of a frame.
    #[error("truncated frame")]
    Truncated,
    /// Length/type/payload inconsistency, unknown tag, or invalid JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ── Payload schemas ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: String,
    pub hostname: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloAck {
    pub device_id: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReq {
    pub device_id: String,
    pub hostname: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOk {
    pub device_id: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairFail {
    pub reason: String,
}

/// The immutable transfer descriptor as announced by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_hash: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfoAck {
    pub file_hash: String,
}

/// Completed-chunk set as sorted half-open runs, so a dense set costs a
/// handful of pairs instead of one integer per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResume {
    pub file_hash: String,
    pub runs: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResumeOk {
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAck {
    pub file_hash: String,
    pub chunk_index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAckBatch {
    pub file_hash: String,
    pub runs: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileComplete {
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCompleteAck {
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub kind: String,
    pub detail: String,
}

// ── The closed message union ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(Hello),
    HelloAck(HelloAck),
    PairReq(PairReq),
    PairOk(PairOk),
    PairFail(PairFail),
    FileInfo(FileInfo),
    FileInfoAck(FileInfoAck),
    FileResume(FileResume),
    FileResumeOk(FileResumeOk),
    FileData { index: u32, data: Vec<u8> },
    FileAck(FileAck),
    FileAckBatch(FileAckBatch),
    FileComplete(FileComplete),
    FileCompleteAck(FileCompleteAck),
    Heartbeat,
    Bye,
    Error(ErrorMsg),
}

impl Message {
    /// Short name for structured logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::HelloAck(_) => "hello_ack",
            Message::PairReq(_) => "pair_req",
            Message::PairOk(_) => "pair_ok",
            Message::PairFail(_) => "pair_fail",
            Message::FileInfo(_) => "file_info",
            Message::FileInfoAck(_) => "file_info_ack",
            Message::FileResume(_) => "file_resume",
            Message::FileResumeOk(_) => "file_resume_ok",
            Message::FileData { .. } => "file_data",
            Message::FileAck(_) => "file_ack",
            Message::FileAckBatch(_) => "file_ack_batch",
            Message::FileComplete(_) => "file_complete",
            Message::FileCompleteAck(_) => "file_complete_ack",
            Message::Heartbeat => "heartbeat",
            Message::Bye => "bye",
            Message::Error(_) => "error",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Message::Hello(_) => tag::HELLO,
            Message::HelloAck(_) => tag::HELLO_ACK,
            Message::PairReq(_) => tag::PAIR_REQ,
            Message::PairOk(_) => tag::PAIR_OK,
            Message::PairFail(_) => tag::PAIR_FAIL,
            Message::FileInfo(_) => tag::FILE_INFO,
            Message::FileInfoAck(_) => tag::FILE_INFO_ACK,
            Message::FileResume(_) => tag::FILE_RESUME,
            Message::FileResumeOk(_) => tag::FILE_RESUME_OK,
            Message::FileData { .. } => tag::FILE_DATA,
            Message::FileAck(_) => tag::FILE_ACK,
            Message::FileAckBatch(_) => tag::FILE_ACK_BATCH,
            Message::FileComplete(_) => tag::FILE_COMPLETE,
            Message::FileCompleteAck(_) => tag::FILE_COMPLETE_ACK,
            Message::Heartbeat => tag::HEARTBEAT,
            Message::Bye => tag::BYE,
            Message::Error(_) => tag::ERROR,
        }
    }

    fn payload(&self) -> Vec<u8> {
        fn json<T: Serialize>(v: &T) -> Vec<u8> {
            // Every payload struct serializes infallibly.
            serde_json::to_vec(v).unwrap_or_default()
        }
        match self {
            Message::Hello(p) => json(p),
            Message::HelloAck(p) => json(p),
            Message::PairReq(p) => json(p),
            Message::PairOk(p) => json(p),
            Message::PairFail(p) => json(p),
            Message::FileInfo(p) => json(p),
            Message::FileInfoAck(p) => json(p),
            Message::FileResume(p) => json(p),
            Message::FileResumeOk(p) => json(p),
            Message::FileData { index, data } => {
                let mut out = Vec::with_capacity(8 + data.len());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Message::FileAck(p) => json(p),
            Message::FileAckBatch(p) => json(p),
            Message::FileComplete(p) => json(p),
            Message::FileCompleteAck(p) => json(p),
            Message::Heartbeat | Message::Bye => Vec::new(),
            Message::Error(p) => json(p),
        }
    }

    /// Encode a full frame ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload();
        let len = (1 + payload.len()) as u32;
        let mut out = Vec::with_capacity(HEADER_LEN + 1 + payload.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.push(self.tag());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode a frame body (type byte already split off).
    pub fn decode_body(frame_tag: u8, body: &[u8]) -> Result<Message, DecodeError> {
        fn json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, DecodeError> {
            serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))
        }
        let msg = match frame_tag {
            tag::HELLO => Message::Hello(json(body)?),
            tag::HELLO_ACK => Message::HelloAck(json(body)?),
            tag::PAIR_REQ => Message::PairReq(json(body)?),
            tag::PAIR_OK => Message::PairOk(json(body)?),
            tag::PAIR_FAIL => Message::PairFail(json(body)?),
            tag::FILE_INFO => Message::FileInfo(json(body)?),
            tag::FILE_INFO_ACK => Message::FileInfoAck(json(body)?),
            tag::FILE_RESUME => Message::FileResume(json(body)?),
            tag::FILE_RESUME_OK => Message::FileResumeOk(json(body)?),
            tag::FILE_DATA => {
                if body.len() < 8 {
                    return Err(DecodeError::Malformed("file_data shorter than its prefix".into()));
                }
                let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let chunk_len = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
                if body.len() - 8 != chunk_len {
                    return Err(DecodeError::Malformed(format!(
                        "file_data length prefix {} does not match payload {}",
                        chunk_len,
                        body.len() - 8
                    )));
                }
                Message::FileData {
                    index,
                    data: body[8..].to_vec(),
                }
            }
            tag::FILE_ACK => Message::FileAck(json(body)?),
            tag::FILE_ACK_BATCH => Message::FileAckBatch(json(body)?),
            tag::FILE_COMPLETE => Message::FileComplete(json(body)?),
            tag::FILE_COMPLETE_ACK => Message::FileCompleteAck(json(body)?),
            tag::HEARTBEAT => Message::Heartbeat,
            tag::BYE => Message::Bye,
            tag::ERROR => Message::Error(json(body)?),
            other => {
                return Err(DecodeError::Malformed(format!("unknown frame type {other:#04x}")))
            }
        };
        Ok(msg)
    }
}

// ── Stream I/O ───────────────────────────────────────────────────────────────

/// Read one frame from the stream.
///
/// `max_frame` bounds the declared length (`chunk_size + 64` for the owning
/// session); anything larger is rejected before allocation.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Message, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DecodeError::Closed,
            _ => DecodeError::Io(e),
        });
    }
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(DecodeError::Malformed("zero-length frame".into()));
    }
    if len > max_frame {
        return Err(DecodeError::Malformed(format!(
            "frame of {len} bytes exceeds limit {max_frame}"
        )));
    }

    let mut frame = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut frame).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => DecodeError::Truncated,
            _ => DecodeError::Io(e),
        });
    }
    Message::decode_body(frame[0], &frame[1..])
}

/// Write one frame to the stream.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&msg.encode()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAX_FRAME: usize = 64 * 1024 + 64;

    async fn roundtrip(msg: Message) {
        let bytes = msg.encode();
        let mut cursor = &bytes[..];
        let decoded = read_frame(&mut cursor, TEST_MAX_FRAME).await.unwrap();
        assert_eq!(decoded, msg);
        assert!(cursor.is_empty(), "frame should consume all bytes");
    }

    #[tokio::test]
    async fn roundtrip_every_variant() {
        roundtrip(Message::Hello(Hello {
            device_id: "host-alice-1111".into(),
            hostname: "host".into(),
            protocol_version: 1,
        }))
        .await;
        roundtrip(Message::HelloAck(HelloAck {
            device_id: "host-alice-1111".into(),
            hostname: "host".into(),
        }))
        .await;
        roundtrip(Message::PairReq(PairReq {
            device_id: "a".into(),
            hostname: "h".into(),
            code: "482913".into(),
        }))
        .await;
        roundtrip(Message::PairOk(PairOk {
            device_id: "a".into(),
            hostname: "h".into(),
        }))
        .await;
        roundtrip(Message::PairFail(PairFail {
            reason: "wrong code".into(),
        }))
        .await;
        roundtrip(Message::FileInfo(FileInfo {
            file_hash: "abcd".into(),
            file_name: "hello.txt".into(),
            file_size: 200,
            chunk_size: 1024,
            total_chunks: 1,
        }))
        .await;
        roundtrip(Message::FileInfoAck(FileInfoAck {
            file_hash: "abcd".into(),
        }))
        .await;
        roundtrip(Message::FileResume(FileResume {
            file_hash: "abcd".into(),
            runs: vec![(0, 4), (7, 9)],
        }))
        .await;
        roundtrip(Message::FileResumeOk(FileResumeOk {
            file_hash: "abcd".into(),
        }))
        .await;
        roundtrip(Message::FileData {
            index: 5,
            data: vec![0xAB; 1024],
        })
        .await;
        roundtrip(Message::FileAck(FileAck {
            file_hash: "abcd".into(),
            chunk_index: 5,
        }))
        .await;
        roundtrip(Message::FileAckBatch(FileAckBatch {
            file_hash: "abcd".into(),
            runs: vec![(0, 10)],
        }))
        .await;
        roundtrip(Message::FileComplete(FileComplete {
            file_hash: "abcd".into(),
        }))
        .await;
        roundtrip(Message::FileCompleteAck(FileCompleteAck {
            file_hash: "abcd".into(),
        }))
        .await;
        roundtrip(Message::Heartbeat).await;
        roundtrip(Message::Bye).await;
        roundtrip(Message::Error(ErrorMsg {
            kind: "integrity".into(),
            detail: "hash mismatch".into(),
        }))
        .await;
    }

    #[tokio::test]
    async fn empty_file_data_roundtrips() {
        roundtrip(Message::FileData {
            index: 0,
            data: Vec::new(),
        })
        .await;
    }

    #[tokio::test]
    async fn unknown_tag_is_malformed() {
        let mut frame: Vec<u8> = vec![0, 0, 0, 1, 0xFF];
        let err = read_frame(&mut &frame[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        // A type byte inside the reserved gap fails the same way.
        frame[4] = 99;
        let err = read_frame(&mut &frame[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_detected() {
        let bytes = Message::Heartbeat.encode();
        // Claim a longer frame than the bytes that follow.
        let mut lying = bytes.clone();
        lying[3] = 10;
        let err = read_frame(&mut &lying[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Truncated));
    }

    #[tokio::test]
    async fn eof_at_boundary_is_closed() {
        let err = read_frame(&mut &b""[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Closed));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let huge = (TEST_MAX_FRAME as u32 + 1).to_be_bytes();
        let mut frame = huge.to_vec();
        frame.push(tag::HEARTBEAT);
        let err = read_frame(&mut &frame[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[tokio::test]
    async fn file_data_length_prefix_must_match() {
        let msg = Message::FileData {
            index: 3,
            data: vec![1, 2, 3, 4],
        };
        let mut bytes = msg.encode();
        // Corrupt the inner chunk_len prefix.
        bytes[HEADER_LEN + 1 + 4..HEADER_LEN + 1 + 8].copy_from_slice(&9u32.to_be_bytes());
        let err = read_frame(&mut &bytes[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[tokio::test]
    async fn bad_json_is_malformed() {
        let mut frame: Vec<u8> = vec![0, 0, 0, 3, tag::HELLO];
        frame.extend_from_slice(b"{]");
        let err = read_frame(&mut &frame[..], TEST_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[tokio::test]
    async fn back_to_back_frames_parse_independently() {
        let mut bytes = Message::Heartbeat.encode();
        bytes.extend(
            Message::FileAck(FileAck {
                file_hash: "h".into(),
                chunk_index: 1,
            })
            .encode(),
        );
        let mut cursor = &bytes[..];
        assert_eq!(
            read_frame(&mut cursor, TEST_MAX_FRAME).await.unwrap(),
            Message::Heartbeat
        );
        assert!(matches!(
            read_frame(&mut cursor, TEST_MAX_FRAME).await.unwrap(),
            Message::FileAck(_)
        ));
    }
}
