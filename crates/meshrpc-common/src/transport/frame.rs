use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::error::{Result, ServiceError};
use crate::protocol::CommunicationMode;

const KIND_REQUEST_FNF: u8 = 1;
const KIND_REQUEST_RESPONSE: u8 = 2;
const KIND_REQUEST_STREAM: u8 = 3;
const KIND_REQUEST_CHANNEL: u8 = 4;
const KIND_NEXT: u8 = 5;
const KIND_COMPLETE: u8 = 6;
const KIND_ERROR: u8 = 7;
const KIND_CANCEL: u8 = 8;
const KIND_REQUEST_N: u8 = 9;

/// Bytes after the length prefix that every frame carries: kind + stream id.
const FIXED_HEADER_LEN: usize = 1 + 8;

/// One unit on the wire.
///
/// Wire format: `[4-byte length as u32 big-endian] [kind] [stream id] [body]`.
/// Message bodies are `[u32 header length] [header bytes] [data bytes]`, the
/// two buffers produced by the message codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opens a call in the given mode with its first message
    Request {
        mode: CommunicationMode,
        stream_id: u64,
        headers: Bytes,
        data: Bytes,
    },
    /// One message of a stream, or the single response of request-response
    Next {
        stream_id: u64,
        headers: Bytes,
        data: Bytes,
    },
    /// Successful end of a stream
    Complete { stream_id: u64 },
    /// Terminal failure carrying an error kind code
    Error {
        stream_id: u64,
        code: u16,
        message: String,
    },
    /// The receiver is no longer interested
    Cancel { stream_id: u64 },
    /// Grants the sender `n` more `Next` frames
    RequestN { stream_id: u64, n: u32 },
}

impl Frame {
    pub fn stream_id(&self) -> u64 {
        match self {
            Frame::Request { stream_id, .. }
            | Frame::Next { stream_id, .. }
            | Frame::Complete { stream_id }
            | Frame::Error { stream_id, .. }
            | Frame::Cancel { stream_id }
            | Frame::RequestN { stream_id, .. } => *stream_id,
        }
    }

    pub fn error(stream_id: u64, error: &ServiceError) -> Self {
        Frame::Error {
            stream_id,
            code: error.code(),
            message: error.message().to_string(),
        }
    }

    /// Encodes the frame including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + FIXED_HEADER_LEN + self.body_len());
        buf.put_u32((FIXED_HEADER_LEN + self.body_len()) as u32);

        match self {
            Frame::Request {
                mode,
                stream_id,
                headers,
                data,
            } => {
                buf.put_u8(mode_kind(*mode));
                buf.put_u64(*stream_id);
                put_message(&mut buf, headers, data);
            }
            Frame::Next {
                stream_id,
                headers,
                data,
            } => {
                buf.put_u8(KIND_NEXT);
                buf.put_u64(*stream_id);
                put_message(&mut buf, headers, data);
            }
            Frame::Complete { stream_id } => {
                buf.put_u8(KIND_COMPLETE);
                buf.put_u64(*stream_id);
            }
            Frame::Error {
                stream_id,
                code,
                message,
            } => {
                buf.put_u8(KIND_ERROR);
                buf.put_u64(*stream_id);
                buf.put_u16(*code);
                buf.put_slice(message.as_bytes());
            }
            Frame::Cancel { stream_id } => {
                buf.put_u8(KIND_CANCEL);
                buf.put_u64(*stream_id);
            }
            Frame::RequestN { stream_id, n } => {
                buf.put_u8(KIND_REQUEST_N);
                buf.put_u64(*stream_id);
                buf.put_u32(*n);
            }
        }

        buf.freeze()
    }

    fn body_len(&self) -> usize {
        match self {
            Frame::Request { headers, data, .. } | Frame::Next { headers, data, .. } => {
                4 + headers.len() + data.len()
            }
            Frame::Error { message, .. } => 2 + message.len(),
            Frame::RequestN { .. } => 4,
            Frame::Complete { .. } | Frame::Cancel { .. } => 0,
        }
    }

    /// Decodes one frame from its bytes (length prefix already stripped).
    pub fn decode(mut buf: Bytes) -> Result<Frame> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(ServiceError::bad_request(format!(
                "Frame too short: {} bytes",
                buf.len()
            )));
        }

        let kind = buf.get_u8();
        let stream_id = buf.get_u64();

        let frame = match kind {
            KIND_REQUEST_FNF | KIND_REQUEST_RESPONSE | KIND_REQUEST_STREAM | KIND_REQUEST_CHANNEL => {
                let (headers, data) = take_message(buf)?;
                Frame::Request {
                    mode: kind_mode(kind),
                    stream_id,
                    headers,
                    data,
                }
            }
            KIND_NEXT => {
                let (headers, data) = take_message(buf)?;
                Frame::Next {
                    stream_id,
                    headers,
                    data,
                }
            }
            KIND_COMPLETE => Frame::Complete { stream_id },
            KIND_ERROR => {
                if buf.len() < 2 {
                    return Err(ServiceError::bad_request("Error frame missing code"));
                }
                let code = buf.get_u16();
                let message = String::from_utf8(buf.to_vec()).map_err(|e| {
                    ServiceError::bad_request(format!("Error frame message is not UTF-8: {}", e))
                })?;
                Frame::Error {
                    stream_id,
                    code,
                    message,
                }
            }
            KIND_CANCEL => Frame::Cancel { stream_id },
            KIND_REQUEST_N => {
                if buf.len() < 4 {
                    return Err(ServiceError::bad_request("RequestN frame missing count"));
                }
                Frame::RequestN {
                    stream_id,
                    n: buf.get_u32(),
                }
            }
            other => {
                return Err(ServiceError::bad_request(format!(
                    "Unknown frame kind {}",
                    other
                )))
            }
        };

        Ok(frame)
    }
}

fn mode_kind(mode: CommunicationMode) -> u8 {
    match mode {
        CommunicationMode::FireAndForget => KIND_REQUEST_FNF,
        CommunicationMode::RequestResponse => KIND_REQUEST_RESPONSE,
        CommunicationMode::RequestStream => KIND_REQUEST_STREAM,
        CommunicationMode::RequestChannel => KIND_REQUEST_CHANNEL,
    }
}

fn kind_mode(kind: u8) -> CommunicationMode {
    match kind {
        KIND_REQUEST_FNF => CommunicationMode::FireAndForget,
        KIND_REQUEST_RESPONSE => CommunicationMode::RequestResponse,
        KIND_REQUEST_STREAM => CommunicationMode::RequestStream,
        _ => CommunicationMode::RequestChannel,
    }
}

fn put_message(buf: &mut BytesMut, headers: &Bytes, data: &Bytes) {
    buf.put_u32(headers.len() as u32);
    buf.put_slice(headers);
    buf.put_slice(data);
}

fn take_message(mut buf: Bytes) -> Result<(Bytes, Bytes)> {
    if buf.len() < 4 {
        return Err(ServiceError::bad_request("Message frame missing header length"));
    }
    let header_len = buf.get_u32() as usize;
    if header_len > buf.len() {
        return Err(ServiceError::bad_request(format!(
            "Header length {} exceeds frame body of {} bytes",
            header_len,
            buf.len()
        )));
    }
    let headers = buf.split_to(header_len);
    Ok((headers, buf))
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between
/// frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(ServiceError::connection(format!(
                "reading length prefix: {}",
                e
            )))
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    // Validate length to prevent allocation of excessively large buffers
    if len > max_frame_size {
        return Err(ServiceError::bad_request(format!(
            "Frame too large: {} bytes (max {} bytes)",
            len, max_frame_size
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| ServiceError::connection(format!("reading frame body: {}", e)))?;

    Frame::decode(Bytes::from(buf)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(frame: Frame) -> Frame {
        let encoded = frame.encode();
        let mut reader = &encoded[..];
        read_frame(&mut reader, 1024).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_request_frame() {
        let frame = Frame::Request {
            mode: CommunicationMode::RequestStream,
            stream_id: 7,
            headers: Bytes::from_static(b"{\"q\":\"a/b\"}"),
            data: Bytes::from_static(b"[1,2]"),
        };
        assert_eq!(round_trip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn test_control_frames() {
        for frame in [
            Frame::Complete { stream_id: 1 },
            Frame::Cancel { stream_id: 3 },
            Frame::RequestN { stream_id: 5, n: 16 },
            Frame::Error {
                stream_id: 9,
                code: 401,
                message: "denied".to_string(),
            },
        ] {
            assert_eq!(round_trip(frame.clone()).await, frame);
        }
    }

    #[tokio::test]
    async fn test_empty_message_body() {
        let frame = Frame::Next {
            stream_id: 11,
            headers: Bytes::new(),
            data: Bytes::new(),
        };
        assert_eq!(round_trip(frame.clone()).await, frame);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let frame = Frame::Next {
            stream_id: 1,
            headers: Bytes::new(),
            data: Bytes::from(vec![0u8; 64]),
        };
        let encoded = frame.encode();
        let mut reader = &encoded[..];
        assert!(read_frame(&mut reader, 16).await.is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(42);
        buf.put_u64(1);
        assert!(Frame::decode(buf.freeze()).is_err());
    }

    #[test]
    fn test_header_length_overflow_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_NEXT);
        buf.put_u64(1);
        buf.put_u32(100);
        buf.put_slice(b"short");
        assert!(Frame::decode(buf.freeze()).is_err());
    }
}
