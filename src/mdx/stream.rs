//! One-shot metadata exchange over an established stream.
//!
//! The exchange piggybacks on the first I/O in each direction. On the very
//! first write, the wrapper sends the client's request frame ahead of the
//! caller's bytes. On the very first read, it peeks eight bytes: if they
//! are the frame signature it consumes the whole response frame (failing
//! the connection on an error verdict), otherwise it replays the peeked
//! bytes to the caller byte-for-byte and goes transparent. Each trigger
//! fires at most once, and neither fires at all if the corresponding
//! direction is never used.

use crate::mdx::codec::{self, ResponseCode, MAX_BODY_LEN, SIGNATURE};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug)]
enum WriteState {
    /// Request frame not yet (fully) sent; goes out before any caller bytes.
    Pending { frame: Vec<u8>, written: usize },
    Done,
}

#[derive(Debug)]
enum ReadState {
    /// Collecting the first eight bytes to test for the signature.
    Peek { buf: [u8; 8], filled: usize },
    /// Signature seen; collecting the body length prefix.
    Length { buf: [u8; 4], filled: usize },
    /// Collecting the response body.
    Body { buf: Vec<u8>, filled: usize },
    /// No signature; hand the peeked bytes back before going transparent.
    Replay { buf: Vec<u8>, pos: usize },
    Transparent,
}

/// Stream wrapper that performs the metadata exchange around the caller's
/// first read and write.
#[derive(Debug)]
pub struct MdxStream<S> {
    inner: S,
    write_state: WriteState,
    read_state: ReadState,
}

impl<S> MdxStream<S> {
    /// Wrap a stream with an encoded request frame to send ahead of the
    /// first caller write; the first reads look for the response frame.
    pub fn new(inner: S, request_frame: Vec<u8>) -> Self {
        Self {
            inner,
            write_state: WriteState::Pending {
                frame: request_frame,
                written: 0,
            },
            read_state: ReadState::Peek {
                buf: [0u8; 8],
                filled: 0,
            },
        }
    }

    /// Wrap a stream with no exchange pending; all I/O passes through.
    pub fn transparent(inner: S) -> Self {
        Self {
            inner,
            write_state: WriteState::Done,
            read_state: ReadState::Transparent,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MdxStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::Peek { buf, filled } => {
                    let mut tmp = [0u8; 8];
                    let mut rb = ReadBuf::new(&mut tmp[..8 - *filled]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        // EOF before eight bytes; nothing to negotiate,
                        // surface what did arrive.
                        let partial = buf[..*filled].to_vec();
                        this.read_state = ReadState::Replay {
                            buf: partial,
                            pos: 0,
                        };
                        continue;
                    }
                    buf[*filled..*filled + n].copy_from_slice(rb.filled());
                    *filled += n;
                    if *filled == 8 {
                        if buf == SIGNATURE {
                            this.read_state = ReadState::Length {
                                buf: [0u8; 4],
                                filled: 0,
                            };
                        } else {
                            this.read_state = ReadState::Replay {
                                buf: buf.to_vec(),
                                pos: 0,
                            };
                        }
                    }
                }
                ReadState::Length { buf, filled } => {
                    let mut tmp = [0u8; 4];
                    let mut rb = ReadBuf::new(&mut tmp[..4 - *filled]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed inside metadata exchange frame",
                        )));
                    }
                    buf[*filled..*filled + n].copy_from_slice(rb.filled());
                    *filled += n;
                    if *filled == 4 {
                        let len = u32::from_be_bytes(*buf) as usize;
                        if len > MAX_BODY_LEN {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("metadata exchange body of {} bytes too large", len),
                            )));
                        }
                        this.read_state = ReadState::Body {
                            buf: vec![0u8; len],
                            filled: 0,
                        };
                    }
                }
                ReadState::Body { buf, filled } => {
                    if *filled < buf.len() {
                        let mut rb = ReadBuf::new(&mut buf[*filled..]);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                        let n = rb.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "stream closed inside metadata exchange frame",
                            )));
                        }
                        *filled += n;
                        continue;
                    }
                    let response = codec::decode_response(buf).map_err(|e| {
                        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                    })?;
                    if response.response_code() != ResponseCode::Ok {
                        return Poll::Ready(Err(io::Error::other(format!(
                            "metadata exchange failed: {}",
                            if response.error.is_empty() {
                                "server rejected the exchange"
                            } else {
                                &response.error
                            }
                        ))));
                    }
                    tracing::debug!("metadata exchange accepted by server");
                    this.read_state = ReadState::Transparent;
                }
                ReadState::Replay { buf, pos } => {
                    if *pos < buf.len() {
                        let n = (buf.len() - *pos).min(out.remaining());
                        out.put_slice(&buf[*pos..*pos + n]);
                        *pos += n;
                        if *pos == buf.len() {
                            this.read_state = ReadState::Transparent;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    this.read_state = ReadState::Transparent;
                }
                ReadState::Transparent => {
                    return Pin::new(&mut this.inner).poll_read(cx, out);
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MdxStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.write_state {
                WriteState::Pending { frame, written } => {
                    if *written == frame.len() {
                        this.write_state = WriteState::Done;
                        continue;
                    }
                    let n =
                        ready!(Pin::new(&mut this.inner).poll_write(cx, &frame[*written..]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    *written += n;
                }
                WriteState::Done => {
                    return Pin::new(&mut this.inner).poll_write(cx, buf);
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdx::codec::{
        encode_frame, ClientProtocolType, MetadataExchangeRequest, MetadataExchangeResponse,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request_frame() -> Vec<u8> {
        encode_frame(&MetadataExchangeRequest {
            user_agent: "broker-test/0.0".to_string(),
            client_protocol_type: ClientProtocolType::Tcp as i32,
        })
        .unwrap()
        .to_vec()
    }

    fn response_frame(code: ResponseCode, error: &str) -> Vec<u8> {
        encode_frame(&MetadataExchangeResponse {
            response_code: code as i32,
            error: error.to_string(),
        })
        .unwrap()
        .to_vec()
    }

    #[tokio::test]
    async fn test_ok_response_is_stripped() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::new(client, request_frame());

        let mut bytes = response_frame(ResponseCode::Ok, "");
        bytes.extend_from_slice(b"SELECT 1");
        server.write_all(&bytes).await.unwrap();
        drop(server);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"SELECT 1");
    }

    #[tokio::test]
    async fn test_error_response_fails_the_read() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::new(client, request_frame());

        server
            .write_all(&response_frame(ResponseCode::Error, "tls required"))
            .await
            .unwrap();

        let mut out = [0u8; 16];
        let err = stream.read(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("tls required"));
    }

    #[tokio::test]
    async fn test_non_signature_bytes_replayed_exactly() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::new(client, request_frame());

        // Longer than the peek window; not a frame.
        server.write_all(b"R\x00\x00\x00\x08ready..").await.unwrap();
        drop(server);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"R\x00\x00\x00\x08ready..");
    }

    #[tokio::test]
    async fn test_short_stream_replayed_then_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::new(client, request_frame());

        server.write_all(b"hi").await.unwrap();
        drop(server);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hi");
    }

    #[tokio::test]
    async fn test_truncated_frame_is_unexpected_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::new(client, request_frame());

        server.write_all(b"CSQLMDEX\x00\x00").await.unwrap();
        drop(server);

        let mut out = [0u8; 16];
        let err = stream.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::new(client, request_frame());

        let mut bytes = SIGNATURE.to_vec();
        bytes.extend_from_slice(&(MAX_BODY_LEN as u32 + 1).to_be_bytes());
        server.write_all(&bytes).await.unwrap();

        let mut out = [0u8; 16];
        let err = stream.read(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_frame_fragmented_across_reads() {
        let frame = response_frame(ResponseCode::Ok, "");
        let mock = tokio_test::io::Builder::new()
            .read(&frame[..3])
            .read(&frame[3..10])
            .read(&frame[10..])
            .read(b"data")
            .build();
        let mut stream = MdxStream::new(mock, request_frame());

        let mut out = [0u8; 4];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"data");
    }

    #[tokio::test]
    async fn test_transparent_passes_everything_through() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = MdxStream::transparent(client);

        server.write_all(b"CSQLMDEX-lookalike").await.unwrap();
        drop(server);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"CSQLMDEX-lookalike");
    }

    #[tokio::test]
    async fn test_first_write_sends_request_frame_first() {
        let (client, mut server) = tokio::io::duplex(1024);
        let frame = request_frame();
        let mut stream = MdxStream::new(client, frame.clone());

        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let mut out = vec![0u8; frame.len() + 5];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out[..frame.len()], &frame[..]);
        assert_eq!(&out[frame.len()..], b"hello");
    }

    #[tokio::test]
    async fn test_request_frame_sent_once() {
        let (client, mut server) = tokio::io::duplex(1024);
        let frame = request_frame();
        let mut stream = MdxStream::new(client, frame.clone());

        stream.write_all(b"one").await.unwrap();
        stream.write_all(b"two").await.unwrap();
        stream.flush().await.unwrap();

        let mut out = vec![0u8; frame.len() + 6];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out[frame.len()..], b"onetwo");
    }

    #[tokio::test]
    async fn test_unused_stream_sends_nothing() {
        let (client, mut server) = tokio::io::duplex(1024);
        let stream = MdxStream::new(client, request_frame());

        // Dropping without I/O must not have emitted the request frame.
        drop(stream);
        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
