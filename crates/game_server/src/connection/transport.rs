//! Framing stages installed after detection.
//!
//! Both transports carry the same binary frames. Over raw TCP they are read
//! from a byte stream through the incremental decoder; over WebSocket every
//! binary WebSocket message holds exactly one frame.

use crate::error::ServerError;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use horizon_protocol::frame::{self, FrameDecoder};
use horizon_protocol::{FrameError, Message};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};

type WsStream = WebSocketStream<TcpStream>;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Inbound half of a connection.
pub(crate) enum FrameReader {
    Binary {
        addr: SocketAddr,
        read: OwnedReadHalf,
        buffer: BytesMut,
        decoder: FrameDecoder,
    },
    WebSocket {
        addr: SocketAddr,
        stream: SplitStream<WsStream>,
        decoder: FrameDecoder,
    },
}

/// Outbound half of a connection.
pub(crate) enum FrameWriter {
    Binary(OwnedWriteHalf),
    WebSocket(SplitSink<WsStream, WsMessage>),
}

/// Splits a raw TCP stream for binary framing.
pub(crate) fn binary(stream: TcpStream, addr: SocketAddr, decoder: FrameDecoder) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    let reader = FrameReader::Binary {
        addr,
        read,
        buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        decoder,
    };
    (reader, FrameWriter::Binary(write))
}

/// Completes the WebSocket upgrade and splits the resulting stream.
pub(crate) async fn websocket(
    stream: TcpStream,
    addr: SocketAddr,
    decoder: FrameDecoder,
) -> Result<(FrameReader, FrameWriter), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::WebSocket(format!("handshake with {addr} failed: {e}")))?;
    let (sink, stream) = ws_stream.split();
    Ok((
        FrameReader::WebSocket { addr, stream, decoder },
        FrameWriter::WebSocket(sink),
    ))
}

impl FrameReader {
    /// Reads the next message. `Ok(None)` means the peer closed cleanly.
    pub(crate) async fn next(&mut self) -> Result<Option<Message>, ServerError> {
        match self {
            FrameReader::Binary {
                addr,
                read,
                buffer,
                decoder,
            } => loop {
                if let Some(message) = decoder
                    .decode(buffer)
                    .map_err(|source| violation(*addr, source))?
                {
                    return Ok(Some(message));
                }
                if read.read_buf(buffer).await? == 0 {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(violation(
                        *addr,
                        FrameError::Truncated {
                            needed: frame::PREFIX_LEN,
                            have: buffer.len(),
                        },
                    ));
                }
            },
            FrameReader::WebSocket {
                addr,
                stream,
                decoder,
            } => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(ServerError::WebSocket(e.to_string())),
                    Some(Ok(WsMessage::Binary(data))) => {
                        return decoder
                            .decode_frame(&data)
                            .map(Some)
                            .map_err(|source| violation(*addr, source));
                    }
                    Some(Ok(WsMessage::Close(_))) => return Ok(None),
                    Some(Ok(WsMessage::Text(_))) => {
                        return Err(violation(
                            *addr,
                            FrameError::InvalidHeader("text WebSocket messages are not accepted".to_string()),
                        ));
                    }
                    // Ping and pong are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                }
            },
        }
    }
}

impl FrameWriter {
    pub(crate) async fn send(&mut self, message: &Message) -> Result<(), ServerError> {
        let bytes = frame::encode_to_bytes(message).map_err(|e| ServerError::Internal(e.to_string()))?;
        match self {
            FrameWriter::Binary(write) => write.write_all(&bytes).await?,
            FrameWriter::WebSocket(sink) => sink
                .send(WsMessage::binary(bytes))
                .await
                .map_err(|e| ServerError::WebSocket(e.to_string()))?,
        }
        Ok(())
    }

    pub(crate) async fn close(&mut self) {
        match self {
            FrameWriter::Binary(write) => {
                let _ = write.shutdown().await;
            }
            FrameWriter::WebSocket(sink) => {
                let _ = sink.close().await;
            }
        }
    }
}

fn violation(addr: SocketAddr, source: FrameError) -> ServerError {
    ServerError::ProtocolViolation { addr, source }
}
