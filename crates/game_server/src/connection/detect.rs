//! Protocol detection for freshly accepted connections.
//!
//! The first two bytes of a connection decide how the rest of it is read.
//! A Horizon family tag selects binary framing; the start of an HTTP `GET`
//! selects the WebSocket upgrade path; anything else is closed. Detection
//! peeks, so the bytes stay in the socket for whichever reader takes over.

use horizon_protocol::ProtocolFamily;
use std::time::Duration;
use tokio::net::TcpStream;

/// First two bytes of `GET `, the start of a WebSocket upgrade request.
pub const WEBSOCKET_SIGNATURE: [u8; 2] = *b"GE";

/// Poll period while fewer than two bytes have arrived.
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Outcome of inspecting the connection preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Fewer than two bytes so far.
    NeedMore,
    /// Horizon binary framing of the given family.
    Binary(ProtocolFamily),
    /// HTTP upgrade to WebSocket; frames arrive as binary WebSocket messages.
    WebSocket,
    /// Unknown preamble, carrying the two bytes seen.
    Reject([u8; 2]),
}

/// Classifies a connection from its first bytes.
pub fn detect(preamble: &[u8]) -> Detection {
    if preamble.len() < 2 {
        return Detection::NeedMore;
    }
    let head = [preamble[0], preamble[1]];
    if let Some(family) = ProtocolFamily::from_tag(u16::from_be_bytes(head)) {
        return Detection::Binary(family);
    }
    if head == WEBSOCKET_SIGNATURE {
        return Detection::WebSocket;
    }
    Detection::Reject(head)
}

/// Peeks at `stream` until the preamble can be classified.
///
/// Returns `Ok(None)` if the peer closed the connection before sending two
/// bytes. The caller bounds this with the handshake timeout.
pub async fn sniff(stream: &TcpStream) -> std::io::Result<Option<Detection>> {
    let mut preamble = [0u8; 2];
    loop {
        let read = stream.peek(&mut preamble).await?;
        if read == 0 {
            return Ok(None);
        }
        match detect(&preamble[..read]) {
            Detection::NeedMore => tokio::time::sleep(PEEK_RETRY).await,
            detection => return Ok(Some(detection)),
        }
    }
}
