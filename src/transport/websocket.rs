//! WebSocket Transport
//!
//! Wraps a tokio-tungstenite WebSocket in AsyncRead and AsyncWrite so the
//! MQTT codec can treat it as a plain byte stream. MQTT over WebSocket uses
//! binary frames; the handshake must offer the `mqtt` or `mqttv3.1`
//! subprotocol and carry an Origin header.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// Subprotocols accepted for MQTT v3.1.1
const SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqttv3.1"];

/// WebSocket stream wrapper that implements AsyncRead and AsyncWrite.
///
/// Incoming binary messages are buffered and presented as a continuous byte
/// stream; writes are sent as single binary frames.
pub struct WsStream<S> {
    /// Split sink for writing
    sink: SplitSink<WebSocketStream<S>, Message>,
    /// Split stream for reading
    stream: SplitStream<WebSocketStream<S>>,
    /// Read buffer for incomplete reads
    read_buffer: BytesMut,
    /// Write buffer for batching small writes
    write_buffer: BytesMut,
    /// Pending messages to be read
    pending_messages: VecDeque<Vec<u8>>,
    /// Whether the stream has been closed
    closed: bool,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink,
            stream,
            read_buffer: BytesMut::with_capacity(2048),
            write_buffer: BytesMut::with_capacity(2048),
            pending_messages: VecDeque::new(),
            closed: false,
        }
    }

    /// Accept a WebSocket connection carrying MQTT.
    ///
    /// Validates the request path, requires an Origin header and one of the
    /// MQTT subprotocols. Returns the stream and the request Host header,
    /// which stands in for the TLS server name on plain connections.
    pub async fn accept(stream: S, expected_path: &str) -> Result<(Self, Option<String>), io::Error> {
        let mut host = None;

        let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let request_path = req.uri().path();
            if request_path != expected_path {
                return Err(ErrorResponse::new(Some(format!(
                    "invalid path: expected '{}', got '{}'",
                    expected_path, request_path
                ))));
            }

            if !req.headers().contains_key("origin") {
                return Err(ErrorResponse::new(Some("missing origin".to_string())));
            }

            host = req
                .headers()
                .get("host")
                .and_then(|h| h.to_str().ok())
                .map(|h| h.to_string());

            let selected = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|protocols| protocols.to_str().ok())
                .and_then(|protocols| {
                    protocols
                        .split(',')
                        .map(|p| p.trim())
                        .find(|p| SUBPROTOCOLS.contains(p))
                        .map(|p| p.to_string())
                });

            match selected {
                Some(protocol) => {
                    response.headers_mut().insert(
                        "sec-websocket-protocol",
                        protocol.parse().expect("valid header value"),
                    );
                    Ok(response)
                }
                None => Err(ErrorResponse::new(Some(
                    "no suitable subprotocol".to_string(),
                ))),
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(io::Error::other)?;

        Ok((Self::new(ws), host))
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // First, try to fulfill from the read buffer
        if !self.read_buffer.is_empty() {
            let to_copy = std::cmp::min(buf.remaining(), self.read_buffer.len());
            buf.put_slice(&self.read_buffer[..to_copy]);
            let _ = self.read_buffer.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        // Check pending messages
        if let Some(msg) = self.pending_messages.pop_front() {
            let to_copy = std::cmp::min(buf.remaining(), msg.len());
            buf.put_slice(&msg[..to_copy]);
            if to_copy < msg.len() {
                self.read_buffer.extend_from_slice(&msg[to_copy..]);
            }
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        // Poll for new messages
        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(message))) => match message {
                Message::Binary(data) => {
                    let to_copy = std::cmp::min(buf.remaining(), data.len());
                    buf.put_slice(&data[..to_copy]);
                    if to_copy < data.len() {
                        self.read_buffer.extend_from_slice(&data[to_copy..]);
                    }
                    Poll::Ready(Ok(()))
                }
                Message::Close(_) => {
                    self.closed = true;
                    Poll::Ready(Ok(()))
                }
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Frame(_) => {
                    // Not part of the MQTT byte stream, poll again
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            },
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                self.write_buffer.extend_from_slice(buf);
                let data = self.write_buffer.split().freeze().to_vec();
                match Pin::new(&mut self.sink).start_send(Message::Binary(data)) {
                    Ok(()) => Poll::Ready(Ok(buf.len())),
                    Err(e) => Poll::Ready(Err(io::Error::other(e))),
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.sink)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.sink).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                let _ = Pin::new(&mut self.sink).start_send(Message::Close(None));
                Pin::new(&mut self.sink)
                    .poll_flush(cx)
                    .map_err(io::Error::other)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}
