//! The socket a shard talks through, and its tokio-tungstenite implementation.

use crate::error::Error;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};
use url::Url;

/// A frame the shard cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Text(String),
    /// Remote closed the socket, with its close code if it sent one
    Close(Option<u16>),
}

/// One open gateway socket
pub trait GatewaySocket: Send + 'static {
    /// Send a text frame
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), Error>> + Send;

    /// Next text or close frame. `None` once the stream has ended.
    fn next_message(
        &mut self,
    ) -> impl Future<Output = Option<Result<SocketMessage, Error>>> + Send;

    /// Close the socket with `code`
    fn close(&mut self, code: u16) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Opens gateway sockets
pub trait GatewayConnector: Send + Sync + 'static {
    type Socket: GatewaySocket;

    fn connect(&self, url: &str) -> impl Future<Output = Result<Self::Socket, Error>> + Send;
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connector backed by tokio-tungstenite and native-tls
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    /// Optional source IP to bind outgoing connections to
    source_ip: Option<String>,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind outgoing connections to `ip`
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }
}

impl GatewayConnector for TungsteniteConnector {
    type Socket = TungsteniteSocket;

    async fn connect(&self, url: &str) -> Result<TungsteniteSocket, Error> {
        let stream = connect_with_options(url, self.source_ip.as_deref()).await?;
        Ok(TungsteniteSocket { stream })
    }
}

/// An open tokio-tungstenite socket
pub struct TungsteniteSocket {
    stream: WsStream,
}

impl GatewaySocket for TungsteniteSocket {
    async fn send(&mut self, text: String) -> Result<(), Error> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<SocketMessage, Error>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => return Some(Ok(SocketMessage::Text(text))),
                Message::Binary(data) => {
                    return Some(String::from_utf8(data).map(SocketMessage::Text).map_err(|e| {
                        Error::Protocol(format!("binary frame is not utf-8: {}", e))
                    }))
                }
                Message::Close(frame) => {
                    return Some(Ok(SocketMessage::Close(
                        frame.map(|f| u16::from(f.code)),
                    )))
                }
                // Pongs are queued by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Ignoring control frame");
                }
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), Error> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(""),
        };
        self.stream.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

/// Connect to WebSocket with optional source IP binding.
async fn connect_with_options(url: &str, source_ip: Option<&str>) -> Result<WsStream, Error> {
    let parsed_url =
        Url::parse(url).map_err(|e| Error::Transport(format!("Invalid URL {}: {}", url, e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| Error::Transport(format!("No host in URL {}", url)))?;

    let is_tls = parsed_url.scheme() == "wss";
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .into_client_request()
        .map_err(|e| Error::Transport(format!("Invalid WebSocket request: {}", e)))?;

    let tcp_stream = connect_direct(host, port, source_ip).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::Transport(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, None, connector).await?;
    debug!("WebSocket handshake with {} complete", host);

    Ok(ws_stream)
}

/// Connect directly (optionally with source IP binding)
async fn connect_direct(
    host: &str,
    port: u16,
    source_ip: Option<&str>,
) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::Transport(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::Transport(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::Transport(format!("Failed to create socket: {}", e)))?;

    if let Some(ip) = source_ip {
        let source_addr: SocketAddr = format!("{}:0", ip)
            .parse()
            .map_err(|e| Error::Transport(format!("Invalid source IP '{}': {}", ip, e)))?;
        socket
            .bind(source_addr)
            .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", ip, e)))?;
    }

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::Transport(format!("TCP connect to {} failed: {}", dest_addr, e)))
}

fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    let _ = sock2.set_nodelay(true);

    // Keepalive catches half-open sockets between heartbeats
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_transport_error() {
        let connector = TungsteniteConnector::new();
        let err = connector.connect("not a url").await.err().unwrap();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_invalid_source_ip_is_rejected() {
        let err = connect_direct("127.0.0.1", 9, Some("not-an-ip"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid source IP"));
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"op":10}"#.into())).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            assert_eq!(reply, Message::Text("pong".into()));
            let close = ws.next().await.unwrap().unwrap();
            match close {
                Message::Close(Some(frame)) => u16::from(frame.code),
                other => panic!("expected close frame, got {:?}", other),
            }
        });

        let mut socket = TungsteniteConnector::new()
            .connect(&format!("ws://{}/?v=10&encoding=json", addr))
            .await
            .unwrap();
        assert_eq!(
            socket.next_message().await.unwrap().unwrap(),
            SocketMessage::Text(r#"{"op":10}"#.into())
        );
        socket.send("pong".into()).await.unwrap();
        socket.close(4000).await.unwrap();

        assert_eq!(server.await.unwrap(), 4000);
    }
}
