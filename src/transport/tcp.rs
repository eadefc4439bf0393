//! TCP connection to a PLC.
//!
//! # Example
//!
//! ```ignore
//! use s7wire_client::transport::{Endpoint, TcpTransport, TransportOptions};
//!
//! let endpoint: Endpoint = "192.168.0.10".parse()?;
//! let transport = TcpTransport::connect(&endpoint, &TransportOptions::default()).await?;
//! let (reader, writer) = transport.into_split();
//! ```

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::DEFAULT_PORT;
use crate::error::{Result, S7Error};

/// Host and port of a PLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = S7Error;

    /// Parse `host` or `host:port`; the port defaults to 102.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(S7Error::Config("empty endpoint".into()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| S7Error::Config(format!("invalid port in endpoint {:?}", s)))?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Socket options applied on connect.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub nodelay: bool,
    /// `SO_KEEPALIVE`, set before connecting.
    pub keep_alive: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
            keep_alive: true,
        }
    }
}

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to `endpoint` and verify the socket is usable.
    ///
    /// A timeout surfaces as `std::io::ErrorKind::TimedOut`.
    pub async fn connect(endpoint: &Endpoint, options: &TransportOptions) -> Result<Self> {
        let stream = tokio::time::timeout(options.connect_timeout, open_stream(endpoint, options))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", endpoint),
                )
            })??;

        stream.set_nodelay(options.nodelay)?;
        let transport = Self { stream };
        transport.check_connected()?;
        tracing::debug!(%endpoint, "TCP connection established");
        Ok(transport)
    }

    /// Check the socket for a pending error and a live peer.
    pub fn check_connected(&self) -> Result<()> {
        if let Some(error) = self.stream.take_error()? {
            return Err(S7Error::Io(error));
        }
        self.stream.peer_addr()?;
        Ok(())
    }

    /// Split into read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }

    /// Take back the underlying stream.
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    /// Get a reference to the underlying stream.
    pub fn inner(&self) -> &TcpStream {
        &self.stream
    }
}

/// Try each resolved address in turn.
async fn open_stream(endpoint: &Endpoint, options: &TransportOptions) -> std::io::Result<TcpStream> {
    let mut last_error = None;
    for addr in tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)).await? {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(options.keep_alive)?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {}", endpoint),
        )
    }))
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_parse() {
        let endpoint: Endpoint = "10.0.0.5".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("10.0.0.5", 102));

        let endpoint: Endpoint = "plc.local:1102".parse().unwrap();
        assert_eq!(endpoint.port, 1102);
        assert_eq!(endpoint.to_string(), "plc.local:1102");

        assert!("plc:notaport".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_connect_and_split() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let transport = TcpTransport::connect(
            &Endpoint::new("127.0.0.1", port),
            &TransportOptions::default(),
        )
        .await
        .unwrap();
        assert!(transport.inner().nodelay().unwrap());

        let (mut reader, mut writer) = transport.into_split();
        writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alive_option() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        for keep_alive in [true, false] {
            let options = TransportOptions {
                keep_alive,
                ..Default::default()
            };
            let transport = TcpTransport::connect(&endpoint, &options).await.unwrap();
            let _accepted = listener.accept().await.unwrap();

            let stream = transport.into_inner().into_std().unwrap();
            let socket = TcpSocket::from_std_stream(stream);
            assert_eq!(socket.keepalive().unwrap(), keep_alive);
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result =
            TcpTransport::connect(&Endpoint::new("127.0.0.1", port), &TransportOptions::default())
                .await;
        assert!(matches!(result, Err(S7Error::Io(_))));
    }
}
