//! Connector that measures DNS lookup, TCP connect and TLS handshake of every
//! new connection, and the time of the last byte written on it.
//!
//! The measurements travel with the connection as hyper "extra" info, so they
//! show up in the extensions of every response served over it. Only the first
//! response claims the connection phases; later ones on a pooled connection
//! see zero.

use hyper::client::connect::{Connected, Connection};
use hyper::service::Service;
use hyper::Uri;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;
use tokio_native_tls::TlsStream;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("dns lookup for {host} failed: {reason}")]
    Dns { host: String, reason: String },

    #[error("connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("tls handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },
}

/// Phase durations of a freshly opened connection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectPhases {
    pub looking_up: Duration,
    pub connecting: Duration,
    pub tls_handshaking: Duration,
}

impl ConnectPhases {
    pub fn total(&self) -> Duration {
        self.looking_up + self.connecting + self.tls_handshaking
    }
}

#[derive(Debug)]
struct ConnectionState {
    phases: ConnectPhases,
    unclaimed: AtomicBool,
    last_write: Mutex<Option<Instant>>,
}

/// Per-connection measurements, attached to every response's extensions.
#[derive(Debug, Clone)]
pub struct ConnectionInfo(Arc<ConnectionState>);

impl ConnectionInfo {
    /// Connection phases if this is the first response on the connection,
    /// zeroes otherwise.
    pub fn claim_phases(&self) -> ConnectPhases {
        if self.0.unclaimed.swap(false, Ordering::AcqRel) {
            self.0.phases
        } else {
            ConnectPhases::default()
        }
    }

    pub fn last_write(&self) -> Option<Instant> {
        *self.0.last_write.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

pub struct TimedStream {
    transport: Transport,
    info: ConnectionInfo,
}

impl TimedStream {
    fn mark_write(&self) {
        let mut last = self
            .info
            .0
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Some(Instant::now());
    }
}

impl Connection for TimedStream {
    fn connected(&self) -> Connected {
        Connected::new().extra(self.info.clone())
    }
}

impl AsyncRead for TimedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TimedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match &mut this.transport {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        };
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                this.mark_write();
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Clone)]
pub struct TimingConnector {
    tls: tokio_native_tls::TlsConnector,
}

impl TimingConnector {
    pub fn new() -> Result<Self, native_tls::Error> {
        let tls = native_tls::TlsConnector::new()?;
        Ok(Self {
            tls: tokio_native_tls::TlsConnector::from(tls),
        })
    }
}

impl Service<Uri> for TimingConnector {
    type Response = TimedStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<TimedStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();
        Box::pin(async move { connect(uri, tls).await })
    }
}

async fn connect(
    uri: Uri,
    tls: tokio_native_tls::TlsConnector,
) -> Result<TimedStream, ConnectError> {
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| ConnectError::InvalidUri(uri.to_string()))?;
    let secure = match uri.scheme_str() {
        Some("https") => true,
        Some("http") | None => false,
        Some(other) => return Err(ConnectError::InvalidUri(format!("unsupported scheme {}", other))),
    };
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

    let lookup_start = Instant::now();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| ConnectError::Dns {
            host: host.clone(),
            reason: e.to_string(),
        })?
        .collect();
    let looking_up = lookup_start.elapsed();
    if addrs.is_empty() {
        return Err(ConnectError::Dns {
            host,
            reason: "no addresses found".to_string(),
        });
    }

    let connect_start = Instant::now();
    let mut last_error = None;
    let mut tcp = None;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(e) => last_error = Some(e),
        }
    }
    let tcp = tcp.ok_or_else(|| ConnectError::Connect {
        host: host.clone(),
        reason: last_error.map_or_else(|| "no address reachable".to_string(), |e| e.to_string()),
    })?;
    let connecting = connect_start.elapsed();
    let _ = tcp.set_nodelay(true);

    let (transport, tls_handshaking) = if secure {
        let handshake_start = Instant::now();
        let stream = tls.connect(&host, tcp).await.map_err(|e| ConnectError::Tls {
            host: host.clone(),
            reason: e.to_string(),
        })?;
        (Transport::Tls(Box::new(stream)), handshake_start.elapsed())
    } else {
        (Transport::Plain(tcp), Duration::ZERO)
    };

    Ok(TimedStream {
        transport,
        info: ConnectionInfo(Arc::new(ConnectionState {
            phases: ConnectPhases {
                looking_up,
                connecting,
                tls_handshaking,
            },
            unclaimed: AtomicBool::new(true),
            last_write: Mutex::new(None),
        })),
    })
}

/// Finds a [`ConnectError`] in the source chain of a hyper error.
pub fn find_connect_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a ConnectError> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<ConnectError>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_phases_are_claimed_once() {
        let info = ConnectionInfo(Arc::new(ConnectionState {
            phases: ConnectPhases {
                looking_up: Duration::from_millis(1),
                connecting: Duration::from_millis(2),
                tls_handshaking: Duration::from_millis(3),
            },
            unclaimed: AtomicBool::new(true),
            last_write: Mutex::new(None),
        }));

        assert_eq!(info.claim_phases().total(), Duration::from_millis(6));
        assert_eq!(info.claim_phases(), ConnectPhases::default());
    }

    #[tokio::test]
    async fn test_connect_refused_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
        let mut connector = TimingConnector::new().unwrap();
        let err = connector.call(uri).await.err().unwrap();
        assert!(matches!(err, ConnectError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_rejected() {
        let uri: Uri = "ftp://127.0.0.1/".parse().unwrap();
        let mut connector = TimingConnector::new().unwrap();
        let err = connector.call(uri).await.err().unwrap();
        assert!(matches!(err, ConnectError::InvalidUri(_)));
    }
}
