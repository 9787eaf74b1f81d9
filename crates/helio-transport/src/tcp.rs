//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Byte-level device transports and reachability checks."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{ByteTransport, Result, TransportError};

/// TCP byte transport. Connecting runs the pre-flight reachability probe
/// first so that "port closed" and "host down" produce distinct errors
/// before a full handshake is attempted.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    /// RTT measured by the last successful probe, for comm auto-tuning.
    last_probe_rtt: Option<Duration>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            last_probe_rtt: None,
        }
    }

    /// RTT observed by the most recent pre-flight probe, if any.
    pub fn measured_rtt(&self) -> Option<Duration> {
        self.last_probe_rtt
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl ByteTransport for TcpTransport {
    async fn connect(&mut self, deadline: Duration) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        // Cheap probe before committing the full deadline; distinguishes a
        // filtered/never-answering host from a refused port.
        let probe_budget = deadline.min(Duration::from_secs(2));
        match crate::probe::probe_tcp_port(&self.host, self.port, probe_budget).await {
            Ok(outcome) => {
                debug!(target = %self.addr(), rtt_ms = outcome.rtt.as_millis() as u64, "pre-flight probe ok");
                self.last_probe_rtt = Some(outcome.rtt);
            }
            Err(err) => {
                if crate::probe::icmp_ping(&self.host, Duration::from_secs(1)).await {
                    warn!(target = %self.addr(), "port probe failed but host answers ICMP; service likely down");
                } else {
                    warn!(target = %self.addr(), "port probe and ICMP both failed; host likely down or blocked");
                }
                return Err(err);
            }
        }

        let stream = match timeout(deadline, TcpStream::connect(self.addr())).await {
            Err(_) => return Err(TransportError::HandshakeTimeout(deadline)),
            Ok(Err(err)) => return Err(TransportError::Unreachable(err.to_string())),
            Ok(Ok(stream)) => stream,
        };
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match timeout(deadline, stream.read_exact(buf)).await {
            Err(_) => Err(TransportError::Timeout(deadline)),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.stream = None;
                Err(TransportError::Closed)
            }
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn write_all(&mut self, buf: &[u8], deadline: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        match timeout(deadline, stream.write_all(buf)).await {
            Err(_) => Err(TransportError::Timeout(deadline)),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn drain(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut scratch = [0u8; 256];
        // Non-blocking sweep: stop as soon as nothing is immediately ready.
        while let Ok(Ok(n)) = timeout(Duration::from_millis(5), stream.read(&mut scratch)).await {
            if n == 0 {
                self.stream = None;
                return;
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn measured_rtt(&self) -> Option<Duration> {
        self.last_probe_rtt
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_and_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let mut transport = TcpTransport::new("127.0.0.1", addr.port());
        transport.connect(Duration::from_secs(2)).await.unwrap();
        assert!(transport.is_open());
        assert!(transport.measured_rtt().is_some());

        transport
            .write_all(&[1, 2, 3, 4], Duration::from_secs(1))
            .await
            .unwrap();
        let mut reply = [0u8; 4];
        transport
            .read_exact(&mut reply, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, [1, 2, 3, 4]);

        transport.close().await;
        assert!(!transport.is_open());
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn refused_port_reports_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::new("127.0.0.1", port);
        let err = transport.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn read_without_connect_is_closed() {
        let mut transport = TcpTransport::new("127.0.0.1", 1);
        let mut buf = [0u8; 1];
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
