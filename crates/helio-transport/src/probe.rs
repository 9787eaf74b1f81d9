//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Byte-level device transports and reachability checks."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Pre-flight reachability checks run before a full protocol connection,
//! to turn "firewall", "wrong IP" and "device off" into distinct log lines.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::{Result, TransportError};

/// Successful probe result.
#[derive(Debug, Clone, Copy)]
pub struct ProbeOutcome {
    /// Time to an accepted TCP connection.
    pub rtt: Duration,
}

/// Check whether a TCP port accepts connections. Fast by construction: the
/// caller passes a short timeout and the probe socket is dropped right away.
pub async fn probe_tcp_port(host: &str, port: u16, deadline: Duration) -> Result<ProbeOutcome> {
    let started = std::time::Instant::now();
    match timeout(deadline, TcpStream::connect((host, port))).await {
        Err(_) => Err(TransportError::HandshakeTimeout(deadline)),
        Ok(Err(err)) => Err(TransportError::Unreachable(format!("{host}:{port}: {err}"))),
        Ok(Ok(_stream)) => Ok(ProbeOutcome {
            rtt: started.elapsed(),
        }),
    }
}

/// Best-effort ICMP echo via the system `ping` binary. Diagnostic only:
/// the result feeds a log line, never control flow beyond it.
pub async fn icmp_ping(host: &str, deadline: Duration) -> bool {
    let timeout_s = deadline.as_secs().max(1).to_string();
    let result = tokio::process::Command::new("ping")
        .args(["-c", "1", "-W", &timeout_s, host])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) => status.success(),
        Err(err) => {
            debug!(host, error = %err, "ping binary unavailable, skipping ICMP check");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_reports_rtt_for_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let outcome = probe_tcp_port("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(outcome.rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn probe_reports_unreachable_for_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = probe_tcp_port("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
