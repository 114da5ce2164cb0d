//! SOCKS5 verification against a local slipstream client
//!
//! A resolver that answers DNS probes may still carry no usable tunnel.
//! The validator opens the client's local SOCKS5 port, asks it to CONNECT
//! out by hostname, completes a TLS handshake with SNI through the tunnel
//! and exchanges one tiny HTTP request. Only a resolver that survives all
//! of that is reported as working.

use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Hostname the verification request goes to
pub const PROBE_HOST: &str = "www.google.com";

/// Destination port of the verification request
pub const PROBE_PORT: u16 = 443;

/// Deadline for one readiness greeting probe
pub(crate) const GREETING_TIMEOUT: Duration = Duration::from_millis(800);

const HTTP_PROBE: &[u8] =
    b"GET /generate_204 HTTP/1.1\r\nHost: www.google.com\r\nConnection: close\r\n\r\n";

static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

enum TunnelCheck {
    Pass(i64),
    SocksFail,
}

/// Run the full SOCKS5 verification against a local client port.
///
/// The whole round trip shares one deadline. Protocol-level rejections
/// report as `SOCKS FAIL`, transport errors as `ERROR`, the deadline as
/// `TIMEOUT`; a pass reports the total round-trip time.
pub async fn validate(port: u16, limit: Duration, host: &str, dst_port: u16) -> (i64, String) {
    match timeout(limit, tunnel_round_trip(port, host, dst_port)).await {
        Ok(Ok(TunnelCheck::Pass(ms))) => (ms, format!("{} ms", ms)),
        Ok(Ok(TunnelCheck::SocksFail)) => (-1, "SOCKS FAIL".to_string()),
        Ok(Err(e)) => {
            log::debug!("Real test round trip on port {} failed: {}", port, e);
            (-1, "ERROR".to_string())
        }
        Err(_) => (-1, "TIMEOUT".to_string()),
    }
}

async fn tunnel_round_trip(port: u16, host: &str, dst_port: u16) -> std::io::Result<TunnelCheck> {
    let start = Instant::now();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    // Greeting: offer no-auth only
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[1] != 0x00 {
        return Ok(TunnelCheck::SocksFail);
    }

    // CONNECT by hostname so the client resolves through the tunnel
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&dst_port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 10];
    let n = stream.read(&mut reply).await?;
    if n < 2 || reply[1] != 0x00 {
        return Ok(TunnelCheck::SocksFail);
    }

    let connector = TlsConnector::from(TLS_CONFIG.clone());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut tls = connector.connect(server_name, stream).await?;

    tls.write_all(HTTP_PROBE).await?;
    let mut response = [0u8; 64];
    let _ = tls.read(&mut response).await?;

    Ok(TunnelCheck::Pass(start.elapsed().as_millis() as i64))
}

/// Check whether something SOCKS5-shaped is accepting on the port
pub(crate) async fn greeting_ok(port: u16) -> bool {
    match timeout(GREETING_TIMEOUT, socks_hello(port)).await {
        Ok(Ok(reply)) => reply == [0x05, 0x00],
        _ => false,
    }
}

async fn socks_hello(port: u16) -> std::io::Result<[u8; 2]> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[derive(Clone, Copy)]
    enum Behavior {
        RejectGreeting,
        RejectConnect,
        AcceptThenClose,
        Silent,
    }

    async fn spawn_fake_socks(behavior: Behavior) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if matches!(behavior, Behavior::Silent) {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }

                    let mut greeting = [0u8; 3];
                    if stream.read_exact(&mut greeting).await.is_err() {
                        return;
                    }

                    if matches!(behavior, Behavior::RejectGreeting) {
                        let _ = stream.write_all(&[0x05, 0xFF]).await;
                        return;
                    }
                    if stream.write_all(&[0x05, 0x00]).await.is_err() {
                        return;
                    }

                    let mut head = [0u8; 5];
                    if stream.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    let mut rest = vec![0u8; head[4] as usize + 2];
                    if stream.read_exact(&mut rest).await.is_err() {
                        return;
                    }

                    let code = if matches!(behavior, Behavior::RejectConnect) {
                        0x05
                    } else {
                        0x00
                    };
                    let _ = stream
                        .write_all(&[0x05, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await;
                    // AcceptThenClose: drop the stream here, mid TLS handshake
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_greeting_ok_against_accepting_server() {
        let port = spawn_fake_socks(Behavior::AcceptThenClose).await;
        assert!(greeting_ok(port).await);
    }

    #[tokio::test]
    async fn test_greeting_ok_rejects_bad_method() {
        let port = spawn_fake_socks(Behavior::RejectGreeting).await;
        assert!(!greeting_ok(port).await);
    }

    #[tokio::test]
    async fn test_greeting_ok_without_listener() {
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);
        assert!(!greeting_ok(port).await);
    }

    #[tokio::test]
    async fn test_validate_reports_socks_fail_on_greeting() {
        let port = spawn_fake_socks(Behavior::RejectGreeting).await;
        let (ms, status) = validate(port, Duration::from_secs(2), PROBE_HOST, PROBE_PORT).await;
        assert_eq!(ms, -1);
        assert_eq!(status, "SOCKS FAIL");
    }

    #[tokio::test]
    async fn test_validate_reports_socks_fail_on_connect() {
        let port = spawn_fake_socks(Behavior::RejectConnect).await;
        let (ms, status) = validate(port, Duration::from_secs(2), PROBE_HOST, PROBE_PORT).await;
        assert_eq!(ms, -1);
        assert_eq!(status, "SOCKS FAIL");
    }

    #[tokio::test]
    async fn test_validate_reports_error_when_tunnel_drops() {
        // CONNECT succeeds but the peer vanishes during the TLS handshake
        let port = spawn_fake_socks(Behavior::AcceptThenClose).await;
        let (ms, status) = validate(port, Duration::from_secs(2), PROBE_HOST, PROBE_PORT).await;
        assert_eq!(ms, -1);
        assert_eq!(status, "ERROR");
    }

    #[tokio::test]
    async fn test_validate_times_out_on_silent_server() {
        let port = spawn_fake_socks(Behavior::Silent).await;
        let (ms, status) =
            validate(port, Duration::from_millis(300), PROBE_HOST, PROBE_PORT).await;
        assert_eq!(ms, -1);
        assert_eq!(status, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_validate_reports_error_without_listener() {
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let (ms, status) = validate(port, Duration::from_secs(2), PROBE_HOST, PROBE_PORT).await;
        assert_eq!(ms, -1);
        assert_eq!(status, "ERROR");
    }
}
