//! Slipstream client process management
//!
//! One client process per real test: spawn it against the resolver under
//! test, wait until it looks ready, hand the SOCKS port to the validator,
//! then tear the process down whatever happened in between.

use crate::realtest::socks;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

/// Poll interval for the port side of the readiness race
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Poll interval for the log side of the readiness race
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between requesting termination and killing
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A running slipstream client bound to one resolver under test
#[derive(Debug)]
pub struct TransportProcess {
    child: Child,
    ready: Arc<AtomicBool>,
    port: u16,
}

impl TransportProcess {
    /// Spawn the client against a resolver, capturing its output
    pub async fn spawn(
        binary: &str,
        resolver: &str,
        domain: &str,
        port: u16,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(binary)
            .arg("--resolver")
            .arg(format!("{}:53", resolver))
            .arg("--domain")
            .arg(domain)
            .arg("--tcp-listen-port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let ready = Arc::new(AtomicBool::new(false));
        if let Some(stdout) = child.stdout.take() {
            watch_output(stdout, ready.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            watch_output(stderr, ready.clone());
        }

        Ok(Self { child, ready, port })
    }

    /// The local SOCKS port the client was asked to listen on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait until the client looks ready.
    ///
    /// Two signals race under one deadline: a "ready" marker in the client
    /// log, and the SOCKS port answering a greeting. Whichever resolves
    /// first wins; the loser is dropped.
    pub async fn wait_ready(&self, limit: Duration) -> bool {
        let marker = async {
            while !self.ready.load(Ordering::SeqCst) {
                sleep(LOG_POLL_INTERVAL).await;
            }
        };

        let port = self.port;
        let greeting = async {
            loop {
                if socks::greeting_ok(port).await {
                    return;
                }
                sleep(PORT_POLL_INTERVAL).await;
            }
        };

        timeout(limit, async {
            tokio::select! {
                _ = marker => {}
                _ = greeting => {}
            }
        })
        .await
        .is_ok()
    }

    /// Stop the client: request termination, wait briefly, then kill
    pub async fn shutdown(mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        request_terminate(&self.child);
        if timeout(SHUTDOWN_GRACE, self.child.wait()).await.is_err() {
            if let Err(e) = self.child.kill().await {
                log::debug!("Kill after grace period failed: {}", e);
            }
        }
    }
}

fn watch_output<R>(stream: R, ready: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::debug!("slipstream: {}", line);
            if line.to_lowercase().contains("ready") {
                ready.store(true, Ordering::SeqCst);
            }
        }
    });
}

#[cfg(unix)]
fn request_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    }
}

#[cfg(not(unix))]
fn request_terminate(_child: &Child) {
    // No graceful signal on this platform; shutdown falls through to kill
}

/// Grab an ephemeral TCP port by binding and immediately releasing it.
///
/// Another process can take the port between release and client startup;
/// a client that then fails to bind shows up as a readiness timeout.
pub async fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let err = TransportProcess::spawn(
            "definitely-not-a-slipstream-client",
            "192.0.2.1",
            "t.example.com",
            1080,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_free_port_is_released() {
        let port = free_port().await.unwrap();
        assert_ne!(port, 0);
        // The port must be bindable again straight away
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        drop(listener);
    }

    #[cfg(unix)]
    fn fake_client_script(body: &str) -> tempfile::TempPath {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{}", body).unwrap();
        file.flush().unwrap();

        let path = file.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_log_marker() {
        let script = fake_client_script("echo 'client Ready'; sleep 5");
        let proc = TransportProcess::spawn(
            script.to_str().unwrap(),
            "192.0.2.1",
            "t.example.com",
            free_port().await.unwrap(),
        )
        .await
        .unwrap();

        assert!(proc.wait_ready(Duration::from_secs(3)).await);
        proc.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_times_out_on_silent_client() {
        let script = fake_client_script("sleep 5");
        let proc = TransportProcess::spawn(
            script.to_str().unwrap(),
            "192.0.2.1",
            "t.example.com",
            free_port().await.unwrap(),
        )
        .await
        .unwrap();

        assert!(!proc.wait_ready(Duration::from_millis(400)).await);
        proc.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_ready_port_signal() {
        // The client says nothing, but something SOCKS-shaped answers on
        // its port, which is just as good
        let port = free_port().await.unwrap();
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut greeting = [0u8; 3];
                if stream.read_exact(&mut greeting).await.is_ok() {
                    let _ = stream.write_all(&[0x05, 0x00]).await;
                }
            }
        });

        let script = fake_client_script("sleep 5");
        let proc = TransportProcess::spawn(
            script.to_str().unwrap(),
            "192.0.2.1",
            "t.example.com",
            port,
        )
        .await
        .unwrap();

        assert!(proc.wait_ready(Duration::from_secs(3)).await);
        proc.shutdown().await;
    }
}
