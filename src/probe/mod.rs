//! Randomized DNS probing
//!
//! Each probe sends a single A query for `<random>.<domain>` and reads the
//! resolver's verdict out of the response code. For a tunnel domain, both
//! a resolved answer and NXDOMAIN mean the query reached the authoritative
//! side, so both count as a live path. The random label defeats caches in
//! between.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Port probes are sent to
pub const DNS_PORT: u16 = 53;

/// Outcome of a single DNS probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Whether the reply suggests a usable tunnel path
    pub ok: bool,

    /// Status label, e.g. `OK (Resolved)` or `RCODE 2`
    pub detail: String,

    /// Round-trip time in milliseconds, -1 when no reply was timed
    pub elapsed_ms: i64,
}

impl ProbeOutcome {
    fn miss(detail: &str) -> Self {
        Self {
            ok: false,
            detail: detail.to_string(),
            elapsed_ms: -1,
        }
    }
}

/// Probe a resolver on the standard DNS port
pub async fn probe(ip: &str, domain: &str, timeout_ms: u64) -> ProbeOutcome {
    probe_at(ip, DNS_PORT, domain, timeout_ms).await
}

/// Probe a resolver on an explicit port
pub async fn probe_at(ip: &str, port: u16, domain: &str, timeout_ms: u64) -> ProbeOutcome {
    let addr: IpAddr = match ip.parse() {
        Ok(addr) => addr,
        Err(_) => return ProbeOutcome::miss("ERROR"),
    };

    let query = build_query(&random_qname(domain));

    let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            log::debug!("Probe bind failed: {}", e);
            return ProbeOutcome::miss("ERROR");
        }
    };

    let start = Instant::now();
    if let Err(e) = socket.send_to(&query, SocketAddr::new(addr, port)).await {
        log::debug!("Probe send to {} failed: {}", ip, e);
        return ProbeOutcome::miss("ERROR");
    }

    let mut buffer = [0u8; 4096];
    match timeout(
        Duration::from_millis(timeout_ms.max(50)),
        socket.recv_from(&mut buffer),
    )
    .await
    {
        Ok(Ok((bytes, _))) => {
            let elapsed_ms = start.elapsed().as_millis() as i64;
            classify_reply(&buffer[..bytes], elapsed_ms)
        }
        Ok(Err(e)) => {
            log::debug!("Probe recv from {} failed: {}", ip, e);
            ProbeOutcome::miss("ERROR")
        }
        Err(_) => ProbeOutcome::miss("TIMEOUT"),
    }
}

/// Build a minimal A query for the given name.
///
/// Random transaction ID, recursion desired, one question, QTYPE A,
/// QCLASS IN. No EDNS.
pub fn build_query(qname: &str) -> Bytes {
    let mut rng = rand::thread_rng();
    let mut buf = BytesMut::with_capacity(18 + qname.len());

    buf.put_u16(rng.gen::<u16>()); // transaction ID
    buf.put_u16(0x0100); // flags: RD
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(0); // ARCOUNT

    for label in qname.trim_matches('.').split('.').filter(|l| !l.is_empty()) {
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);

    buf.put_u16(1); // QTYPE A
    buf.put_u16(1); // QCLASS IN

    buf.freeze()
}

fn random_qname(domain: &str) -> String {
    let tag: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
    format!("{}.{}", tag, domain.trim_matches('.'))
}

/// Map a raw DNS reply to a probe outcome
fn classify_reply(reply: &[u8], elapsed_ms: i64) -> ProbeOutcome {
    if reply.len() < 4 {
        return ProbeOutcome {
            ok: false,
            detail: "BadResp".to_string(),
            elapsed_ms,
        };
    }

    let rcode = reply[3] & 0x0F;
    let (ok, detail) = match rcode {
        0 => (true, "OK (Resolved)".to_string()),
        3 => (true, "Tunnel Alive (NX)".to_string()),
        2 => (false, "ServFail".to_string()),
        5 => (false, "Refused".to_string()),
        other => (false, format!("RCODE {}", other)),
    };

    ProbeOutcome {
        ok,
        detail,
        elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_frame_layout() {
        let query = build_query("123456.t.example.com");

        // 12 byte header, then the encoded name and a 4 byte tail
        assert_eq!(query.len(), 38);
        assert_eq!(&query[2..4], &[0x01, 0x00]); // RD
        assert_eq!(&query[4..6], &[0x00, 0x01]); // one question
        assert_eq!(&query[6..12], &[0u8; 6]); // no other sections
        assert_eq!(query[12], 6);
        assert_eq!(&query[13..19], b"123456");
        assert_eq!(&query[query.len() - 5..], &[0x00, 0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_query_ignores_surrounding_dots() {
        let query = build_query(".a.example.com.");
        assert_eq!(query[12], 1);
        assert_eq!(query[13], b'a');
        assert_eq!(query[14], 7);
    }

    #[test]
    fn test_random_qname_shape() {
        let qname = random_qname("t.example.com.");
        let label = qname.split('.').next().unwrap();
        assert_eq!(label.len(), 6);
        assert!(label.chars().all(|c| c.is_ascii_digit()));
        assert!(qname.ends_with(".t.example.com"));
    }

    #[test]
    fn test_classify_rcodes() {
        let mut reply = [0u8; 12];

        reply[3] = 0x80; // rcode 0
        let outcome = classify_reply(&reply, 12);
        assert!(outcome.ok);
        assert_eq!(outcome.detail, "OK (Resolved)");
        assert_eq!(outcome.elapsed_ms, 12);

        reply[3] = 0x83; // NXDOMAIN
        let outcome = classify_reply(&reply, 12);
        assert!(outcome.ok);
        assert_eq!(outcome.detail, "Tunnel Alive (NX)");

        reply[3] = 0x82; // SERVFAIL
        let outcome = classify_reply(&reply, 12);
        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "ServFail");

        reply[3] = 0x85; // REFUSED
        assert_eq!(classify_reply(&reply, 12).detail, "Refused");

        reply[3] = 0x87; // unmapped code
        let outcome = classify_reply(&reply, 12);
        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "RCODE 7");
    }

    #[test]
    fn test_classify_short_reply_keeps_timing() {
        let outcome = classify_reply(&[0x12, 0x34], 9);
        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "BadResp");
        assert_eq!(outcome.elapsed_ms, 9);
    }

    #[tokio::test]
    async fn test_probe_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let mut reply = buf[..n].to_vec();
                reply[2] = 0x81;
                reply[3] = 0x83; // NXDOMAIN
                let _ = server.send_to(&reply, peer).await;
            }
        });

        let outcome = probe_at("127.0.0.1", port, "t.example.com", 2000).await;
        assert!(outcome.ok);
        assert_eq!(outcome.detail, "Tunnel Alive (NX)");
        assert!(outcome.elapsed_ms >= 0);
    }

    #[tokio::test]
    async fn test_probe_short_reply_is_bad_resp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, peer)) = server.recv_from(&mut buf).await {
                let _ = server.send_to(&[0xde, 0xad], peer).await;
            }
        });

        let outcome = probe_at("127.0.0.1", port, "t.example.com", 2000).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "BadResp");
        assert!(outcome.elapsed_ms >= 0);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        // Bound but never read: the probe has to run into its deadline
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let outcome = probe_at("127.0.0.1", port, "t.example.com", 100).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "TIMEOUT");
        assert_eq!(outcome.elapsed_ms, -1);
    }

    #[tokio::test]
    async fn test_probe_rejects_garbage_address() {
        let outcome = probe_at("not-an-ip", 53, "t.example.com", 100).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.detail, "ERROR");
    }
}
