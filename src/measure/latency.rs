use anyhow::{Context, Result};
use reqwest::{redirect, Client};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use super::tls;
use crate::domain::{Node, NodeProtocol};

const NODE_ATTEMPTS: usize = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// HEAD targets used when the FRouter goes out directly
pub const DIRECT_TARGETS: &[&str] = &[
    "http://www.gstatic.com/generate_204",
    "http://example.com/",
    "https://speed.cloudflare.com/__up",
];

/// Whether the node's latency includes a TLS handshake.
///
/// REALITY and the QUIC-based protocols cannot be handshaken over plain TCP.
pub fn should_tls_handshake(node: &Node) -> bool {
    let tls = match &node.tls {
        Some(tls) if tls.enabled => tls,
        _ => return false,
    };
    if tls.is_reality() {
        return false;
    }
    !node.protocol.is_udp_only()
}

/// Best of three TCP (+TLS) connects from this host to the node, in ms.
pub async fn node_latency(node: &Node) -> Result<i64> {
    if matches!(node.protocol, NodeProtocol::Hysteria2 | NodeProtocol::Tuic) {
        anyhow::bail!(
            "latency probe not supported for {} (udp/quic)",
            node.protocol.as_str()
        );
    }

    let mut best: Option<i64> = None;
    let mut last_err = None;
    for _ in 0..NODE_ATTEMPTS {
        match timeout(ATTEMPT_TIMEOUT, node_latency_once(node)).await {
            Ok(Ok(ms)) => {
                best = Some(best.map_or(ms, |b| b.min(ms)));
            }
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(anyhow::anyhow!("dial {} timed out", node.address)),
        }
    }

    match (best, last_err) {
        (Some(ms), _) => Ok(ms),
        (None, Some(e)) => Err(e),
        (None, None) => anyhow::bail!("no latency candidate successful"),
    }
}

async fn node_latency_once(node: &Node) -> Result<i64> {
    let host = strip_brackets(node.address.trim());
    if host.is_empty() || node.port == 0 {
        anyhow::bail!("invalid node address/port: {:?}:{}", node.address, node.port);
    }

    let start = Instant::now();
    let stream = TcpStream::connect((host, node.port))
        .await
        .with_context(|| format!("dial {}:{}", host, node.port))?;

    if should_tls_handshake(node) {
        let tls = node.tls.clone().unwrap_or_default();
        let server_name = match tls.server_name.trim() {
            "" => host.to_string(),
            name => name.to_string(),
        };
        let _session = tls::handshake(stream, &server_name, &tls.alpn).await?;
    }

    Ok(elapsed_ms(start))
}

/// Time to the response of a HEAD against the direct targets.
///
/// Candidates are tried in order; the first success wins.
pub async fn direct_latency(targets: &[&str]) -> Result<i64> {
    let client = Client::builder()
        .no_proxy()
        .danger_accept_invalid_certs(true)
        .redirect(redirect::Policy::none())
        .timeout(HEAD_TIMEOUT)
        .user_agent("VeaLatency")
        .build()
        .context("Failed to build http client")?;

    let mut last_err = None;
    for target in targets {
        match head_latency(&client, target).await {
            Ok(ms) => return Ok(ms),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no latency candidate successful")))
}

async fn head_latency(client: &Client, target: &str) -> Result<i64> {
    let start = Instant::now();
    let response = client
        .head(target)
        .send()
        .await
        .with_context(|| format!("HEAD {}", target))?;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        anyhow::bail!("http status {}", status.as_u16());
    }
    Ok(elapsed_ms(start))
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Elapsed milliseconds, never below 1 so that 0 keeps meaning "no latency".
fn elapsed_ms(start: Instant) -> i64 {
    (start.elapsed().as_millis() as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeTls;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn node(protocol: NodeProtocol, tls: Option<NodeTls>) -> Node {
        Node {
            id: "n1".to_string(),
            name: "n1".to_string(),
            address: "127.0.0.1".to_string(),
            port: 443,
            protocol,
            tls,
            ..Default::default()
        }
    }

    #[test]
    fn test_should_tls_handshake() {
        let tls = NodeTls {
            enabled: true,
            ..Default::default()
        };
        assert!(should_tls_handshake(&node(NodeProtocol::Trojan, Some(tls.clone()))));
        assert!(!should_tls_handshake(&node(NodeProtocol::Hysteria2, Some(tls.clone()))));
        assert!(!should_tls_handshake(&node(NodeProtocol::Vless, None)));

        let reality = NodeTls {
            enabled: true,
            reality_public_key: "pk".to_string(),
            ..Default::default()
        };
        assert!(!should_tls_handshake(&node(NodeProtocol::Vless, Some(reality))));
    }

    #[tokio::test]
    async fn test_node_latency_against_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                drop(conn);
            }
        });

        let mut target = node(NodeProtocol::Shadowsocks, None);
        target.port = port;
        let ms = node_latency(&target).await.unwrap();
        assert!(ms >= 1);
    }

    #[tokio::test]
    async fn test_node_latency_rejects_quic_protocols() {
        let err = node_latency(&node(NodeProtocol::Tuic, None)).await.unwrap_err();
        assert!(err.to_string().contains("udp/quic"));
    }

    #[tokio::test]
    async fn test_node_latency_reports_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut target = node(NodeProtocol::Trojan, None);
        target.port = port;
        assert!(node_latency(&target).await.is_err());
    }

    #[tokio::test]
    async fn test_head_latency_checks_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = conn.read(&mut buf).await;
            conn.write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();

            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = conn.read(&mut buf).await;
            conn.write_all(b"HTTP/1.1 503 Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let target = format!("http://127.0.0.1:{}/", port);
        assert!(direct_latency(&[target.as_str()]).await.unwrap() >= 1);
        let err = direct_latency(&[target.as_str()]).await.unwrap_err();
        assert_eq!(err.to_string(), "http status 503");
    }
}
