use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{VeaError, VeaResult};

/// Proxy protocol spoken by a node
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeProtocol {
    #[default]
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
}

impl NodeProtocol {
    pub fn as_str(&self) -> &str {
        match self {
            NodeProtocol::Vless => "vless",
            NodeProtocol::Vmess => "vmess",
            NodeProtocol::Trojan => "trojan",
            NodeProtocol::Shadowsocks => "shadowsocks",
            NodeProtocol::Hysteria2 => "hysteria2",
            NodeProtocol::Tuic => "tuic",
        }
    }

    /// QUIC based protocols never go through a TCP/TLS handshake probe.
    pub fn is_udp_only(&self) -> bool {
        matches!(self, NodeProtocol::Hysteria2 | NodeProtocol::Tuic)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeSecurity {
    pub uuid: String,
    pub password: String,
    pub method: String,
    pub flow: String,
    pub encryption: String,
    pub alter_id: u32,
    pub plugin: String,
    pub plugin_opts: String,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeTransport {
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub headers: BTreeMap<String, String>,
    pub header_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeTls {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub server_name: String,
    pub insecure: bool,
    pub fingerprint: String,
    pub reality_public_key: String,
    pub reality_short_id: String,
    pub alpn: Vec<String>,
}

impl NodeTls {
    pub fn is_reality(&self) -> bool {
        self.kind == "reality" || !self.reality_public_key.trim().is_empty()
    }
}

/// One reachable proxy endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: NodeProtocol,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<NodeSecurity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<NodeTransport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<NodeTls>,
    pub source_config_id: String,
    pub source_key: String,
    pub last_latency_ms: i64,
    pub last_latency_at: Option<DateTime<Utc>>,
    pub last_latency_error: String,
    pub last_speed_mbps: f64,
    pub last_speed_at: Option<DateTime<Utc>>,
    pub last_speed_error: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Shadowsocks with a SIP003 plugin attached
    pub fn has_ss_plugin(&self) -> bool {
        self.protocol == NodeProtocol::Shadowsocks
            && self
                .security
                .as_ref()
                .map(|s| !s.plugin.trim().is_empty())
                .unwrap_or(false)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    /// Check the per-protocol required fields.
    pub fn validate(&self) -> VeaResult<()> {
        if self.name.trim().is_empty() {
            return Err(VeaError::invalid("name is required"));
        }
        if self.address.trim().is_empty() {
            return Err(VeaError::invalid("address is required"));
        }
        if self.port == 0 {
            return Err(VeaError::invalid("port is invalid"));
        }

        let sec = self.security.clone().unwrap_or_default();
        let missing = |v: &str| v.trim().is_empty();
        match self.protocol {
            NodeProtocol::Vless | NodeProtocol::Vmess => {
                if missing(&sec.uuid) {
                    return Err(VeaError::invalid("vmess/vless requires uuid"));
                }
            }
            NodeProtocol::Trojan => {
                if missing(&sec.password) {
                    return Err(VeaError::invalid("trojan requires password"));
                }
            }
            NodeProtocol::Shadowsocks => {
                if missing(&sec.method) || missing(&sec.password) {
                    return Err(VeaError::invalid(
                        "shadowsocks requires method and password",
                    ));
                }
            }
            NodeProtocol::Hysteria2 => {
                if missing(&sec.password) {
                    return Err(VeaError::invalid("hysteria2 requires password"));
                }
            }
            NodeProtocol::Tuic => {
                if missing(&sec.uuid) || missing(&sec.password) {
                    return Err(VeaError::invalid("tuic requires uuid and password"));
                }
            }
        }
        Ok(())
    }

    /// Fill protocol defaults after validation.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.address = self.address.trim().to_string();

        if let Some(sec) = self.security.as_mut() {
            match self.protocol {
                NodeProtocol::Vless => {
                    if sec.encryption.trim().is_empty() {
                        sec.encryption = "none".to_string();
                    }
                }
                NodeProtocol::Vmess => {
                    if sec.encryption.is_empty() && !sec.method.is_empty() {
                        sec.encryption = sec.method.clone();
                    }
                    if sec.method.is_empty() && !sec.encryption.is_empty() {
                        sec.method = sec.encryption.clone();
                    }
                    if sec.encryption.is_empty() {
                        sec.encryption = "auto".to_string();
                        sec.method = "auto".to_string();
                    }
                }
                _ => {}
            }
        }

        if let Some(tls) = self.tls.as_mut() {
            if tls.enabled && tls.kind.is_empty() {
                tls.kind = "tls".to_string();
            }
        }
        self
    }
}

/// Keep only the nodes whose id is in `ids`, preserving input order.
pub fn filter_nodes_by_id<'a>(
    nodes: &[Node],
    ids: impl IntoIterator<Item = &'a String>,
) -> Vec<Node> {
    let wanted: std::collections::HashSet<&String> = ids.into_iter().collect();
    nodes
        .iter()
        .filter(|n| wanted.contains(&n.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ss_node() -> Node {
        Node {
            id: "n1".to_string(),
            name: "ss".to_string(),
            address: "1.2.3.4".to_string(),
            port: 8388,
            protocol: NodeProtocol::Shadowsocks,
            security: Some(NodeSecurity {
                method: "aes-128-gcm".to_string(),
                password: "pw".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_requires_protocol_fields() {
        assert!(ss_node().validate().is_ok());

        let mut node = ss_node();
        node.security.as_mut().unwrap().password.clear();
        let err = node.validate().unwrap_err();
        assert!(err.to_string().contains("shadowsocks requires method and password"));

        let tuic = Node {
            protocol: NodeProtocol::Tuic,
            security: Some(NodeSecurity {
                uuid: "u".to_string(),
                ..Default::default()
            }),
            ..ss_node()
        };
        assert!(tuic.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let mut node = ss_node();
        node.port = 0;
        assert!(node.validate().unwrap_err().is_invalid_data());
    }

    #[test]
    fn test_normalized_defaults() {
        let vless = Node {
            protocol: NodeProtocol::Vless,
            security: Some(NodeSecurity {
                uuid: "u".to_string(),
                ..Default::default()
            }),
            tls: Some(NodeTls {
                enabled: true,
                ..Default::default()
            }),
            ..ss_node()
        }
        .normalized();
        assert_eq!(vless.security.as_ref().unwrap().encryption, "none");
        assert_eq!(vless.tls.as_ref().unwrap().kind, "tls");

        let vmess = Node {
            protocol: NodeProtocol::Vmess,
            security: Some(NodeSecurity {
                uuid: "u".to_string(),
                ..Default::default()
            }),
            ..ss_node()
        }
        .normalized();
        assert_eq!(vmess.security.as_ref().unwrap().encryption, "auto");
    }

    #[test]
    fn test_has_ss_plugin() {
        let mut node = ss_node();
        assert!(!node.has_ss_plugin());
        node.security.as_mut().unwrap().plugin = "obfs".to_string();
        assert!(node.has_ss_plugin());
    }

    #[test]
    fn test_filter_nodes_keeps_order() {
        let a = Node { id: "a".into(), ..Default::default() };
        let b = Node { id: "b".into(), ..Default::default() };
        let c = Node { id: "c".into(), ..Default::default() };
        let ids = vec!["c".to_string(), "a".to_string()];
        let out = filter_nodes_by_id(&[a, b, c], &ids);
        let got: Vec<&str> = out.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(got, vec!["a", "c"]);
    }
}
