use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How local applications reach the engine
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InboundMode {
    Socks,
    Http,
    #[default]
    Mixed,
    Tun,
}

impl InboundMode {
    pub fn as_str(&self) -> &str {
        match self {
            InboundMode::Socks => "socks",
            InboundMode::Http => "http",
            InboundMode::Mixed => "mixed",
            InboundMode::Tun => "tun",
        }
    }
}

/// Supported proxy engines
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
    #[serde(rename = "singbox", alias = "sing-box")]
    SingBox,
    #[serde(rename = "clash", alias = "mihomo")]
    Clash,
}

impl EngineKind {
    pub fn as_str(&self) -> &str {
        match self {
            EngineKind::SingBox => "singbox",
            EngineKind::Clash => "clash",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "singbox" | "sing-box" => Some(EngineKind::SingBox),
            "clash" | "mihomo" => Some(EngineKind::Clash),
            _ => None,
        }
    }

    /// Directory name under `<artifacts>/core/`
    pub fn dir_name(&self) -> &str {
        match self {
            EngineKind::SingBox => "sing-box",
            EngineKind::Clash => "clash",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator engine preference
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PreferredEngine {
    #[default]
    #[serde(rename = "auto", alias = "")]
    Auto,
    #[serde(rename = "singbox", alias = "sing-box")]
    SingBox,
    #[serde(rename = "clash", alias = "mihomo")]
    Clash,
}

impl PreferredEngine {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "auto" => Some(PreferredEngine::Auto),
            other => EngineKind::from_str(other).map(Self::from),
        }
    }

    pub fn engine(&self) -> Option<EngineKind> {
        match self {
            PreferredEngine::Auto => None,
            PreferredEngine::SingBox => Some(EngineKind::SingBox),
            PreferredEngine::Clash => Some(EngineKind::Clash),
        }
    }
}

impl From<EngineKind> for PreferredEngine {
    fn from(kind: EngineKind) -> Self {
        match kind {
            EngineKind::SingBox => PreferredEngine::SingBox,
            EngineKind::Clash => PreferredEngine::Clash,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundAuthentication {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundConfig {
    pub listen: String,
    pub allow_lan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<InboundAuthentication>,
    pub sniff: bool,
    pub sniff_override: bool,
    pub set_system_proxy: bool,
}

impl InboundConfig {
    /// Listen address after the allow-LAN rewrite.
    pub fn effective_listen(&self) -> String {
        effective_listen(&self.listen, self.allow_lan)
    }
}

/// With allow-LAN set, loopback or empty listen addresses widen to all interfaces.
pub fn effective_listen(listen: &str, allow_lan: bool) -> String {
    let host = listen.trim();
    if allow_lan {
        match host {
            "" | "127.0.0.1" | "localhost" => return "0.0.0.0".to_string(),
            "::1" => return "::".to_string(),
            _ => {}
        }
    }
    if host.is_empty() {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TunSettings {
    pub interface_name: String,
    pub mtu: u32,
    pub address: Vec<String>,
    pub auto_route: bool,
    pub auto_redirect: bool,
    pub strict_route: bool,
    pub stack: String,
    pub dns_hijack: bool,
    pub endpoint_independent_nat: bool,
    /// Seconds
    pub udp_timeout: u32,
    pub route_address: Vec<String>,
    pub route_exclude_address: Vec<String>,
}

impl TunSettings {
    pub fn with_defaults() -> Self {
        TunSettings {
            interface_name: "tun0".to_string(),
            mtu: 9000,
            address: vec!["172.19.0.1/30".to_string()],
            auto_route: true,
            strict_route: true,
            stack: "mixed".to_string(),
            dns_hijack: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolvedService {
    pub enabled: bool,
    pub listen: String,
    pub listen_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DnsConfig {
    pub use_resolved: bool,
    pub accept_default_resolvers: bool,
    pub remote_servers: Vec<String>,
    /// prefer_ipv4, prefer_ipv6, ipv4_only, ipv6_only
    pub strategy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub level: String,
    pub timestamp: bool,
    /// stdout, stderr or a file path
    pub output: String,
}

/// Singleton runtime configuration of the live FRouter
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    pub inbound_mode: InboundMode,
    pub inbound_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_config: Option<InboundConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tun_settings: Option<TunSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_service: Option<ResolvedService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<DnsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_config: Option<LogConfig>,
    pub preferred_engine: PreferredEngine,
    pub frouter_id: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial update of [`ProxyConfig`]; absent fields leave the current value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfigPatch {
    pub inbound_mode: Option<InboundMode>,
    pub inbound_port: Option<u16>,
    pub inbound_config: Option<InboundConfig>,
    pub tun_settings: Option<TunSettings>,
    pub resolved_service: Option<ResolvedService>,
    pub dns_config: Option<DnsConfig>,
    pub log_config: Option<LogConfig>,
    pub preferred_engine: Option<String>,
    pub frouter_id: Option<String>,
}

impl ProxyConfig {
    /// Merge a patch; zero values count as "not set".
    pub fn apply_patch(&mut self, patch: ProxyConfigPatch) {
        if let Some(mode) = patch.inbound_mode {
            self.inbound_mode = mode;
        }
        if let Some(port) = patch.inbound_port.filter(|p| *p != 0) {
            self.inbound_port = port;
        }
        if patch.inbound_config.is_some() {
            self.inbound_config = patch.inbound_config;
        }
        if patch.tun_settings.is_some() {
            self.tun_settings = patch.tun_settings;
        }
        if patch.resolved_service.is_some() {
            self.resolved_service = patch.resolved_service;
        }
        if patch.dns_config.is_some() {
            self.dns_config = patch.dns_config;
        }
        if patch.log_config.is_some() {
            self.log_config = patch.log_config;
        }
        if let Some(engine) = patch
            .preferred_engine
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .and_then(PreferredEngine::from_str)
        {
            self.preferred_engine = engine;
        }
        if let Some(id) = patch.frouter_id.filter(|id| !id.trim().is_empty()) {
            self.frouter_id = id.trim().to_string();
        }
    }

    /// Address the local inbound binds to; loopback without an inbound config.
    pub fn inbound_listen(&self) -> String {
        self.inbound_config
            .as_ref()
            .map(|ic| ic.effective_listen())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// Defaults applied right before an engine start.
    pub fn with_start_defaults(mut self, default_engine: PreferredEngine) -> Self {
        if self.inbound_port == 0 && self.inbound_mode != InboundMode::Tun {
            self.inbound_port = 1080;
        }

        let log = self.log_config.get_or_insert_with(|| LogConfig {
            timestamp: true,
            ..Default::default()
        });
        log.level = "debug".to_string();

        if self.inbound_mode == InboundMode::Tun {
            let tun = self
                .tun_settings
                .get_or_insert_with(TunSettings::with_defaults);
            if tun.interface_name.trim().is_empty() {
                tun.interface_name = "tun0".to_string();
            }
            if tun.mtu == 0 {
                tun.mtu = 9000;
            }
            if tun.address.is_empty() {
                tun.address = vec!["172.19.0.1/30".to_string()];
            }
            if tun.stack.trim().is_empty() {
                tun.stack = "mixed".to_string();
            }
        }

        if self.preferred_engine == PreferredEngine::Auto {
            self.preferred_engine = default_engine;
        }
        self
    }

    pub fn tun_interface_name(&self) -> String {
        self.tun_settings
            .as_ref()
            .map(|t| t.interface_name.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "tun0".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_listen_allow_lan() {
        assert_eq!(effective_listen("", true), "0.0.0.0");
        assert_eq!(effective_listen("127.0.0.1", true), "0.0.0.0");
        assert_eq!(effective_listen("localhost", true), "0.0.0.0");
        assert_eq!(effective_listen("::1", true), "::");
        assert_eq!(effective_listen("192.168.1.2", true), "192.168.1.2");
        assert_eq!(effective_listen("127.0.0.1", false), "127.0.0.1");
        assert_eq!(effective_listen("", false), "127.0.0.1");
    }

    #[test]
    fn test_inbound_listen_follows_inbound_config() {
        let mut cfg = ProxyConfig::default();
        assert_eq!(cfg.inbound_listen(), "127.0.0.1");
        cfg.inbound_config = Some(InboundConfig {
            listen: "192.168.1.2".to_string(),
            ..Default::default()
        });
        assert_eq!(cfg.inbound_listen(), "192.168.1.2");
        cfg.inbound_config = Some(InboundConfig {
            allow_lan: true,
            ..Default::default()
        });
        assert_eq!(cfg.inbound_listen(), "0.0.0.0");
    }

    #[test]
    fn test_apply_patch_ignores_zero_values() {
        let mut cfg = ProxyConfig {
            inbound_port: 7890,
            frouter_id: "fr-1".to_string(),
            ..Default::default()
        };
        cfg.apply_patch(ProxyConfigPatch {
            inbound_port: Some(0),
            frouter_id: Some(String::new()),
            preferred_engine: Some("clash".to_string()),
            ..Default::default()
        });
        assert_eq!(cfg.inbound_port, 7890);
        assert_eq!(cfg.frouter_id, "fr-1");
        assert_eq!(cfg.preferred_engine, PreferredEngine::Clash);
    }

    #[test]
    fn test_start_defaults() {
        let cfg = ProxyConfig::default().with_start_defaults(PreferredEngine::SingBox);
        assert_eq!(cfg.inbound_mode, InboundMode::Mixed);
        assert_eq!(cfg.inbound_port, 1080);
        assert_eq!(cfg.log_config.unwrap().level, "debug");
        assert_eq!(cfg.preferred_engine, PreferredEngine::SingBox);

        let tun = ProxyConfig {
            inbound_mode: InboundMode::Tun,
            ..Default::default()
        }
        .with_start_defaults(PreferredEngine::Auto);
        assert_eq!(tun.inbound_port, 0);
        let settings = tun.tun_settings.unwrap();
        assert_eq!(settings.interface_name, "tun0");
        assert_eq!(settings.mtu, 9000);
        assert!(settings.dns_hijack);
    }

    #[test]
    fn test_engine_kind_serde_aliases() {
        let kind: EngineKind = serde_json::from_str("\"sing-box\"").unwrap();
        assert_eq!(kind, EngineKind::SingBox);
        let pref: PreferredEngine = serde_json::from_str("\"mihomo\"").unwrap();
        assert_eq!(pref, PreferredEngine::Clash);
        assert_eq!(serde_json::to_string(&EngineKind::Clash).unwrap(), "\"clash\"");
    }
}
