pub mod rules;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use super::plugin_opts::normalize_ss_plugin;
use super::{node_tags, BuildContext, EngineAdapter, ALL_PROTOCOLS};
use crate::domain::{
    EngineKind, InboundMode, LogConfig, Node, NodeProtocol, ProxyConfig, TunSettings,
};
use crate::frouter::{Purpose, RouteAction, RuntimePlan};
use rules::{RuleSetEntry, RuleSets};

pub use rules::rule_set_dir;

/// sing-box adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct SingBoxAdapter;

impl EngineAdapter for SingBoxAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::SingBox
    }

    fn binary_names(&self) -> &'static [&'static str] {
        &["sing-box", "sing-box.exe"]
    }

    fn supported_protocols(&self) -> &'static [NodeProtocol] {
        ALL_PROTOCOLS
    }

    fn supports_inbound(&self, _mode: InboundMode) -> bool {
        true
    }

    fn supports_ss_plugin(&self) -> bool {
        true
    }

    fn build_config(&self, plan: &RuntimePlan, ctx: &BuildContext) -> Result<Vec<u8>> {
        let config = match plan.purpose {
            Purpose::Proxy => build_proxy_config(plan, ctx)?,
            Purpose::Measurement => build_measurement_config(plan, ctx)?,
        };
        serde_json::to_vec_pretty(&config).context("Failed to encode sing-box config")
    }

    fn config_file_name(&self) -> &'static str {
        "config.json"
    }

    fn command_args(&self, config_path: &Path, work_dir: &Path) -> Vec<String> {
        vec![
            "run".to_string(),
            "-c".to_string(),
            config_path.to_string_lossy().into_owned(),
            "-D".to_string(),
            work_dir.to_string_lossy().into_owned(),
        ]
    }
}

#[derive(Debug, Serialize)]
struct SingBoxConfig {
    log: LogSection,
    dns: DnsSection,
    inbounds: Vec<Inbound>,
    outbounds: Vec<Outbound>,
    route: RouteSection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    services: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct LogSection {
    level: String,
    timestamp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct Inbound {
    #[serde(rename = "type")]
    kind: &'static str,
    tag: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interface_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_route: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_redirect: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strict_route: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    endpoint_independent_nat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udp_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    route_address: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    route_exclude_address: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sniff: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sniff_override_destination: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    users: Option<Vec<InboundUser>>,
}

#[derive(Debug, Serialize)]
struct InboundUser {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize)]
struct Outbound {
    #[serde(rename = "type")]
    kind: String,
    tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_opts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    up_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    down_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    congestion_control: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transport: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain_resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detour: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bind_interface: Option<String>,
}

#[derive(Debug, Serialize)]
struct RouteSection {
    rules: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rule_set: Vec<RuleSetEntry>,
    #[serde(rename = "final")]
    final_outbound: String,
    auto_detect_interface: bool,
    default_domain_resolver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_interface: Option<String>,
}

#[derive(Debug, Serialize)]
struct DnsSection {
    servers: Vec<DnsServer>,
    rules: Vec<Value>,
    strategy: String,
    #[serde(rename = "final")]
    final_server: String,
}

#[derive(Debug, Serialize)]
struct DnsServer {
    tag: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detour: Option<String>,
}

const DIRECT: &str = "direct";
const BLOCK: &str = "block";

fn build_proxy_config(plan: &RuntimePlan, ctx: &BuildContext) -> Result<SingBoxConfig> {
    let cfg = &plan.proxy_config;
    let tags = node_tags(&plan.nodes);
    let default_tag = outbound_tag(&plan.compiled.default, &tags)?;

    let mut outbounds = build_outbounds(plan, &tags)?;
    outbounds.push(Outbound {
        kind: DIRECT.to_string(),
        tag: DIRECT.to_string(),
        bind_interface: ctx.default_interface.clone(),
        ..Default::default()
    });
    outbounds.push(Outbound {
        kind: BLOCK.to_string(),
        tag: BLOCK.to_string(),
        ..Default::default()
    });

    Ok(SingBoxConfig {
        log: build_log(cfg.log_config.as_ref()),
        dns: build_dns(cfg, &default_tag),
        inbounds: build_inbounds(plan)?,
        outbounds,
        route: build_route(plan, ctx, &tags, &default_tag)?,
        services: build_services(cfg),
    })
}

fn build_measurement_config(plan: &RuntimePlan, ctx: &BuildContext) -> Result<SingBoxConfig> {
    if plan.inbound_port == 0 {
        anyhow::bail!("measurement plan missing inbound port");
    }
    let tags = node_tags(&plan.nodes);
    let default_tag = outbound_tag(&plan.compiled.default, &tags)?;

    let mut outbounds = build_outbounds(plan, &tags)?;
    outbounds.push(Outbound {
        kind: DIRECT.to_string(),
        tag: DIRECT.to_string(),
        ..Default::default()
    });
    outbounds.push(Outbound {
        kind: BLOCK.to_string(),
        tag: BLOCK.to_string(),
        ..Default::default()
    });

    let measure_ctx = BuildContext {
        artifacts_dir: ctx.artifacts_dir.clone(),
        default_interface: None,
    };

    Ok(SingBoxConfig {
        log: LogSection {
            level: "debug".to_string(),
            timestamp: true,
            output: None,
        },
        dns: build_dns(&plan.proxy_config, &default_tag),
        inbounds: vec![Inbound {
            kind: "socks",
            tag: "socks-in",
            listen: Some("127.0.0.1".to_string()),
            listen_port: Some(plan.inbound_port),
            ..Default::default()
        }],
        outbounds,
        route: build_route(plan, &measure_ctx, &tags, &default_tag)?,
        services: Vec::new(),
    })
}

fn build_inbounds(plan: &RuntimePlan) -> Result<Vec<Inbound>> {
    let cfg = &plan.proxy_config;
    let mut inbounds = Vec::new();

    let (kind, tag) = match plan.inbound_mode {
        InboundMode::Tun => {
            let tun = cfg
                .tun_settings
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("TUN mode requires tunSettings"))?;
            inbounds.push(tun_inbound(tun));
            if plan.inbound_port == 0 {
                return Ok(inbounds);
            }
            ("mixed", "mixed-in")
        }
        InboundMode::Mixed => ("mixed", "mixed-in"),
        InboundMode::Socks => ("socks", "socks-in"),
        InboundMode::Http => ("http", "http-in"),
    };

    let mut inbound = Inbound {
        kind,
        tag,
        listen: Some("127.0.0.1".to_string()),
        listen_port: Some(plan.inbound_port),
        ..Default::default()
    };
    if let Some(ic) = &cfg.inbound_config {
        inbound.listen = Some(ic.effective_listen());
        if ic.sniff {
            inbound.sniff = Some(true);
            if ic.sniff_override {
                inbound.sniff_override_destination = Some(true);
            }
        }
        if let Some(auth) = ic.authentication.as_ref().filter(|a| !a.username.is_empty()) {
            inbound.users = Some(vec![InboundUser {
                username: auth.username.clone(),
                password: auth.password.clone(),
            }]);
        }
    }
    inbounds.push(inbound);
    Ok(inbounds)
}

fn tun_inbound(tun: &TunSettings) -> Inbound {
    let stack = if tun.stack.trim().is_empty() {
        "mixed".to_string()
    } else {
        tun.stack.clone()
    };
    Inbound {
        kind: "tun",
        tag: "tun-in",
        interface_name: Some(tun.interface_name.clone()),
        mtu: Some(tun.mtu),
        address: Some(tun.address.clone()),
        auto_route: Some(tun.auto_route),
        auto_redirect: (cfg!(target_os = "linux") && tun.auto_redirect).then_some(true),
        strict_route: Some(tun.strict_route),
        stack: Some(stack),
        endpoint_independent_nat: tun.endpoint_independent_nat.then_some(true),
        udp_timeout: format_duration_secs(tun.udp_timeout),
        route_address: (!tun.route_address.is_empty()).then(|| tun.route_address.clone()),
        route_exclude_address: (!tun.route_exclude_address.is_empty())
            .then(|| tun.route_exclude_address.clone()),
        sniff: Some(true),
        sniff_override_destination: Some(false),
        ..Default::default()
    }
}

/// sing-box duration string: whole hours or minutes when exact, else seconds.
fn format_duration_secs(seconds: u32) -> Option<String> {
    match seconds {
        0 => None,
        s if s % 3600 == 0 => Some(format!("{}h", s / 3600)),
        s if s % 60 == 0 => Some(format!("{}m", s / 60)),
        s => Some(format!("{}s", s)),
    }
}

fn build_outbounds(plan: &RuntimePlan, tags: &BTreeMap<String, String>) -> Result<Vec<Outbound>> {
    let mut outbounds = Vec::with_capacity(plan.nodes.len() + 2);
    for node in &plan.nodes {
        let mut outbound = node_outbound(node, &tags[&node.id]);
        if let Some(upstream) = plan.compiled.detour_upstream.get(&node.id) {
            let upstream_tag = tags
                .get(upstream)
                .with_context(|| format!("detour upstream node not found: {}", upstream))?;
            outbound.detour = Some(upstream_tag.clone());
        }
        outbounds.push(outbound);
    }
    Ok(outbounds)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn node_outbound(node: &Node, tag: &str) -> Outbound {
    let sec = node.security.clone().unwrap_or_default();
    let mut out = Outbound {
        kind: String::new(),
        tag: tag.to_string(),
        server: Some(node.address.clone()),
        server_port: Some(node.port),
        domain_resolver: Some("dns-local".to_string()),
        ..Default::default()
    };

    match node.protocol {
        NodeProtocol::Vless => {
            out.kind = "vless".to_string();
            out.uuid = Some(sec.uuid.clone());
            out.flow = non_empty(&sec.flow);
        }
        NodeProtocol::Vmess => {
            out.kind = "vmess".to_string();
            out.uuid = Some(sec.uuid.clone());
            out.alter_id = Some(sec.alter_id);
            out.security = non_empty(&sec.encryption)
                .or_else(|| non_empty(&sec.method))
                .or_else(|| Some("auto".to_string()));
        }
        NodeProtocol::Trojan => {
            out.kind = "trojan".to_string();
            out.password = Some(sec.password.clone());
        }
        NodeProtocol::Shadowsocks => {
            out.kind = "shadowsocks".to_string();
            out.method = Some(sec.method.clone());
            out.password = Some(sec.password.clone());
            let (plugin, opts) = normalize_ss_plugin(&sec.plugin, &sec.plugin_opts);
            if !plugin.is_empty() {
                out.plugin = Some(plugin);
                out.plugin_opts = non_empty(&opts);
            }
        }
        NodeProtocol::Hysteria2 => {
            out.kind = "hysteria2".to_string();
            out.password = Some(sec.password.clone());
            out.up_mbps = Some(100);
            out.down_mbps = Some(100);
        }
        NodeProtocol::Tuic => {
            out.kind = "tuic".to_string();
            out.uuid = Some(sec.uuid.clone());
            out.password = Some(sec.password.clone());
            out.congestion_control = Some("bbr".to_string());
        }
    }

    if let Some(tls) = node.tls.as_ref().filter(|t| t.enabled) {
        let mut value = json!({ "enabled": true, "insecure": tls.insecure });
        if let Some(sni) = non_empty(&tls.server_name) {
            value["server_name"] = json!(sni);
        }
        let alpn = if tls.alpn.is_empty() { &sec.alpn } else { &tls.alpn };
        if !alpn.is_empty() {
            value["alpn"] = json!(alpn);
        }
        if let Some(fp) = non_empty(&tls.fingerprint) {
            value["utls"] = json!({ "enabled": true, "fingerprint": fp });
        }
        if tls.is_reality() {
            value["reality"] = json!({
                "enabled": true,
                "public_key": tls.reality_public_key,
                "short_id": tls.reality_short_id,
            });
        }
        out.tls = Some(value);
    }

    if let Some(transport) = &node.transport {
        out.transport = match transport.kind.as_str() {
            "ws" => {
                let mut value = json!({ "type": "ws" });
                if let Some(path) = non_empty(&transport.path) {
                    value["path"] = json!(path);
                }
                let mut headers = transport.headers.clone();
                if let Some(host) = non_empty(&transport.host) {
                    headers.insert("Host".to_string(), host);
                }
                if !headers.is_empty() {
                    value["headers"] = json!(headers);
                }
                Some(value)
            }
            "grpc" => {
                let mut value = json!({ "type": "grpc" });
                if let Some(name) = non_empty(&transport.service_name) {
                    value["service_name"] = json!(name);
                }
                Some(value)
            }
            "http" | "h2" => {
                let mut value = json!({ "type": "http" });
                if let Some(host) = non_empty(&transport.host) {
                    value["host"] = json!([host]);
                }
                if let Some(path) = non_empty(&transport.path) {
                    value["path"] = json!(path);
                }
                Some(value)
            }
            _ => None,
        };
    }

    out
}

fn outbound_tag(action: &RouteAction, tags: &BTreeMap<String, String>) -> Result<String> {
    match action {
        RouteAction::Direct => Ok(DIRECT.to_string()),
        RouteAction::Block => Ok(BLOCK.to_string()),
        RouteAction::Node(id) => tags
            .get(id)
            .cloned()
            .with_context(|| format!("node outbound not found: {}", id)),
    }
}

fn build_route(
    plan: &RuntimePlan,
    ctx: &BuildContext,
    tags: &BTreeMap<String, String>,
    default_tag: &str,
) -> Result<RouteSection> {
    let tun_mode = plan.inbound_mode == InboundMode::Tun;
    let mut rule_sets = RuleSets::new(&ctx.artifacts_dir);
    // DNS rules reference geosite-cn.
    rule_sets.add_geosite("cn");

    let mut rules = Vec::with_capacity(plan.compiled.rules.len() + 6);

    let hijack_dns = match (&plan.proxy_config.tun_settings, tun_mode) {
        (Some(tun), true) => tun.dns_hijack,
        _ => true,
    };
    if hijack_dns {
        rules.push(json!({ "protocol": ["dns"], "action": "hijack-dns" }));
    }

    if tun_mode {
        rules.push(json!({ "protocol": ["quic"], "outbound": BLOCK }));
        rules.push(json!({
            "process_name": ["sing-box", "xray", "v2ray"],
            "outbound": DIRECT,
        }));
    }

    let (hostnames, addresses) = proxy_servers(&plan.nodes);
    if !hostnames.is_empty() {
        rules.push(json!({ "domain": hostnames, "outbound": DIRECT }));
    }
    if !addresses.is_empty() {
        rules.push(json!({ "ip_cidr": addresses, "outbound": DIRECT }));
    }
    rules.push(json!({ "ip_is_private": true, "outbound": DIRECT }));

    for rule in &plan.compiled.rules {
        let outbound = outbound_tag(&rule.action, tags)
            .with_context(|| format!("edge {}", rule.edge_id))?;
        let entry = rule_sets
            .convert(&rule.matcher, &outbound)
            .with_context(|| format!("edge {}", rule.edge_id))?;
        rules.push(entry);
    }

    Ok(RouteSection {
        rules,
        rule_set: rule_sets.entries(),
        final_outbound: default_tag.to_string(),
        auto_detect_interface: true,
        default_domain_resolver: "dns-local".to_string(),
        default_interface: if tun_mode {
            ctx.default_interface.clone()
        } else {
            None
        },
    })
}

/// Node server hostnames and address CIDRs, deduplicated and sorted.
fn proxy_servers(nodes: &[Node]) -> (Vec<String>, Vec<String>) {
    let mut hostnames = Vec::new();
    let mut addresses = Vec::new();
    for node in nodes {
        let address = node.address.trim().trim_start_matches('[').trim_end_matches(']');
        if address.is_empty() {
            continue;
        }
        if address.parse::<IpAddr>().is_ok() {
            addresses.push(rules::normalize_cidr(address));
        } else {
            hostnames.push(address.to_string());
        }
    }
    for list in [&mut hostnames, &mut addresses] {
        list.sort();
        list.dedup();
    }
    (hostnames, addresses)
}

fn build_dns(cfg: &ProxyConfig, default_tag: &str) -> DnsSection {
    let dns = cfg.dns_config.clone().unwrap_or_default();
    let strategy = non_empty(&dns.strategy).unwrap_or_else(|| "prefer_ipv4".to_string());
    let remote = dns
        .remote_servers
        .iter()
        .map(|s| s.trim())
        .find(|s| s.parse::<IpAddr>().is_ok())
        .unwrap_or("8.8.8.8")
        .to_string();

    // sing-box rejects a DNS detour pointing at a bare direct outbound.
    let detour = match default_tag {
        DIRECT | BLOCK | "" => None,
        tag => Some(tag.to_string()),
    };

    DnsSection {
        servers: vec![
            DnsServer {
                tag: "dns-local",
                kind: "udp",
                server: "223.5.5.5".to_string(),
                detour: None,
            },
            DnsServer {
                tag: "dns-remote",
                kind: "udp",
                server: remote,
                detour,
            },
        ],
        rules: vec![json!({ "rule_set": ["geosite-cn"], "server": "dns-local" })],
        strategy,
        final_server: "dns-remote".to_string(),
    }
}

fn build_log(log: Option<&LogConfig>) -> LogSection {
    match log {
        None => LogSection {
            level: "info".to_string(),
            timestamp: true,
            output: None,
        },
        Some(log) => LogSection {
            level: non_empty(&log.level).unwrap_or_else(|| "info".to_string()),
            timestamp: log.timestamp,
            output: log_output(log),
        },
    }
}

/// File sing-box writes its own log to, if not stdout/stderr.
pub fn log_output(log: &LogConfig) -> Option<String> {
    match log.output.trim() {
        "" | "stdout" | "stderr" => None,
        path => Some(path.to_string()),
    }
}

fn build_services(cfg: &ProxyConfig) -> Vec<Value> {
    match &cfg.resolved_service {
        Some(svc) if svc.enabled => vec![json!({
            "type": "resolved",
            "tag": "resolved",
            "listen": svc.listen,
            "listen_port": svc.listen_port,
        })],
        _ => Vec::new(),
    }
}

/// Rule-set tags declared under `route.rule_set` of a rendered config.
pub fn referenced_rule_sets(config: &[u8]) -> Result<Vec<String>> {
    let value: Value = serde_json::from_slice(config).context("Failed to parse sing-box config")?;
    let mut tags: Vec<String> = Vec::new();
    if let Some(entries) = value.pointer("/route/rule_set").and_then(|v| v.as_array()) {
        for tag in entries.iter().filter_map(|e| e.get("tag")).filter_map(|t| t.as_str()) {
            if (tag.starts_with("geosite-") || tag.starts_with("geoip-"))
                && !tags.iter().any(|t| t == tag)
            {
                tags.push(tag.to_string());
            }
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::frouter::ChainProxySettings;
    use crate::domain::node::NodeSecurity;
    use crate::domain::proxy_config::InboundConfig;
    use crate::domain::{
        FRouter, ProxyEdge, RouteMatchRule, EDGE_DIRECT, EDGE_LOCAL, RULE_TYPE_ROUTE,
    };
    use crate::frouter::{compile_measurement_plan, compile_proxy_plan};
    use std::path::PathBuf;

    fn ss_node(plugin: &str, opts: &str) -> Node {
        Node {
            id: "n1-long-identifier".to_string(),
            name: "ss".to_string(),
            address: "ss.example.com".to_string(),
            port: 443,
            protocol: NodeProtocol::Shadowsocks,
            security: Some(NodeSecurity {
                method: "aes-128-gcm".to_string(),
                password: "pass".to_string(),
                plugin: plugin.to_string(),
                plugin_opts: opts.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn frouter(edges: Vec<ProxyEdge>) -> FRouter {
        FRouter {
            id: "fr".to_string(),
            chain_proxy: ChainProxySettings {
                edges,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn default_edge(to: &str) -> ProxyEdge {
        ProxyEdge {
            id: "default".to_string(),
            from: EDGE_LOCAL.to_string(),
            to: to.to_string(),
            enabled: true,
            ..Default::default()
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            artifacts_dir: PathBuf::from("/var/lib/vea"),
            default_interface: Some("eth0".to_string()),
        }
    }

    fn render(config: &ProxyConfig, edges: Vec<ProxyEdge>, nodes: &[Node]) -> Value {
        let plan = compile_proxy_plan(EngineKind::SingBox, config, &frouter(edges), nodes).unwrap();
        let bytes = SingBoxAdapter.build_config(&plan, &ctx()).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn outbound<'a>(cfg: &'a Value, kind: &str) -> &'a Value {
        cfg["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["type"] == kind)
            .unwrap()
    }

    #[test]
    fn test_obfs_alias_normalized() {
        let nodes = vec![ss_node("obfs", "host=x.com;mode=tls")];
        let cfg = render(&ProxyConfig::default(), vec![default_edge(&nodes[0].id)], &nodes);
        let ss = outbound(&cfg, "shadowsocks");
        assert_eq!(ss["tag"], "node-n1-long-");
        assert_eq!(ss["plugin"], "obfs-local");
        assert_eq!(ss["plugin_opts"], "obfs=tls;obfs-host=x.com");
        assert_eq!(ss["domain_resolver"], "dns-local");
    }

    #[test]
    fn test_dns_remote_detour_follows_default() {
        let nodes = vec![ss_node("", "")];
        let direct = render(&ProxyConfig::default(), vec![default_edge(EDGE_DIRECT)], &nodes);
        let remote = &direct["dns"]["servers"][1];
        assert_eq!(remote["tag"], "dns-remote");
        assert!(remote.get("detour").is_none());

        let proxied = render(&ProxyConfig::default(), vec![default_edge(&nodes[0].id)], &nodes);
        assert_eq!(proxied["dns"]["servers"][1]["detour"], "node-n1-long-");
        assert_eq!(proxied["route"]["final"], "node-n1-long-");
    }

    #[test]
    fn test_allow_lan_rewrites_listen() {
        let config = ProxyConfig {
            inbound_port: 1080,
            inbound_config: Some(InboundConfig {
                listen: "127.0.0.1".to_string(),
                allow_lan: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = render(&config, vec![default_edge(EDGE_DIRECT)], &[]);
        assert_eq!(cfg["inbounds"][0]["type"], "mixed");
        assert_eq!(cfg["inbounds"][0]["listen"], "0.0.0.0");
        assert_eq!(cfg["inbounds"][0]["listen_port"], 1080);
    }

    #[test]
    fn test_tun_adds_mixed_inbound_and_self_protection() {
        let config = ProxyConfig {
            inbound_mode: InboundMode::Tun,
            inbound_port: 7890,
            tun_settings: Some(TunSettings {
                udp_timeout: 300,
                ..TunSettings::with_defaults()
            }),
            ..Default::default()
        };
        let cfg = render(&config, vec![default_edge(EDGE_DIRECT)], &[]);
        let inbounds = cfg["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["type"], "tun");
        assert_eq!(inbounds[0]["udp_timeout"], "5m");
        assert_eq!(inbounds[1]["tag"], "mixed-in");
        assert_eq!(inbounds[1]["listen_port"], 7890);

        let rules = cfg["route"]["rules"].as_array().unwrap();
        assert_eq!(rules[0]["action"], "hijack-dns");
        assert_eq!(rules[1]["protocol"], json!(["quic"]));
        assert_eq!(rules[2]["outbound"], "direct");
        assert_eq!(cfg["route"]["default_interface"], "eth0");
    }

    #[test]
    fn test_tun_without_dns_hijack() {
        let config = ProxyConfig {
            inbound_mode: InboundMode::Tun,
            tun_settings: Some(TunSettings {
                dns_hijack: false,
                ..TunSettings::with_defaults()
            }),
            ..Default::default()
        };
        let cfg = render(&config, vec![default_edge(EDGE_DIRECT)], &[]);
        let rules = cfg["route"]["rules"].as_array().unwrap();
        assert!(rules.iter().all(|r| r.get("action").is_none()));
        assert_eq!(cfg["inbounds"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_user_rules_and_rule_sets() {
        let nodes = vec![ss_node("", "")];
        let rule = ProxyEdge {
            id: "cn".to_string(),
            from: EDGE_LOCAL.to_string(),
            to: EDGE_DIRECT.to_string(),
            enabled: true,
            priority: 10,
            rule_type: RULE_TYPE_ROUTE.to_string(),
            route_rule: Some(RouteMatchRule {
                domains: vec!["geosite:geolocation-cn".to_string()],
                ips: vec!["geoip:cn".to_string()],
            }),
            ..Default::default()
        };
        let cfg = render(
            &ProxyConfig::default(),
            vec![default_edge(&nodes[0].id), rule],
            &nodes,
        );
        let rules = cfg["route"]["rules"].as_array().unwrap();
        let last = rules.last().unwrap();
        assert_eq!(last["rule_set"], json!(["geosite-geolocation-cn", "geoip-cn"]));
        assert_eq!(last["outbound"], "direct");
        assert!(rules.iter().any(|r| r["domain"] == json!(["ss.example.com"])));

        let tags: Vec<&str> = cfg["route"]["rule_set"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["geoip-cn", "geosite-cn", "geosite-geolocation-cn"]);

        let bytes = serde_json::to_vec(&cfg).unwrap();
        assert_eq!(referenced_rule_sets(&bytes).unwrap(), tags);
    }

    #[test]
    fn test_detour_sets_upstream_tag() {
        let mut nodes = vec![ss_node("", ""), ss_node("", "")];
        nodes[1].id = "upstream".to_string();
        let mut edge = default_edge(&nodes[0].id);
        edge.via = vec!["upstream".to_string()];
        let cfg = render(&ProxyConfig::default(), vec![edge], &nodes);
        let child = cfg["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["tag"] == "node-n1-long-")
            .unwrap();
        assert_eq!(child["detour"], "node-upstream");
    }

    #[test]
    fn test_measurement_config() {
        let nodes = vec![ss_node("", "")];
        let plan = compile_measurement_plan(
            EngineKind::SingBox,
            40001,
            &frouter(vec![default_edge(&nodes[0].id)]),
            &nodes,
        )
        .unwrap();
        let bytes = SingBoxAdapter.build_config(&plan, &ctx()).unwrap();
        let cfg: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(cfg["inbounds"][0]["tag"], "socks-in");
        assert_eq!(cfg["inbounds"][0]["listen"], "127.0.0.1");
        assert_eq!(cfg["inbounds"][0]["listen_port"], 40001);
        assert_eq!(cfg["log"]["level"], "debug");
        assert!(outbound(&cfg, "direct").get("bind_interface").is_none());
    }

    #[test]
    fn test_log_output_and_command_args() {
        let log = LogConfig {
            level: "warn".to_string(),
            timestamp: false,
            output: "box.log".to_string(),
        };
        assert_eq!(log_output(&log), Some("box.log".to_string()));
        assert_eq!(build_log(Some(&log)).output.as_deref(), Some("box.log"));
        assert_eq!(build_log(None).level, "info");

        let args = SingBoxAdapter.command_args(Path::new("/w/config.json"), Path::new("/w"));
        assert_eq!(args, vec!["run", "-c", "/w/config.json", "-D", "/w"]);
    }
}
