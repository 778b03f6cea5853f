use anyhow::{Context, Result};
use serde::Serialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::plugin_opts::{normalize_ss_plugin, parse_plugin_opts};
use super::singbox::rules::normalize_cidr;
use super::{node_tags, BuildContext, EngineAdapter, ALL_PROTOCOLS};
use crate::domain::{
    EngineKind, InboundMode, Node, NodeProtocol, NodeTls, NodeTransport, ProxyConfig,
    RouteMatchRule,
};
use crate::frouter::{RouteAction, RuntimePlan};

/// mihomo (Clash.Meta) adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct MihomoAdapter;

impl EngineAdapter for MihomoAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Clash
    }

    fn binary_names(&self) -> &'static [&'static str] {
        &["mihomo", "mihomo.exe", "clash", "clash.exe"]
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

    fn build_config(&self, plan: &RuntimePlan, _ctx: &BuildContext) -> Result<Vec<u8>> {
        let config = build_config(plan)?;
        let yaml = serde_yaml::to_string(&config).context("Failed to encode mihomo config")?;
        Ok(yaml.into_bytes())
    }

    fn config_file_name(&self) -> &'static str {
        "config.yaml"
    }

    fn command_args(&self, config_path: &Path, work_dir: &Path) -> Vec<String> {
        vec![
            "-d".to_string(),
            work_dir.to_string_lossy().into_owned(),
            "-f".to_string(),
            config_path.to_string_lossy().into_owned(),
        ]
    }
}

/// mihomo configuration document (only what we emit)
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct MihomoConfig {
    mode: String,
    log_level: String,
    geox_url: GeoxUrl,
    geo_auto_update: bool,
    geo_update_interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    sniffer: Option<Sniffer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    find_process_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing_mark: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<Profile>,
    bind_address: String,
    allow_lan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    authentication: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mixed_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    socks_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tun: Option<Tun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<Dns>,
    proxies: Vec<Proxy>,
    rules: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct GeoxUrl {
    geoip: String,
    geosite: String,
    mmdb: String,
}

impl GeoxUrl {
    fn jsdelivr() -> Self {
        let base = "https://fastly.jsdelivr.net/gh/MetaCubeX/meta-rules-dat@release";
        Self {
            geoip: format!("{}/geoip.dat", base),
            geosite: format!("{}/geosite.dat", base),
            mmdb: format!("{}/geoip.metadb", base),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Sniffer {
    enable: bool,
    sniff: BTreeMap<String, SniffPorts>,
}

#[derive(Debug, Clone, Serialize)]
struct SniffPorts {
    ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Profile {
    store_selected: bool,
    store_fake_ip: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Tun {
    enable: bool,
    stack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    inet4_address: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    auto_route: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    auto_detect_interface: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    auto_redirect: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    strict_route: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    endpoint_independent_nat: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    route_address: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    route_exclude_address: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dns_hijack: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Dns {
    enable: bool,
    listen: String,
    ipv6: bool,
    enhanced_mode: String,
    fake_ip_range: String,
    fake_ip_filter: Vec<String>,
    nameserver: Vec<String>,
    default_nameserver: Vec<String>,
    proxy_server_nameserver: Vec<String>,
    direct_nameserver: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Proxy {
    name: String,
    #[serde(rename = "type")]
    proxy_type: String,
    server: String,
    port: u16,
    udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cipher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plugin_opts: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reduce_rtt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udp_relay_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    servername: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_cert_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alpn: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reality_opts: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ws_opts: Option<WsOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grpc_opts: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    h2_opts: Option<H2Opts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_opts: Option<HttpOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dialer_proxy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct WsOpts {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct H2Opts {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    host: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct HttpOpts {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    path: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, Vec<String>>,
}

const DIRECT: &str = "DIRECT";
const REJECT: &str = "REJECT";

const BOOTSTRAP_DNS: [&str; 4] = ["223.5.5.5", "119.29.29.29", "1.1.1.1", "8.8.8.8"];

fn build_config(plan: &RuntimePlan) -> Result<MihomoConfig> {
    if plan.inbound_port == 0 && plan.inbound_mode != InboundMode::Tun {
        anyhow::bail!("{} plan missing inbound port", plan.purpose.as_str());
    }

    let mut cfg = base_config(plan);
    apply_inbound(&mut cfg, &plan.proxy_config, plan.inbound_mode, plan.inbound_port);
    if plan.inbound_mode == InboundMode::Tun {
        cfg.dns = Some(build_dns(&plan.proxy_config));
    }

    let tags = node_tags(&plan.nodes);
    cfg.proxies = build_proxies(plan, &tags)?;
    cfg.rules = build_rules(plan, &tags)?;
    Ok(cfg)
}

fn base_config(plan: &RuntimePlan) -> MihomoConfig {
    let tun = plan.inbound_mode == InboundMode::Tun;
    let linux_tun = tun && cfg!(target_os = "linux");

    let level = plan
        .proxy_config
        .log_config
        .as_ref()
        .map(|l| l.level.as_str())
        .unwrap_or_default();

    MihomoConfig {
        mode: "rule".to_string(),
        log_level: map_log_level(level).to_string(),
        geox_url: GeoxUrl::jsdelivr(),
        geo_auto_update: false,
        geo_update_interval: 24,
        sniffer: tun.then(|| Sniffer {
            enable: true,
            sniff: BTreeMap::from([
                ("TLS".to_string(), SniffPorts { ports: vec![443] }),
                ("HTTP".to_string(), SniffPorts { ports: vec![80] }),
            ]),
        }),
        // PROCESS-NAME rules only match with strict process lookup.
        find_process_mode: linux_tun.then(|| "strict".to_string()),
        routing_mark: linux_tun.then_some(6666),
        profile: linux_tun.then_some(Profile {
            store_selected: true,
            store_fake_ip: true,
        }),
        ..Default::default()
    }
}

fn map_log_level(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "debug" => "debug",
        "warning" | "warn" => "warning",
        "error" => "error",
        "none" | "silent" => "silent",
        _ => "info",
    }
}

fn apply_inbound(cfg: &mut MihomoConfig, profile: &ProxyConfig, mode: InboundMode, port: u16) {
    let port = (port > 0).then_some(port);

    cfg.bind_address = "127.0.0.1".to_string();
    if let Some(ic) = &profile.inbound_config {
        cfg.bind_address = ic.effective_listen();
        cfg.allow_lan = ic.allow_lan;
        if let Some(auth) = &ic.authentication {
            let (user, pass) = (auth.username.trim(), auth.password.trim());
            if !user.is_empty() && !pass.is_empty() {
                cfg.authentication = Some(vec![format!("{}:{}", user, pass)]);
            }
        }
    }

    match mode {
        InboundMode::Mixed => cfg.mixed_port = port,
        InboundMode::Socks => cfg.socks_port = port,
        InboundMode::Http => cfg.port = port,
        InboundMode::Tun => {
            cfg.mixed_port = port;
            cfg.tun = Some(build_tun(profile));
        }
    }
}

fn build_tun(profile: &ProxyConfig) -> Tun {
    let linux = cfg!(target_os = "linux");
    let mut tun = Tun {
        enable: true,
        stack: "mixed".to_string(),
        ..Default::default()
    };

    let settings = match &profile.tun_settings {
        Some(settings) => settings,
        None => {
            tun.mtu = linux.then_some(1500);
            return tun;
        }
    };

    let name = settings.interface_name.trim();
    let default_name = name == "vea" || name == "tun0";
    if !name.is_empty() && (linux || !default_name) {
        tun.device = Some(name.to_string());
    }

    // mihomo ignores custom inet4 ranges in some releases; pin its own default.
    tun.inet4_address = vec!["198.18.0.1/30".to_string()];

    if !settings.stack.trim().is_empty() {
        tun.stack = settings.stack.trim().to_string();
    }
    tun.mtu = if settings.mtu > 0 {
        Some(settings.mtu)
    } else {
        linux.then_some(1500)
    };
    if settings.auto_route {
        tun.auto_route = true;
        tun.auto_detect_interface = true;
    }
    tun.auto_redirect = linux && settings.auto_redirect;
    // strict-route without exclusions blackholes the host.
    tun.strict_route = settings.strict_route && !settings.route_exclude_address.is_empty();
    tun.endpoint_independent_nat = settings.endpoint_independent_nat;
    tun.route_address = settings.route_address.clone();
    tun.route_exclude_address = settings.route_exclude_address.clone();
    if settings.dns_hijack {
        tun.dns_hijack = vec!["any:53".to_string(), "tcp://any:53".to_string()];
    }
    tun
}

fn build_dns(profile: &ProxyConfig) -> Dns {
    let dns = profile.dns_config.clone().unwrap_or_default();

    let mut nameserver: Vec<String> = dns
        .remote_servers
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if nameserver.is_empty() {
        nameserver = vec![
            "https://doh.pub/dns-query".to_string(),
            "https://dns.alidns.com/dns-query".to_string(),
        ];
    }

    let bootstrap: Vec<String> = BOOTSTRAP_DNS.iter().map(|s| s.to_string()).collect();
    let ipv6 = matches!(
        dns.strategy.trim().to_lowercase().as_str(),
        "prefer_ipv6" | "ipv6_only"
    );

    Dns {
        enable: true,
        // 53 is usually taken by systemd-resolved.
        listen: "0.0.0.0:1053".to_string(),
        ipv6,
        enhanced_mode: "fake-ip".to_string(),
        fake_ip_range: "198.18.0.1/16".to_string(),
        fake_ip_filter: ["+.lan", "+.local", "time.*.com", "ntp.*.com"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        nameserver,
        default_nameserver: bootstrap.clone(),
        proxy_server_nameserver: bootstrap.clone(),
        direct_nameserver: bootstrap,
    }
}

fn build_proxies(plan: &RuntimePlan, tags: &BTreeMap<String, String>) -> Result<Vec<Proxy>> {
    let mut proxies = Vec::with_capacity(plan.nodes.len());
    for node in &plan.nodes {
        let mut proxy = node_proxy(node, &tags[&node.id]);
        if let Some(upstream) = plan.compiled.detour_upstream.get(&node.id) {
            let name = tags
                .get(upstream)
                .with_context(|| format!("detour upstream node not found: {}", upstream))?;
            proxy.dialer_proxy = Some(name.clone());
        }
        proxies.push(proxy);
    }
    Ok(proxies)
}

fn trimmed(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn node_proxy(node: &Node, name: &str) -> Proxy {
    let sec = node.security.clone().unwrap_or_default();
    let mut p = Proxy {
        name: name.to_string(),
        server: node.address.clone(),
        port: node.port,
        udp: true,
        ..Default::default()
    };

    match node.protocol {
        NodeProtocol::Vless => {
            p.proxy_type = "vless".to_string();
            p.uuid = Some(sec.uuid.clone());
            p.network = Some("tcp".to_string());
            p.flow = trimmed(&sec.flow);
        }
        NodeProtocol::Vmess => {
            p.proxy_type = "vmess".to_string();
            p.uuid = Some(sec.uuid.clone());
            p.alter_id = Some(sec.alter_id);
            p.cipher = trimmed(&sec.encryption).or_else(|| Some("auto".to_string()));
        }
        NodeProtocol::Trojan => {
            p.proxy_type = "trojan".to_string();
            p.password = Some(sec.password.clone());
        }
        NodeProtocol::Shadowsocks => {
            p.proxy_type = "ss".to_string();
            p.cipher = Some(sec.method.clone());
            p.password = Some(sec.password.clone());
            if let Some((plugin, opts)) = ss_plugin(&sec.plugin, &sec.plugin_opts) {
                p.plugin = Some(plugin);
                p.plugin_opts = (!opts.is_empty()).then_some(opts);
            }
        }
        NodeProtocol::Hysteria2 => {
            p.proxy_type = "hysteria2".to_string();
            p.password = Some(sec.password.clone());
        }
        NodeProtocol::Tuic => {
            p.proxy_type = "tuic".to_string();
            p.uuid = Some(sec.uuid.clone());
            p.password = Some(sec.password.clone());
            p.reduce_rtt = Some(true);
            p.request_timeout = Some(8000);
            p.udp_relay_mode = Some("native".to_string());
        }
    }

    if let Some(transport) = &node.transport {
        apply_transport(&mut p, transport);
    }
    if let Some(tls) = node.tls.as_ref().filter(|t| t.enabled) {
        apply_tls(&mut p, node.protocol, tls);
    }
    p
}

/// mihomo spells simple-obfs as `obfs` with a `{mode, host}` map.
fn ss_plugin(plugin: &str, opts: &str) -> Option<(String, BTreeMap<String, Value>)> {
    let (plugin, opts) = normalize_ss_plugin(plugin, opts);
    if plugin.is_empty() {
        return None;
    }

    let kv = parse_plugin_opts(&opts);
    if plugin == "obfs-local" {
        let mut out = BTreeMap::new();
        if let Some(mode) = kv.get("obfs") {
            out.insert("mode".to_string(), Value::String(mode.clone()));
        }
        if let Some(host) = kv.get("obfs-host") {
            out.insert("host".to_string(), Value::String(host.clone()));
        }
        return Some(("obfs".to_string(), out));
    }

    let out = kv
        .into_iter()
        .map(|(k, v)| {
            let value = if v.is_empty() {
                Value::Bool(true)
            } else {
                Value::String(v)
            };
            (k, value)
        })
        .collect();
    Some((plugin, out))
}

fn apply_transport(p: &mut Proxy, transport: &NodeTransport) {
    let host = trimmed(&transport.host);
    let path = trimmed(&transport.path);
    let extra_headers = transport
        .headers
        .iter()
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), v.clone()));

    match transport.kind.trim() {
        "ws" => {
            p.network = Some("ws".to_string());
            let mut headers: BTreeMap<String, String> = BTreeMap::new();
            if let Some(host) = host {
                headers.insert("Host".to_string(), host);
            }
            headers.extend(extra_headers);
            if path.is_some() || !headers.is_empty() {
                p.ws_opts = Some(WsOpts { path, headers });
            }
        }
        "grpc" => {
            p.network = Some("grpc".to_string());
            if let Some(name) = trimmed(&transport.service_name) {
                p.grpc_opts = Some(BTreeMap::from([("grpc-service-name".to_string(), name)]));
            }
        }
        "h2" => {
            p.network = Some("h2".to_string());
            let opts = H2Opts {
                host: host.into_iter().collect(),
                path,
            };
            if !opts.host.is_empty() || opts.path.is_some() {
                p.h2_opts = Some(opts);
            }
        }
        "http" => {
            p.network = Some("http".to_string());
            let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
            if let Some(host) = host {
                headers.insert("Host".to_string(), vec![host]);
            }
            headers.extend(extra_headers.map(|(k, v)| (k, vec![v])));
            let opts = HttpOpts {
                path: path.into_iter().collect(),
                headers,
            };
            if !opts.path.is_empty() || !opts.headers.is_empty() {
                p.http_opts = Some(opts);
            }
        }
        _ => {}
    }
}

fn apply_tls(p: &mut Proxy, protocol: NodeProtocol, tls: &NodeTls) {
    if let Some(key) = trimmed(&tls.reality_public_key) {
        let mut opts = BTreeMap::from([("public-key".to_string(), key)]);
        if let Some(short_id) = trimmed(&tls.reality_short_id) {
            opts.insert("short-id".to_string(), short_id);
        }
        p.reality_opts = Some(opts);
    }
    p.client_fingerprint = trimmed(&tls.fingerprint);
    if tls.insecure {
        p.skip_cert_verify = Some(true);
    }

    match protocol {
        NodeProtocol::Trojan | NodeProtocol::Hysteria2 | NodeProtocol::Tuic => {
            p.sni = trimmed(&tls.server_name);
        }
        _ => {
            p.tls = Some(true);
            p.servername = trimmed(&tls.server_name);
        }
    }

    if !tls.alpn.is_empty() {
        p.alpn = Some(tls.alpn.clone());
    }
}

fn target(action: &RouteAction, tags: &BTreeMap<String, String>) -> Result<String> {
    match action {
        RouteAction::Direct => Ok(DIRECT.to_string()),
        RouteAction::Block => Ok(REJECT.to_string()),
        RouteAction::Node(id) => tags
            .get(id)
            .cloned()
            .with_context(|| format!("node target not found: {}", id)),
    }
}

fn build_rules(plan: &RuntimePlan, tags: &BTreeMap<String, String>) -> Result<Vec<String>> {
    let compiled = &plan.compiled;
    let mut rules = Vec::with_capacity(compiled.rules.len() * 4 + 5);

    if plan.inbound_mode == InboundMode::Tun {
        rules.extend(
            [
                "PROCESS-NAME,mihomo,DIRECT",
                "PROCESS-NAME,clash,DIRECT",
                "PROCESS-NAME,vea,DIRECT",
                // Browsers prefer QUIC under TUN; force them back to TCP.
                "AND,((NETWORK,UDP),(DST-PORT,443)),REJECT",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }

    for rule in &compiled.rules {
        let target = target(&rule.action, tags).with_context(|| format!("edge {}", rule.edge_id))?;
        lower_match(&rule.matcher, &target, &mut rules)
            .with_context(|| format!("edge {}", rule.edge_id))?;
    }

    let default = target(&compiled.default, tags).context("default")?;
    rules.push(format!("MATCH,{}", default));
    Ok(rules)
}

fn lower_match(matcher: &RouteMatchRule, target: &str, rules: &mut Vec<String>) -> Result<()> {
    for entry in matcher.domains.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
        let (kind, value) = if let Some(tag) = entry.strip_prefix("geosite:") {
            ("GEOSITE", tag)
        } else if entry.starts_with("geoip:") {
            anyhow::bail!("geoip rule must be in ips, not domains: {}", entry);
        } else if let Some(v) = entry.strip_prefix("full:") {
            ("DOMAIN", v)
        } else if let Some(v) = entry.strip_prefix("keyword:") {
            ("DOMAIN-KEYWORD", v)
        } else if let Some(v) = entry.strip_prefix("regexp:") {
            ("DOMAIN-REGEX", v)
        } else {
            ("DOMAIN-SUFFIX", entry.strip_prefix("domain:").unwrap_or(entry))
        };
        let value = value.trim();
        if !value.is_empty() {
            rules.push(format!("{},{},{}", kind, value, target));
        }
    }

    for entry in matcher.ips.iter().map(|i| i.trim()).filter(|i| !i.is_empty()) {
        if let Some(tag) = entry.strip_prefix("geoip:") {
            rules.push(format!("GEOIP,{},{}", tag, target));
            continue;
        }
        if entry.starts_with("geosite:") {
            anyhow::bail!("geosite rule must be in domains, not ips: {}", entry);
        }
        // Unparsable entries pass through; the engine reports them on load.
        let cidr = normalize_cidr(entry);
        let kind = if cidr.contains(':') { "IP-CIDR6" } else { "IP-CIDR" };
        rules.push(format!("{},{},{},no-resolve", kind, cidr, target));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::frouter::ChainProxySettings;
    use crate::domain::node::NodeSecurity;
    use crate::domain::proxy_config::{InboundAuthentication, InboundConfig};
    use crate::domain::{
        FRouter, ProxyEdge, TunSettings, EDGE_BLOCK, EDGE_DIRECT, EDGE_LOCAL, RULE_TYPE_ROUTE,
    };
    use crate::frouter::{compile_measurement_plan, compile_proxy_plan};

    fn ss_node(plugin: &str, opts: &str) -> Node {
        Node {
            id: "n1".to_string(),
            name: "ss".to_string(),
            address: "1.2.3.4".to_string(),
            port: 8388,
            protocol: NodeProtocol::Shadowsocks,
            security: Some(NodeSecurity {
                method: "aes-128-gcm".to_string(),
                password: "pw".to_string(),
                plugin: plugin.to_string(),
                plugin_opts: opts.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn edge(id: &str, to: &str) -> ProxyEdge {
        ProxyEdge {
            id: id.to_string(),
            from: EDGE_LOCAL.to_string(),
            to: to.to_string(),
            enabled: true,
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

    fn render(config: &ProxyConfig, edges: Vec<ProxyEdge>, nodes: &[Node]) -> serde_yaml::Value {
        let plan = compile_proxy_plan(EngineKind::Clash, config, &frouter(edges), nodes).unwrap();
        let bytes = MihomoAdapter
            .build_config(&plan, &BuildContext::default())
            .unwrap();
        serde_yaml::from_slice(&bytes).unwrap()
    }

    fn mixed(port: u16) -> ProxyConfig {
        ProxyConfig {
            inbound_port: port,
            ..Default::default()
        }
    }

    fn rules(cfg: &serde_yaml::Value) -> Vec<String> {
        cfg["rules"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|r| r.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_obfs_alias_uses_native_schema() {
        let nodes = vec![ss_node("obfs", "host=x.com;mode=tls")];
        let cfg = render(&mixed(7890), vec![edge("d", "n1")], &nodes);
        let proxy = &cfg["proxies"][0];
        assert_eq!(proxy["name"].as_str(), Some("node-n1"));
        assert_eq!(proxy["type"].as_str(), Some("ss"));
        assert_eq!(proxy["plugin"].as_str(), Some("obfs"));
        assert_eq!(proxy["plugin-opts"]["mode"].as_str(), Some("tls"));
        assert_eq!(proxy["plugin-opts"]["host"].as_str(), Some("x.com"));
    }

    #[test]
    fn test_other_plugin_bare_key_is_true() {
        let (plugin, opts) = ss_plugin("v2ray-plugin", "mode=websocket;tls").unwrap();
        assert_eq!(plugin, "v2ray-plugin");
        assert_eq!(opts["mode"], Value::String("websocket".to_string()));
        assert_eq!(opts["tls"], Value::Bool(true));
        assert!(ss_plugin("", "mode=tls").is_none());
    }

    #[test]
    fn test_mixed_inbound_and_allow_lan() {
        let config = ProxyConfig {
            inbound_port: 7890,
            inbound_config: Some(InboundConfig {
                listen: "127.0.0.1".to_string(),
                allow_lan: true,
                authentication: Some(InboundAuthentication {
                    username: "u".to_string(),
                    password: "p".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = render(&config, vec![edge("d", EDGE_DIRECT)], &[]);
        assert_eq!(cfg["mixed-port"].as_u64(), Some(7890));
        assert!(cfg.get("socks-port").is_none());
        assert!(cfg.get("port").is_none());
        assert_eq!(cfg["bind-address"].as_str(), Some("0.0.0.0"));
        assert_eq!(cfg["allow-lan"].as_bool(), Some(true));
        assert_eq!(cfg["authentication"][0].as_str(), Some("u:p"));
        assert!(cfg.get("dns").is_none());
        assert!(cfg.get("tun").is_none());
        assert_eq!(rules(&cfg), vec!["MATCH,DIRECT"]);
    }

    #[test]
    fn test_strict_route_requires_exclusions() {
        let mut config = ProxyConfig {
            inbound_mode: InboundMode::Tun,
            tun_settings: Some(TunSettings::with_defaults()),
            ..Default::default()
        };
        let cfg = render(&config, vec![edge("d", EDGE_DIRECT)], &[]);
        assert!(cfg["tun"].get("strict-route").is_none());
        assert_eq!(cfg["tun"]["inet4-address"][0].as_str(), Some("198.18.0.1/30"));
        assert_eq!(cfg["tun"]["dns-hijack"][0].as_str(), Some("any:53"));
        assert_eq!(cfg["dns"]["enhanced-mode"].as_str(), Some("fake-ip"));
        assert_eq!(cfg["dns"]["listen"].as_str(), Some("0.0.0.0:1053"));
        assert_eq!(cfg["sniffer"]["enable"].as_bool(), Some(true));

        config.tun_settings.as_mut().unwrap().route_exclude_address =
            vec!["192.168.0.0/16".to_string()];
        let cfg = render(&config, vec![edge("d", EDGE_DIRECT)], &[]);
        assert_eq!(cfg["tun"]["strict-route"].as_bool(), Some(true));
    }

    #[test]
    fn test_tun_rules_prefix_and_match() {
        let config = ProxyConfig {
            inbound_mode: InboundMode::Tun,
            tun_settings: Some(TunSettings::with_defaults()),
            ..Default::default()
        };
        let cfg = render(&config, vec![edge("d", EDGE_BLOCK)], &[]);
        let got = rules(&cfg);
        assert_eq!(got[0], "PROCESS-NAME,mihomo,DIRECT");
        assert_eq!(got[3], "AND,((NETWORK,UDP),(DST-PORT,443)),REJECT");
        assert_eq!(got.last().map(String::as_str), Some("MATCH,REJECT"));
    }

    #[test]
    fn test_route_rules_lowered() {
        let nodes = vec![ss_node("", "")];
        let rule = ProxyEdge {
            priority: 5,
            rule_type: RULE_TYPE_ROUTE.to_string(),
            route_rule: Some(RouteMatchRule {
                domains: vec![
                    "geosite:cn".to_string(),
                    "full:a.com".to_string(),
                    "keyword:ads".to_string(),
                    "b.com".to_string(),
                ],
                ips: vec![
                    "geoip:cn".to_string(),
                    "10.0.0.1".to_string(),
                    "fd00::/8".to_string(),
                ],
            }),
            ..edge("r", EDGE_DIRECT)
        };
        let cfg = render(&mixed(7890), vec![edge("d", "n1"), rule], &nodes);
        assert_eq!(
            rules(&cfg),
            vec![
                "GEOSITE,cn,DIRECT",
                "DOMAIN,a.com,DIRECT",
                "DOMAIN-KEYWORD,ads,DIRECT",
                "DOMAIN-SUFFIX,b.com,DIRECT",
                "GEOIP,cn,DIRECT",
                "IP-CIDR,10.0.0.1/32,DIRECT,no-resolve",
                "IP-CIDR6,fd00::/8,DIRECT,no-resolve",
                "MATCH,node-n1",
            ]
        );
    }

    #[test]
    fn test_unparsable_ip_is_kept() {
        let nodes = vec![ss_node("", "")];
        let rule = ProxyEdge {
            priority: 5,
            rule_type: RULE_TYPE_ROUTE.to_string(),
            route_rule: Some(RouteMatchRule {
                ips: vec!["10.0.0.300".to_string(), "fd00::1".to_string()],
                ..Default::default()
            }),
            ..edge("r", EDGE_DIRECT)
        };
        let cfg = render(&mixed(7890), vec![edge("d", "n1"), rule], &nodes);
        assert_eq!(
            rules(&cfg),
            vec![
                "IP-CIDR,10.0.0.300,DIRECT,no-resolve",
                "IP-CIDR6,fd00::1/128,DIRECT,no-resolve",
                "MATCH,node-n1",
            ]
        );
    }

    #[test]
    fn test_detour_uses_dialer_proxy() {
        let mut upstream = ss_node("", "");
        upstream.id = "up".to_string();
        let nodes = vec![ss_node("", ""), upstream];
        let mut default = edge("d", "n1");
        default.via = vec!["up".to_string()];
        let cfg = render(&mixed(7890), vec![default], &nodes);
        let proxies = cfg["proxies"].as_sequence().unwrap();
        let child = proxies.iter().find(|p| p["name"].as_str() == Some("node-n1")).unwrap();
        assert_eq!(child["dialer-proxy"].as_str(), Some("node-up"));
    }

    #[test]
    fn test_tls_fields_by_protocol() {
        let mut node = ss_node("", "");
        node.protocol = NodeProtocol::Vless;
        node.transport = Some(NodeTransport {
            kind: "ws".to_string(),
            host: "cdn.example.com".to_string(),
            path: "/ws".to_string(),
            ..Default::default()
        });
        node.tls = Some(NodeTls {
            enabled: true,
            server_name: "sni.example.com".to_string(),
            reality_public_key: "pk".to_string(),
            fingerprint: "chrome".to_string(),
            ..Default::default()
        });
        let p = node_proxy(&node, "node-n1");
        assert_eq!(p.network.as_deref(), Some("ws"));
        assert_eq!(p.tls, Some(true));
        assert_eq!(p.servername.as_deref(), Some("sni.example.com"));
        assert!(p.sni.is_none());
        assert_eq!(p.reality_opts.as_ref().unwrap()["public-key"], "pk");
        assert_eq!(p.ws_opts.as_ref().unwrap().headers["Host"], "cdn.example.com");

        node.protocol = NodeProtocol::Trojan;
        let p = node_proxy(&node, "node-n1");
        assert_eq!(p.sni.as_deref(), Some("sni.example.com"));
        assert!(p.tls.is_none());
    }

    #[test]
    fn test_measurement_uses_socks_port() {
        let nodes = vec![ss_node("", "")];
        let plan = compile_measurement_plan(EngineKind::Clash, 40002, &frouter(vec![edge("d", "n1")]), &nodes)
            .unwrap();
        let bytes = MihomoAdapter
            .build_config(&plan, &BuildContext::default())
            .unwrap();
        let cfg: serde_yaml::Value = serde_yaml::from_slice(&bytes).unwrap();
        assert_eq!(cfg["socks-port"].as_u64(), Some(40002));
        assert_eq!(cfg["bind-address"].as_str(), Some("127.0.0.1"));
        assert_eq!(cfg["log-level"].as_str(), Some("info"));
    }

    #[test]
    fn test_log_level_mapping_and_args() {
        assert_eq!(map_log_level("WARN"), "warning");
        assert_eq!(map_log_level("none"), "silent");
        assert_eq!(map_log_level(""), "info");
        let args = MihomoAdapter.command_args(Path::new("/w/config.yaml"), Path::new("/w"));
        assert_eq!(args, vec!["-d", "/w", "-f", "/w/config.yaml"]);
    }
}
