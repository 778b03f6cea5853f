pub mod mihomo;
pub mod plugin_opts;
pub mod process;
pub mod select;
pub mod singbox;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{CoreComponent, EngineKind, InboundMode, Node, NodeProtocol, VeaError, VeaResult};
use crate::frouter::RuntimePlan;

use mihomo::MihomoAdapter;
pub use process::{EngineProcess, ProcessSpec};
pub use select::{select_engine, EngineSelection};
use singbox::SingBoxAdapter;

/// Host facts a config builder needs besides the plan
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub artifacts_dir: PathBuf,
    /// Physical egress interface; `direct` binds to it so TUN does not loop.
    pub default_interface: Option<String>,
}

impl BuildContext {
    pub fn detect(artifacts_dir: &Path) -> Self {
        Self {
            artifacts_dir: artifacts_dir.to_path_buf(),
            default_interface: default_interface(),
        }
    }
}

/// Per-engine config lowering and launch details
pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Candidate binary file names, in lookup order
    fn binary_names(&self) -> &'static [&'static str];

    fn supported_protocols(&self) -> &'static [NodeProtocol];

    fn supports_protocol(&self, protocol: NodeProtocol) -> bool {
        self.supported_protocols().contains(&protocol)
    }

    fn supports_inbound(&self, mode: InboundMode) -> bool;

    /// Whether shadowsocks SIP003 plugins can be expressed in this engine's config
    fn supports_ss_plugin(&self) -> bool;

    /// Render the native config document for `plan`.
    fn build_config(&self, plan: &RuntimePlan, ctx: &BuildContext) -> Result<Vec<u8>>;

    /// `config.json` or `config.yaml`
    fn config_file_name(&self) -> &'static str;

    fn command_args(&self, config_path: &Path, work_dir: &Path) -> Vec<String>;

    fn ready_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Registered adapters keyed by engine
pub type AdapterRegistry = BTreeMap<EngineKind, Arc<dyn EngineAdapter>>;

pub fn default_adapters() -> AdapterRegistry {
    let mut adapters: AdapterRegistry = BTreeMap::new();
    adapters.insert(EngineKind::SingBox, Arc::new(SingBoxAdapter));
    adapters.insert(EngineKind::Clash, Arc::new(MihomoAdapter));
    adapters
}

/// Protocols both engines speak
pub(crate) const ALL_PROTOCOLS: &[NodeProtocol] = &[
    NodeProtocol::Vless,
    NodeProtocol::Vmess,
    NodeProtocol::Trojan,
    NodeProtocol::Shadowsocks,
    NodeProtocol::Hysteria2,
    NodeProtocol::Tuic,
];

/// First 8 characters of an id, used in outbound tags.
pub fn shorten_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// sing-box outbound tag / mihomo proxy name for a node
pub fn node_tag(node_id: &str) -> String {
    format!("node-{}", shorten_id(node_id))
}

/// Map node id -> tag for the plan's nodes.
pub(crate) fn node_tags(nodes: &[Node]) -> BTreeMap<String, String> {
    nodes
        .iter()
        .map(|n| (n.id.clone(), node_tag(&n.id)))
        .collect()
}

/// Find one of `names` in `dir` or in one of its direct subdirectories.
pub fn find_binary_in_dir(dir: &Path, names: &[&str]) -> Result<PathBuf> {
    if dir.as_os_str().is_empty() {
        anyhow::bail!("install dir is empty");
    }

    for name in names {
        let path = dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }

    let entries = std::fs::read_dir(dir).map_err(|e| {
        anyhow::anyhow!(
            "binary not found in {} (candidates: {:?}): {}",
            dir.display(),
            names,
            e
        )
    })?;

    let mut subdirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    subdirs.sort();

    for sub in subdirs {
        for name in names {
            let path = sub.join(name);
            if path.is_file() {
                return Ok(path);
            }
        }
    }

    anyhow::bail!("binary not found in {} (candidates: {:?})", dir.display(), names)
}

/// Binary to launch for `adapter`: the recorded path when it still exists, else a directory search.
pub fn resolve_binary(
    adapter: &dyn EngineAdapter,
    component: Option<&CoreComponent>,
) -> VeaResult<PathBuf> {
    let not_installed = |cause: String| VeaError::EngineNotInstalled {
        engine: adapter.kind().to_string(),
        cause,
    };
    let component =
        component.ok_or_else(|| not_installed("component is not installed".to_string()))?;

    if let Some(path) = component.binary_path().map(PathBuf::from) {
        if path.is_file() {
            return Ok(path);
        }
    }
    find_binary_in_dir(Path::new(component.install_dir.trim()), adapter.binary_names())
        .map_err(|e| not_installed(e.to_string()))
}

/// Physical default-route interface on Linux; `None` elsewhere.
pub fn default_interface() -> Option<String> {
    if !cfg!(target_os = "linux") {
        return None;
    }

    // Reading the main table first avoids picking up tun0 once TUN policy routing is active.
    let candidates: [&[&str]; 2] = [
        &["route", "show", "default", "table", "main"],
        &["route", "get", "8.8.8.8"],
    ];

    for args in candidates {
        let output = match std::process::Command::new("ip").args(args).output() {
            Ok(out) if out.status.success() => out,
            _ => continue,
        };
        if let Some(iface) = parse_route_device(&String::from_utf8_lossy(&output.stdout)) {
            return Some(iface);
        }
    }
    None
}

fn parse_route_device(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok != "dev" {
            continue;
        }
        let iface = tokens.next()?.trim();
        if iface.is_empty()
            || iface == "lo"
            || iface.starts_with("tun")
            || iface.starts_with("tap")
        {
            return None;
        }
        return Some(iface.to_string());
    }
    None
}
