use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::proxy_config::EngineKind;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    #[serde(alias = "sing-box")]
    Singbox,
    #[serde(alias = "mihomo")]
    Clash,
    Geo,
    #[default]
    Generic,
}

impl ComponentKind {
    pub fn as_str(&self) -> &str {
        match self {
            ComponentKind::Singbox => "singbox",
            ComponentKind::Clash => "clash",
            ComponentKind::Geo => "geo",
            ComponentKind::Generic => "generic",
        }
    }
}

impl From<EngineKind> for ComponentKind {
    fn from(kind: EngineKind) -> Self {
        match kind {
            EngineKind::SingBox => ComponentKind::Singbox,
            EngineKind::Clash => ComponentKind::Clash,
        }
    }
}

/// Installed engine binary or data bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreComponent {
    pub id: String,
    pub name: String,
    pub kind: ComponentKind,
    pub install_dir: String,
    pub last_version: String,
    pub checksum: String,
    pub last_installed_at: Option<DateTime<Utc>>,
    /// Free-form attributes; `binary` holds the discovered binary path.
    pub meta: BTreeMap<String, String>,
}

impl CoreComponent {
    pub fn is_installed(&self) -> bool {
        !self.install_dir.trim().is_empty() && self.last_installed_at.is_some()
    }

    pub fn binary_path(&self) -> Option<&str> {
        self.meta
            .get("binary")
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}
