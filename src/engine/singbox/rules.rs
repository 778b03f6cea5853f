use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::domain::RouteMatchRule;

/// `route.rule_set` declaration pointing at a local `.srs` file
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleSetEntry {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
    pub path: String,
}

/// `<artifacts>/core/sing-box/rule-set`
pub fn rule_set_dir(artifacts_dir: &Path) -> PathBuf {
    artifacts_dir.join("core").join("sing-box").join("rule-set")
}

/// Collects the rule-sets referenced while lowering route rules.
#[derive(Debug, Clone)]
pub struct RuleSets {
    dir: PathBuf,
    entries: BTreeMap<String, RuleSetEntry>,
}

impl RuleSets {
    pub fn new(artifacts_dir: &Path) -> Self {
        Self {
            dir: rule_set_dir(artifacts_dir),
            entries: BTreeMap::new(),
        }
    }

    pub fn add_geosite(&mut self, name: &str) -> String {
        self.add(format!("geosite-{}", name))
    }

    pub fn add_geoip(&mut self, name: &str) -> String {
        self.add(format!("geoip-{}", name))
    }

    fn add(&mut self, tag: String) -> String {
        let dir = &self.dir;
        self.entries.entry(tag.clone()).or_insert_with(|| RuleSetEntry {
            tag: tag.clone(),
            kind: "local".to_string(),
            format: "binary".to_string(),
            path: dir.join(format!("{}.srs", tag)).to_string_lossy().into_owned(),
        });
        tag
    }

    /// Declarations sorted by tag
    pub fn entries(&self) -> Vec<RuleSetEntry> {
        self.entries.values().cloned().collect()
    }

    /// Lower one route match into a sing-box route rule sending traffic to `outbound`.
    pub fn convert(&mut self, matcher: &RouteMatchRule, outbound: &str) -> Result<Value> {
        let mut rule_set = Vec::new();
        let mut domain = Vec::new();
        let mut domain_suffix = Vec::new();
        let mut domain_keyword = Vec::new();
        let mut domain_regex = Vec::new();
        let mut ip_cidr = Vec::new();
        let mut ip_is_private = false;

        for entry in matcher.domains.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
            if let Some(tag) = entry.strip_prefix("geosite:") {
                rule_set.push(self.add_geosite(tag));
            } else if entry.starts_with("geoip:") {
                anyhow::bail!("geoip rule must be in ips, not domains: {}", entry);
            } else if let Some(v) = entry.strip_prefix("full:") {
                domain.push(v.to_string());
            } else if let Some(v) = entry.strip_prefix("keyword:") {
                domain_keyword.push(v.to_string());
            } else if let Some(v) = entry.strip_prefix("regexp:") {
                domain_regex.push(v.to_string());
            } else {
                let v = entry.strip_prefix("domain:").unwrap_or(entry);
                domain_suffix.push(v.to_string());
            }
        }

        for entry in matcher.ips.iter().map(|i| i.trim()).filter(|i| !i.is_empty()) {
            match entry.strip_prefix("geoip:") {
                Some("private") => ip_is_private = true,
                Some(tag) => rule_set.push(self.add_geoip(tag)),
                None if entry.starts_with("geosite:") => {
                    anyhow::bail!("geosite rule must be in domains, not ips: {}", entry);
                }
                None => ip_cidr.push(normalize_cidr(entry)),
            }
        }

        let mut rule = Map::new();
        let lists = [
            ("rule_set", rule_set),
            ("domain", domain),
            ("domain_suffix", domain_suffix),
            ("domain_keyword", domain_keyword),
            ("domain_regex", domain_regex),
            ("ip_cidr", ip_cidr),
        ];
        for (key, values) in lists {
            if !values.is_empty() {
                rule.insert(key.to_string(), json!(values));
            }
        }
        if ip_is_private {
            rule.insert("ip_is_private".to_string(), Value::Bool(true));
        }
        rule.insert("outbound".to_string(), json!(outbound));
        Ok(Value::Object(rule))
    }
}

/// Append `/32` or `/128` to a bare address; anything else is returned as given.
pub fn normalize_cidr(entry: &str) -> String {
    if entry.contains('/') {
        return entry.to_string();
    }
    match entry.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => format!("{}/32", entry),
        Ok(IpAddr::V6(_)) => format!("{}/128", entry),
        Err(_) => entry.to_string(),
    }
}
