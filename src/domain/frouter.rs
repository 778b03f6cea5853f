use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Edge endpoint standing for the host itself
pub const EDGE_LOCAL: &str = "local";
pub const EDGE_DIRECT: &str = "direct";
pub const EDGE_BLOCK: &str = "block";
pub const SLOT_PREFIX: &str = "slot-";

/// Edge rule types; anything else is rejected by the compiler.
pub const RULE_TYPE_NONE: &str = "";
pub const RULE_TYPE_ROUTE: &str = "route";

pub fn is_slot_id(id: &str) -> bool {
    id.len() > SLOT_PREFIX.len() && id.starts_with(SLOT_PREFIX)
}

/// Domain / IP match attached to a route edge
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RouteMatchRule {
    pub domains: Vec<String>,
    pub ips: Vec<String>,
}

impl RouteMatchRule {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.ips.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    pub via: Vec<String>,
    pub tag: String,
    pub priority: i32,
    pub enabled: bool,
    pub rule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_rule: Option<RouteMatchRule>,
    pub description: String,
}

/// Late-binding placeholder for a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SlotNode {
    pub id: String,
    pub name: String,
    pub bound_node_id: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ChainProxySettings {
    pub edges: Vec<ProxyEdge>,
    pub positions: BTreeMap<String, GraphPosition>,
    pub slots: Vec<SlotNode>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Named routing graph for the host's outbound traffic
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FRouter {
    pub id: String,
    pub name: String,
    pub chain_proxy: ChainProxySettings,
    pub tags: Vec<String>,
    pub source_config_id: String,
    pub last_latency_ms: i64,
    pub last_latency_at: Option<DateTime<Utc>>,
    pub last_latency_error: String,
    pub last_speed_mbps: f64,
    pub last_speed_at: Option<DateTime<Utc>>,
    pub last_speed_error: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FRouter {
    /// Single `local -> node` default edge, used to probe one node in isolation.
    pub fn synthetic_for_node(node_id: &str, node_name: &str) -> Self {
        FRouter {
            id: format!("probe-{}", node_id),
            name: node_name.to_string(),
            chain_proxy: ChainProxySettings {
                edges: vec![ProxyEdge {
                    id: "default".to_string(),
                    from: EDGE_LOCAL.to_string(),
                    to: node_id.to_string(),
                    enabled: true,
                    ..Default::default()
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
