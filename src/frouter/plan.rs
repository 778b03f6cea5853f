use chrono::{DateTime, Utc};
use std::fmt::Write as _;

use super::compiler::{active_node_ids, compile, CompiledFRouter};
use crate::domain::{
    filter_nodes_by_id, CompileError, EngineKind, FRouter, InboundMode, Node, ProxyConfig,
};

/// Why a plan was compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Proxy,
    Measurement,
}

impl Purpose {
    pub fn as_str(&self) -> &str {
        match self {
            Purpose::Proxy => "proxy",
            Purpose::Measurement => "measurement",
        }
    }
}

/// Everything a config builder needs for one engine run
#[derive(Debug, Clone)]
pub struct RuntimePlan {
    pub purpose: Purpose,
    pub engine: EngineKind,
    pub proxy_config: ProxyConfig,
    pub frouter_id: String,
    pub frouter_name: String,
    /// Active nodes only
    pub nodes: Vec<Node>,
    pub compiled: CompiledFRouter,
    pub inbound_mode: InboundMode,
    pub inbound_port: u16,
    pub created_at: DateTime<Utc>,
}

/// Compile the plan for the long-lived proxy engine.
pub fn compile_proxy_plan(
    engine: EngineKind,
    config: &ProxyConfig,
    frouter: &FRouter,
    nodes: &[Node],
) -> Result<RuntimePlan, CompileError> {
    let compiled = compile(frouter, nodes)?;
    let active = active_node_ids(&compiled);
    Ok(RuntimePlan {
        purpose: Purpose::Proxy,
        engine,
        proxy_config: config.clone(),
        frouter_id: frouter.id.clone(),
        frouter_name: frouter.name.clone(),
        nodes: filter_nodes_by_id(nodes, &active),
        compiled,
        inbound_mode: config.inbound_mode,
        inbound_port: config.inbound_port,
        created_at: Utc::now(),
    })
}

/// Compile a throwaway plan that exposes a SOCKS inbound on `port`.
pub fn compile_measurement_plan(
    engine: EngineKind,
    port: u16,
    frouter: &FRouter,
    nodes: &[Node],
) -> Result<RuntimePlan, CompileError> {
    let compiled = compile(frouter, nodes)?;
    let active = active_node_ids(&compiled);
    Ok(RuntimePlan {
        purpose: Purpose::Measurement,
        engine,
        proxy_config: ProxyConfig::default(),
        frouter_id: frouter.id.clone(),
        frouter_name: frouter.name.clone(),
        nodes: filter_nodes_by_id(nodes, &active),
        compiled,
        inbound_mode: InboundMode::Socks,
        inbound_port: port,
        created_at: Utc::now(),
    })
}

impl RuntimePlan {
    /// Support summary written next to the engine config. Never contains secrets.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "purpose={}", self.purpose.as_str());
        let _ = writeln!(out, "engine={}", self.engine);
        if !self.frouter_id.is_empty() {
            let _ = writeln!(out, "frouter={}", self.frouter_id);
        }
        if !self.frouter_name.is_empty() {
            let _ = writeln!(out, "frouterName={}", self.frouter_name);
        }
        let _ = writeln!(out, "inboundMode={}", self.inbound_mode.as_str());
        if self.inbound_port > 0 {
            let _ = writeln!(out, "inboundPort={}", self.inbound_port);
        }
        let _ = writeln!(out, "nodes={}", self.nodes.len());
        let _ = writeln!(out, "routeRules={}", self.compiled.rules.len());
        let _ = writeln!(out, "detours={}", self.compiled.detour_upstream.len());
        let _ = writeln!(out, "warnings={}", self.compiled.warnings.len());
        let _ = writeln!(out, "default={}", self.compiled.default);
        let _ = writeln!(out, "generatedAt={}", self.created_at.to_rfc3339());
        for warning in &self.compiled.warnings {
            let _ = writeln!(out, "warning: {}", warning);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::frouter::ChainProxySettings;
    use crate::domain::{NodeProtocol, ProxyEdge, EDGE_LOCAL};

    fn fixture() -> (FRouter, Vec<Node>) {
        let nodes = vec![
            Node {
                id: "n1".to_string(),
                name: "one".to_string(),
                protocol: NodeProtocol::Trojan,
                ..Default::default()
            },
            Node {
                id: "n2".to_string(),
                name: "two".to_string(),
                ..Default::default()
            },
        ];
        let mut edge = ProxyEdge {
            id: "default".to_string(),
            from: EDGE_LOCAL.to_string(),
            to: "n1".to_string(),
            enabled: true,
            priority: 3,
            ..Default::default()
        };
        edge.description = "main".to_string();
        let frouter = FRouter {
            id: "fr-1".to_string(),
            name: "home".to_string(),
            chain_proxy: ChainProxySettings {
                edges: vec![edge],
                ..Default::default()
            },
            ..Default::default()
        };
        (frouter, nodes)
    }

    #[test]
    fn test_proxy_plan_keeps_only_active_nodes() {
        let (frouter, nodes) = fixture();
        let config = ProxyConfig {
            inbound_port: 7890,
            ..Default::default()
        };
        let plan = compile_proxy_plan(EngineKind::SingBox, &config, &frouter, &nodes).unwrap();
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].id, "n1");
        assert_eq!(plan.inbound_port, 7890);
        assert_eq!(plan.compiled.default.node_id(), Some("n1"));
    }

    #[test]
    fn test_measurement_plan_forces_socks() {
        let (frouter, nodes) = fixture();
        let plan = compile_measurement_plan(EngineKind::Clash, 40123, &frouter, &nodes).unwrap();
        assert_eq!(plan.purpose, Purpose::Measurement);
        assert_eq!(plan.inbound_mode, InboundMode::Socks);
        assert_eq!(plan.inbound_port, 40123);
    }

    #[test]
    fn test_explain_lists_summary_and_warnings() {
        let (frouter, nodes) = fixture();
        let plan =
            compile_proxy_plan(EngineKind::SingBox, &ProxyConfig::default(), &frouter, &nodes)
                .unwrap();
        let text = plan.explain();
        assert!(text.contains("purpose=proxy\n"));
        assert!(text.contains("engine=singbox\n"));
        assert!(text.contains("frouter=fr-1\n"));
        assert!(text.contains("frouterName=home\n"));
        assert!(text.contains(&format!("generatedAt={}\n", plan.created_at.to_rfc3339())));
        assert!(text.contains("default=node:n1\n"));
        assert!(text.contains("warnings=1\n"));
        assert!(text.contains("warning: edge default is default; priority forced to 0"));
    }
}
