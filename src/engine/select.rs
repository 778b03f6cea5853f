use super::{AdapterRegistry, EngineAdapter};
use crate::domain::{
    filter_nodes_by_id, CoreComponent, EngineKind, FRouter, InboundMode, Node, NodeProtocol,
    PreferredEngine, VeaError, VeaResult,
};
use crate::frouter::{active_node_ids, compile};
use crate::repository::ComponentRepository;

/// Outcome of engine selection
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSelection {
    pub engine: EngineKind,
    /// `None` when the engine fits but is not installed yet
    pub component: Option<CoreComponent>,
}

/// Pick the engine that will run `frouter`.
///
/// An explicit `preferred` engine must support every active node; otherwise
/// candidates are tried in order: settings default, recommendation, sing-box,
/// mihomo. Installed candidates win over merely compatible ones.
pub fn select_engine(
    inbound_mode: InboundMode,
    frouter: &FRouter,
    nodes: &[Node],
    preferred: PreferredEngine,
    default_engine: PreferredEngine,
    components: &dyn ComponentRepository,
    adapters: &AdapterRegistry,
) -> VeaResult<EngineSelection> {
    let compiled = compile(frouter, nodes)?;
    let active = filter_nodes_by_id(nodes, &active_node_ids(&compiled));

    if let Some(engine) = preferred.engine() {
        let adapter = adapters
            .get(&engine)
            .ok_or_else(|| VeaError::invalid(format!("engine {} is not available", engine)))?;
        if !adapter.supports_inbound(inbound_mode) {
            return Err(VeaError::invalid(format!(
                "engine {} does not support inbound mode {}",
                engine,
                inbound_mode.as_str()
            )));
        }
        if let Some(node) = active.iter().find(|n| !supports_node(adapter.as_ref(), n)) {
            return Err(VeaError::invalid(format!(
                "engine {} does not support node {} ({})",
                engine,
                node.name,
                node.protocol.as_str()
            )));
        }
        return Ok(EngineSelection {
            engine,
            component: installed_component(components, engine),
        });
    }

    let mut candidates: Vec<EngineKind> = Vec::with_capacity(4);
    let heuristic = [
        default_engine.engine(),
        Some(recommend_engine(&active, default_engine)),
        Some(EngineKind::SingBox),
        Some(EngineKind::Clash),
    ];
    for engine in heuristic.into_iter().flatten() {
        if !candidates.contains(&engine) {
            candidates.push(engine);
        }
    }

    let mut fallback = None;
    for engine in candidates {
        let adapter = match adapters.get(&engine) {
            Some(adapter) => adapter,
            None => continue,
        };
        if !adapter.supports_inbound(inbound_mode)
            || !active.iter().all(|n| supports_node(adapter.as_ref(), n))
        {
            continue;
        }
        if let Some(component) = installed_component(components, engine) {
            return Ok(EngineSelection {
                engine,
                component: Some(component),
            });
        }
        fallback.get_or_insert(engine);
    }

    match fallback {
        Some(engine) => Ok(EngineSelection {
            engine,
            component: None,
        }),
        None => Err(VeaError::invalid("no engine supports frouter nodes")),
    }
}

/// Whether `adapter` can carry `node`.
pub fn supports_node(adapter: &dyn EngineAdapter, node: &Node) -> bool {
    adapter.supports_protocol(node.protocol) && (!node.has_ss_plugin() || adapter.supports_ss_plugin())
}

/// Heuristic choice used when the operator did not pin an engine.
pub fn recommend_engine(nodes: &[Node], preferred: PreferredEngine) -> EngineKind {
    if nodes.is_empty() {
        return EngineKind::SingBox;
    }
    let needs_singbox = nodes.iter().any(|n| {
        matches!(n.protocol, NodeProtocol::Hysteria2 | NodeProtocol::Tuic) || n.has_ss_plugin()
    });
    if needs_singbox {
        return EngineKind::SingBox;
    }
    preferred.engine().unwrap_or(EngineKind::SingBox)
}

fn installed_component(
    components: &dyn ComponentRepository,
    engine: EngineKind,
) -> Option<CoreComponent> {
    components
        .get_by_kind(engine.into())
        .ok()
        .filter(|c| c.is_installed())
}
