use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::domain::{
    is_slot_id, CompileError, FRouter, Node, ProxyEdge, RouteMatchRule, SlotNode, EDGE_BLOCK,
    EDGE_DIRECT, EDGE_LOCAL, RULE_TYPE_NONE, RULE_TYPE_ROUTE, SLOT_PREFIX,
};

/// What matched traffic does
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteAction {
    Node(String),
    Direct,
    Block,
}

impl RouteAction {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            RouteAction::Node(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteAction::Node(id) => write!(f, "node:{}", id),
            RouteAction::Direct => f.write_str(EDGE_DIRECT),
            RouteAction::Block => f.write_str(EDGE_BLOCK),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    pub edge_id: String,
    pub priority: i32,
    pub matcher: RouteMatchRule,
    pub action: RouteAction,
}

/// Engine-neutral route plan produced by [`compile`]
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFRouter {
    /// Sorted by priority descending, then edge id
    pub rules: Vec<RouteRule>,
    pub default: RouteAction,
    /// child node id -> upstream node id
    pub detour_upstream: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

/// Validate `frouter` against `nodes` and lower it into a [`CompiledFRouter`].
///
/// Every violated invariant is collected; the error carries the full list.
pub fn compile(frouter: &FRouter, nodes: &[Node]) -> Result<CompiledFRouter, CompileError> {
    let mut ctx = Compiler::default();

    for node in nodes {
        let id = node.id.trim();
        if id.is_empty() {
            ctx.problems.push("node has empty id".to_string());
            continue;
        }
        if ctx.nodes.contains_key(id) {
            ctx.problems.push(format!("duplicate node id: {}", id));
            continue;
        }
        ctx.nodes.insert(id.to_string(), node);
    }

    ctx.bind_slots(&frouter.chain_proxy.slots);

    for edge in &frouter.chain_proxy.edges {
        if edge.enabled {
            ctx.visit_edge(edge);
        }
    }

    let Compiler {
        mut problems,
        warnings,
        mut rules,
        default,
        detours,
        ..
    } = ctx;

    if default.is_none() {
        problems.push(
            "missing default edge: require exactly one local -> {node|direct|block} without match (or routeRule empty)"
                .to_string(),
        );
    }

    for rule in &rules {
        if rule.matcher.is_empty() {
            problems.push(format!(
                "edge {}: empty routeRule is not allowed on non-default edge",
                rule.edge_id
            ));
        }
    }

    problems.extend(detour_cycles(&detours));

    match default {
        Some(default) if problems.is_empty() => {
            rules.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.edge_id.cmp(&b.edge_id))
            });
            Ok(CompiledFRouter {
                rules,
                default,
                detour_upstream: detours,
                warnings,
            })
        }
        _ => Err(CompileError::new(problems)),
    }
}

/// Whether `edge` is the match-all `local` selection edge.
///
/// Graph saves force the priority of such edges to 0.
pub fn is_default_selection_edge(edge: &ProxyEdge) -> Result<bool, String> {
    if edge.from != EDGE_LOCAL {
        return Ok(false);
    }
    classify_selection_edge(edge)
}

/// Force priority 0 on enabled default selection edges before a graph save.
pub fn normalize_default_priorities(edges: &mut [ProxyEdge]) {
    for edge in edges.iter_mut().filter(|e| e.enabled) {
        if let Ok(true) = is_default_selection_edge(edge) {
            edge.priority = 0;
        }
    }
}

#[derive(Default)]
struct Compiler<'a> {
    nodes: HashMap<String, &'a Node>,
    slots: HashMap<String, String>,
    problems: Vec<String>,
    warnings: Vec<String>,
    rules: Vec<RouteRule>,
    default: Option<RouteAction>,
    detours: BTreeMap<String, String>,
}

impl<'a> Compiler<'a> {
    fn bind_slots(&mut self, slots: &[SlotNode]) {
        for slot in slots {
            let id = slot.id.trim();
            if id.is_empty() {
                self.problems.push("slot has empty id".to_string());
                continue;
            }
            if !is_slot_id(id) {
                self.problems
                    .push(format!("slot {}: id must start with {}", id, SLOT_PREFIX));
                continue;
            }
            if self.slots.contains_key(id) {
                self.problems.push(format!("slot {}: duplicated", id));
                continue;
            }
            let bound = slot.bound_node_id.trim();
            if is_slot_id(bound) {
                self.problems
                    .push(format!("slot {}: boundNodeId must not be a slot: {}", id, bound));
            } else if !bound.is_empty() && !self.nodes.contains_key(bound) {
                self.problems
                    .push(format!("slot {}: boundNodeId not found: {}", id, bound));
            }
            self.slots.insert(id.to_string(), bound.to_string());
        }
    }

    /// Resolve a slot reference. `Err` carries the passthrough reason for unbound slots.
    fn resolve(&self, id: &str) -> Result<String, String> {
        if !is_slot_id(id) {
            return Ok(id.to_string());
        }
        match self.slots.get(id) {
            Some(bound) if !bound.is_empty() && !is_slot_id(bound) => Ok(bound.clone()),
            _ => Err(format!("slot {} is unbound (passthrough)", id)),
        }
    }

    fn visit_edge(&mut self, edge: &ProxyEdge) {
        let (from, to) = match (self.resolve(&edge.from), self.resolve(&edge.to)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(reason), _) | (_, Err(reason)) => {
                self.warnings
                    .push(format!("edge {} skipped: {}", edge.id, reason));
                return;
            }
        };

        if from.trim().is_empty() {
            self.problems.push(format!("edge {} has empty from", edge.id));
            return;
        }
        if to.trim().is_empty() {
            self.problems.push(format!("edge {} has empty to", edge.id));
            return;
        }
        if from == to {
            self.problems
                .push(format!("edge {} is self-loop: {}", edge.id, from));
            return;
        }

        if from == EDGE_LOCAL {
            self.visit_selection_edge(edge, &to);
        } else {
            self.visit_detour_edge(edge, &from, &to);
        }
    }

    fn visit_selection_edge(&mut self, edge: &ProxyEdge, to: &str) {
        let action = match self.action_for(to) {
            Some(action) => action,
            None => {
                self.problems
                    .push(format!("edge {}: target not found: {}", edge.id, to));
                return;
            }
        };

        if !edge.via.is_empty() {
            let head = match &action {
                RouteAction::Node(id) => id.clone(),
                _ => {
                    self.problems.push(format!(
                        "edge {}: via is only allowed when local->node",
                        edge.id
                    ));
                    return;
                }
            };
            let mut chain = vec![head];
            for hop in edge.via.iter().map(|h| h.trim()).filter(|h| !h.is_empty()) {
                let resolved = match self.resolve(hop) {
                    Ok(resolved) => resolved,
                    Err(reason) => {
                        self.warnings.push(format!(
                            "edge {}: via {} skipped: {}",
                            edge.id, hop, reason
                        ));
                        continue;
                    }
                };
                if matches!(resolved.as_str(), EDGE_DIRECT | EDGE_BLOCK | EDGE_LOCAL) {
                    self.problems.push(format!(
                        "edge {}: via contains invalid node {}",
                        edge.id, resolved
                    ));
                    continue;
                }
                chain.push(resolved);
            }
            for pair in chain.windows(2) {
                self.add_detour(&pair[0], &pair[1], &edge.id);
            }
        }

        let is_default = match classify_selection_edge(edge) {
            Ok(is_default) => is_default,
            Err(reason) => {
                self.problems.push(format!("edge {}: {}", edge.id, reason));
                return;
            }
        };

        if is_default {
            if let Some(existing) = &self.default {
                self.problems.push(format!(
                    "multiple default edges: {} and {}",
                    existing, action
                ));
                return;
            }
            if edge.priority != 0 {
                self.warnings.push(format!(
                    "edge {} is default; priority forced to 0",
                    edge.id
                ));
            }
            self.default = Some(action);
            return;
        }

        self.rules.push(RouteRule {
            edge_id: edge.id.clone(),
            priority: edge.priority,
            matcher: edge.route_rule.clone().unwrap_or_default(),
            action,
        });
    }

    fn visit_detour_edge(&mut self, edge: &ProxyEdge, from: &str, to: &str) {
        if from == EDGE_DIRECT || from == EDGE_BLOCK {
            self.problems.push(format!(
                "edge {}: detour from {} is not allowed",
                edge.id, from
            ));
            return;
        }
        if to == EDGE_LOCAL {
            self.problems
                .push(format!("edge {}: detour to {} is not allowed", edge.id, to));
            return;
        }
        // A slot wired to direct/block has no detour effect.
        if to == EDGE_DIRECT || to == EDGE_BLOCK {
            if !edge.from.starts_with(SLOT_PREFIX) {
                self.problems
                    .push(format!("edge {}: detour to {} is not allowed", edge.id, to));
            }
            return;
        }

        if !edge.rule_type.is_empty() {
            self.problems.push(format!(
                "edge {}: detour edge must not have ruleType",
                edge.id
            ));
            return;
        }
        if edge.route_rule.is_some() {
            self.problems.push(format!(
                "edge {}: detour edge must not have routeRule",
                edge.id
            ));
            return;
        }
        if !edge.via.is_empty() {
            self.problems
                .push(format!("edge {}: detour edge must not have via", edge.id));
            return;
        }

        self.add_detour(from, to, &edge.id);
    }

    fn action_for(&self, to: &str) -> Option<RouteAction> {
        match to {
            EDGE_DIRECT => Some(RouteAction::Direct),
            EDGE_BLOCK => Some(RouteAction::Block),
            id if self.nodes.contains_key(id) => Some(RouteAction::Node(id.to_string())),
            _ => None,
        }
    }

    fn add_detour(&mut self, from: &str, to: &str, edge_id: &str) {
        if from.trim().is_empty() || to.trim().is_empty() {
            self.problems
                .push(format!("edge {}: detour has empty node id", edge_id));
            return;
        }
        if from == to {
            self.problems
                .push(format!("edge {}: detour is self-loop: {}", edge_id, from));
            return;
        }
        if !self.nodes.contains_key(from) {
            self.problems.push(format!(
                "edge {}: detour from node not found: {}",
                edge_id, from
            ));
            return;
        }
        if !self.nodes.contains_key(to) {
            self.problems.push(format!(
                "edge {}: detour to node not found: {}",
                edge_id, to
            ));
            return;
        }
        if let Some(existing) = self.detours.get(from) {
            if existing != to {
                self.problems.push(format!(
                    "node {} has multiple detour upstreams: {} and {}",
                    from, existing, to
                ));
            }
            return;
        }
        self.detours.insert(from.to_string(), to.to_string());
    }
}

fn classify_selection_edge(edge: &ProxyEdge) -> Result<bool, String> {
    if (edge.to == EDGE_DIRECT || edge.to == EDGE_BLOCK) && !edge.via.is_empty() {
        return Err(format!("via is not allowed when to={}", edge.to));
    }

    match edge.rule_type.as_str() {
        RULE_TYPE_NONE => {
            if edge.route_rule.is_some() {
                return Err("ruleType=empty must not carry routeRule".to_string());
            }
            Ok(true)
        }
        RULE_TYPE_ROUTE => Ok(edge.route_rule.as_ref().map_or(true, |r| r.is_empty())),
        other => Err(format!("unsupported ruleType: {}", other)),
    }
}

/// Report every cycle in the detour map as `a -> b -> a`.
fn detour_cycles(detours: &BTreeMap<String, String>) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut cycles = Vec::new();

    for start in detours.keys() {
        let mut path: Vec<&str> = Vec::new();
        let mut current = Some(start.as_str());

        while let Some(node) = current {
            match marks.get(node) {
                Some(Mark::Done) => break,
                Some(Mark::Visiting) => {
                    if let Some(pos) = path.iter().position(|n| *n == node) {
                        let mut cycle: Vec<&str> = path[pos..].to_vec();
                        cycle.push(node);
                        cycles.push(format!("detour cycle: {}", cycle.join(" -> ")));
                    }
                    break;
                }
                None => {
                    marks.insert(node, Mark::Visiting);
                    path.push(node);
                    current = detours.get(node).map(|s| s.as_str());
                }
            }
        }

        for node in path {
            marks.insert(node, Mark::Done);
        }
    }

    cycles
}

/// Nodes a compiled router actually needs: rule and default targets plus
/// their detour upstream closure, in discovery order.
pub fn active_node_ids(compiled: &CompiledFRouter) -> Vec<String> {
    fn push(id: &str, active: &mut Vec<String>) {
        let id = id.trim();
        if !id.is_empty() && !active.iter().any(|a| a == id) {
            active.push(id.to_string());
        }
    }

    let mut active: Vec<String> = Vec::new();

    if let Some(id) = compiled.default.node_id() {
        push(id, &mut active);
    }
    for rule in &compiled.rules {
        if let Some(id) = rule.action.node_id() {
            push(id, &mut active);
        }
    }

    let mut i = 0;
    while i < active.len() {
        if let Some(upstream) = compiled.detour_upstream.get(&active[i]) {
            let upstream = upstream.clone();
            push(&upstream, &mut active);
        }
        i += 1;
    }

    active
}
