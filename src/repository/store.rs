use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::{ComponentRepository, FRouterRepository, NodeRepository, SettingsRepository};
use crate::domain::{
    ComponentKind, CoreComponent, EntityKind, FRouter, Node, PreferredEngine, ProxyConfig,
    VeaError, VeaResult,
};

/// Everything the store persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreState {
    pub frouters: Vec<FRouter>,
    pub nodes: Vec<Node>,
    pub components: Vec<CoreComponent>,
    pub proxy_config: ProxyConfig,
    pub default_engine: PreferredEngine,
}

/// In-memory entity store with optional JSON file persistence
pub struct Store {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            path: None,
        }
    }

    /// Open a store backed by `path`; a missing file yields an empty store.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let state = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?
        } else {
            StoreState::default()
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot(&self) -> StoreState {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a mutation and persist the result.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> VeaResult<T>) -> VeaResult<T> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let out = f(&mut guard)?;
        if let Some(path) = &self.path {
            if let Err(err) = persist(path, &guard) {
                tracing::warn!("failed to persist state to {}: {err:#}", path.display());
            }
        }
        Ok(out)
    }
}

fn persist(path: &Path, state: &StoreState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require_id(id: &str) -> VeaResult<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(VeaError::invalid("id is required"));
    }
    Ok(id)
}

impl FRouterRepository for Store {
    fn get(&self, id: &str) -> VeaResult<FRouter> {
        let id = require_id(id)?;
        self.read()
            .frouters
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| VeaError::not_found(EntityKind::FRouter, id))
    }

    fn list(&self) -> VeaResult<Vec<FRouter>> {
        Ok(self.read().frouters.clone())
    }

    fn create(&self, mut frouter: FRouter) -> VeaResult<FRouter> {
        self.mutate(|state| {
            if frouter.id.trim().is_empty() {
                frouter.id = new_id();
            }
            if state.frouters.iter().any(|f| f.id == frouter.id) {
                return Err(VeaError::invalid(format!(
                    "frouter already exists: {}",
                    frouter.id
                )));
            }
            let now = Utc::now();
            frouter.created_at = Some(now);
            frouter.updated_at = Some(now);
            state.frouters.push(frouter.clone());
            Ok(frouter)
        })
    }

    fn update(&self, id: &str, mut frouter: FRouter) -> VeaResult<FRouter> {
        let id = require_id(id)?;
        self.mutate(|state| {
            let slot = state
                .frouters
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| VeaError::not_found(EntityKind::FRouter, id))?;
            frouter.id = id.to_string();
            frouter.created_at = slot.created_at;
            frouter.updated_at = Some(Utc::now());
            *slot = frouter.clone();
            Ok(frouter)
        })
    }

    fn delete(&self, id: &str) -> VeaResult<()> {
        let id = require_id(id)?;
        self.mutate(|state| {
            let before = state.frouters.len();
            state.frouters.retain(|f| f.id != id);
            if state.frouters.len() == before {
                return Err(VeaError::not_found(EntityKind::FRouter, id));
            }
            Ok(())
        })
    }

    fn update_latency(&self, id: &str, latency_ms: i64, error: &str) -> VeaResult<()> {
        self.mutate(|state| {
            let fr = state
                .frouters
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| VeaError::not_found(EntityKind::FRouter, id))?;
            fr.last_latency_ms = latency_ms;
            fr.last_latency_error = error.to_string();
            fr.last_latency_at = Some(Utc::now());
            Ok(())
        })
    }

    fn update_speed(&self, id: &str, speed_mbps: f64, error: &str) -> VeaResult<()> {
        self.mutate(|state| {
            let fr = state
                .frouters
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| VeaError::not_found(EntityKind::FRouter, id))?;
            fr.last_speed_mbps = speed_mbps;
            fr.last_speed_error = error.to_string();
            fr.last_speed_at = Some(Utc::now());
            Ok(())
        })
    }
}

impl NodeRepository for Store {
    fn get(&self, id: &str) -> VeaResult<Node> {
        let id = require_id(id)?;
        self.read()
            .nodes
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| VeaError::not_found(EntityKind::Node, id))
    }

    fn list(&self) -> VeaResult<Vec<Node>> {
        Ok(self.read().nodes.clone())
    }

    fn list_by_config_id(&self, config_id: &str) -> VeaResult<Vec<Node>> {
        Ok(self
            .read()
            .nodes
            .iter()
            .filter(|n| n.source_config_id == config_id)
            .cloned()
            .collect())
    }

    fn create(&self, node: Node) -> VeaResult<Node> {
        node.validate()?;
        let mut node = node.normalized();
        self.mutate(|state| {
            if node.id.trim().is_empty() {
                node.id = new_id();
            }
            if state.nodes.iter().any(|n| n.id == node.id) {
                return Err(VeaError::invalid(format!("node already exists: {}", node.id)));
            }
            let now = Utc::now();
            node.created_at = Some(now);
            node.updated_at = Some(now);
            state.nodes.push(node.clone());
            Ok(node)
        })
    }

    fn update(&self, id: &str, node: Node) -> VeaResult<Node> {
        let id = require_id(id)?;
        node.validate()?;
        let mut node = node.normalized();
        self.mutate(|state| {
            let slot = state
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| VeaError::not_found(EntityKind::Node, id))?;
            if !slot.source_config_id.trim().is_empty() {
                return Err(VeaError::invalid("subscription node is read-only"));
            }
            node.id = id.to_string();
            node.created_at = slot.created_at;
            node.updated_at = Some(Utc::now());
            *slot = node.clone();
            Ok(node)
        })
    }

    fn delete(&self, id: &str) -> VeaResult<()> {
        let id = require_id(id)?;
        self.mutate(|state| {
            let before = state.nodes.len();
            state.nodes.retain(|n| n.id != id);
            if state.nodes.len() == before {
                return Err(VeaError::not_found(EntityKind::Node, id));
            }
            Ok(())
        })
    }

    fn replace_nodes_for_config(
        &self,
        config_id: &str,
        nodes: Option<Vec<Node>>,
    ) -> VeaResult<Vec<Node>> {
        let config_id = require_id(config_id)?;
        self.mutate(|state| {
            state.nodes.retain(|n| n.source_config_id != config_id);
            let now = Utc::now();
            let mut inserted = Vec::new();
            for mut node in nodes.unwrap_or_default() {
                if node.id.trim().is_empty() {
                    node.id = new_id();
                }
                node.source_config_id = config_id.to_string();
                node.created_at.get_or_insert(now);
                node.updated_at = Some(now);
                inserted.push(node.clone());
                state.nodes.push(node);
            }
            Ok(inserted)
        })
    }

    fn update_latency(&self, id: &str, latency_ms: i64, error: &str) -> VeaResult<()> {
        self.mutate(|state| {
            let node = state
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| VeaError::not_found(EntityKind::Node, id))?;
            node.last_latency_ms = latency_ms;
            node.last_latency_error = error.to_string();
            node.last_latency_at = Some(Utc::now());
            Ok(())
        })
    }

    fn update_speed(&self, id: &str, speed_mbps: f64, error: &str) -> VeaResult<()> {
        self.mutate(|state| {
            let node = state
                .nodes
                .iter_mut()
                .find(|n| n.id == id)
                .ok_or_else(|| VeaError::not_found(EntityKind::Node, id))?;
            node.last_speed_mbps = speed_mbps;
            node.last_speed_error = error.to_string();
            node.last_speed_at = Some(Utc::now());
            Ok(())
        })
    }
}

impl ComponentRepository for Store {
    fn get(&self, id: &str) -> VeaResult<CoreComponent> {
        self.read()
            .components
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| VeaError::not_found(EntityKind::Component, id))
    }

    fn list(&self) -> VeaResult<Vec<CoreComponent>> {
        Ok(self.read().components.clone())
    }

    fn get_by_kind(&self, kind: ComponentKind) -> VeaResult<CoreComponent> {
        self.read()
            .components
            .iter()
            .find(|c| c.kind == kind)
            .cloned()
            .ok_or_else(|| VeaError::not_found(EntityKind::Component, kind.as_str()))
    }

    fn upsert(&self, mut component: CoreComponent) -> VeaResult<CoreComponent> {
        self.mutate(|state| {
            if component.id.trim().is_empty() {
                component.id = component.kind.as_str().to_string();
            }
            match state.components.iter_mut().find(|c| c.id == component.id) {
                Some(existing) => *existing = component.clone(),
                None => state.components.push(component.clone()),
            }
            Ok(component)
        })
    }
}

impl SettingsRepository for Store {
    fn get_proxy_config(&self) -> VeaResult<ProxyConfig> {
        Ok(self.read().proxy_config.clone())
    }

    fn update_proxy_config(&self, mut config: ProxyConfig) -> VeaResult<ProxyConfig> {
        self.mutate(|state| {
            config.updated_at = Some(Utc::now());
            state.proxy_config = config.clone();
            Ok(config)
        })
    }

    fn default_engine(&self) -> PreferredEngine {
        self.read().default_engine
    }

    fn set_default_engine(&self, engine: PreferredEngine) -> VeaResult<()> {
        self.mutate(|state| {
            state.default_engine = engine;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::NodeSecurity;
    use crate::domain::NodeProtocol;

    fn trojan(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            address: "example.com".to_string(),
            port: 443,
            protocol: NodeProtocol::Trojan,
            security: Some(NodeSecurity {
                password: "pw".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_frouter_crud() {
        let store = Store::in_memory();
        let created = FRouterRepository::create(
            &store,
            FRouter {
                name: "main".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!created.id.is_empty());
        assert!(created.created_at.is_some());

        let fetched = FRouterRepository::get(&store, &created.id).unwrap();
        assert_eq!(fetched.name, "main");

        FRouterRepository::delete(&store, &created.id).unwrap();
        let err = FRouterRepository::get(&store, &created.id).unwrap_err();
        assert!(matches!(err, VeaError::NotFound { .. }));
    }

    #[test]
    fn test_node_create_validates() {
        let store = Store::in_memory();
        let mut bad = trojan("n1");
        bad.security = None;
        assert!(NodeRepository::create(&store, bad).unwrap_err().is_invalid_data());
        assert!(NodeRepository::create(&store, trojan("n1")).is_ok());
    }

    #[test]
    fn test_replace_nodes_for_config_clears_with_none() {
        let store = Store::in_memory();
        NodeRepository::create(&store, trojan("manual")).unwrap();
        store
            .replace_nodes_for_config("sub-1", Some(vec![trojan("a"), trojan("b")]))
            .unwrap();
        assert_eq!(store.list_by_config_id("sub-1").unwrap().len(), 2);

        store.replace_nodes_for_config("sub-1", None).unwrap();
        assert!(store.list_by_config_id("sub-1").unwrap().is_empty());
        assert_eq!(NodeRepository::list(&store).unwrap().len(), 1);
    }

    #[test]
    fn test_subscription_node_is_read_only() {
        let store = Store::in_memory();
        store
            .replace_nodes_for_config("sub-1", Some(vec![trojan("a")]))
            .unwrap();
        let err = NodeRepository::update(&store, "a", trojan("a")).unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_telemetry_updates() {
        let store = Store::in_memory();
        NodeRepository::create(&store, trojan("n1")).unwrap();
        NodeRepository::update_latency(&store, "n1", 42, "").unwrap();
        NodeRepository::update_speed(&store, "n1", 0.0, "timeout").unwrap();
        let node = NodeRepository::get(&store, "n1").unwrap();
        assert_eq!(node.last_latency_ms, 42);
        assert_eq!(node.last_speed_error, "timeout");
        assert!(node.last_speed_at.is_some());
    }

    #[test]
    fn test_open_persists_state() {
        let dir = std::env::temp_dir().join(format!("vea-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        {
            let store = Store::open(&path).unwrap();
            store.set_default_engine(PreferredEngine::Clash).unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.default_engine(), PreferredEngine::Clash);
        let _ = fs::remove_dir_all(&dir);
    }
}
