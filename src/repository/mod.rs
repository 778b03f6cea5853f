pub mod store;

use crate::domain::{CoreComponent, ComponentKind, FRouter, Node, PreferredEngine, ProxyConfig, VeaResult};

pub use store::Store;

/// FRouter persistence
pub trait FRouterRepository: Send + Sync {
    fn get(&self, id: &str) -> VeaResult<FRouter>;
    fn list(&self) -> VeaResult<Vec<FRouter>>;
    fn create(&self, frouter: FRouter) -> VeaResult<FRouter>;
    fn update(&self, id: &str, frouter: FRouter) -> VeaResult<FRouter>;
    fn delete(&self, id: &str) -> VeaResult<()>;
    fn update_latency(&self, id: &str, latency_ms: i64, error: &str) -> VeaResult<()>;
    fn update_speed(&self, id: &str, speed_mbps: f64, error: &str) -> VeaResult<()>;
}

/// Node persistence
pub trait NodeRepository: Send + Sync {
    fn get(&self, id: &str) -> VeaResult<Node>;
    fn list(&self) -> VeaResult<Vec<Node>>;
    fn list_by_config_id(&self, config_id: &str) -> VeaResult<Vec<Node>>;
    fn create(&self, node: Node) -> VeaResult<Node>;
    fn update(&self, id: &str, node: Node) -> VeaResult<Node>;
    fn delete(&self, id: &str) -> VeaResult<()>;
    /// Swap every node of a subscription; `None` clears them.
    fn replace_nodes_for_config(&self, config_id: &str, nodes: Option<Vec<Node>>) -> VeaResult<Vec<Node>>;
    fn update_latency(&self, id: &str, latency_ms: i64, error: &str) -> VeaResult<()>;
    fn update_speed(&self, id: &str, speed_mbps: f64, error: &str) -> VeaResult<()>;
}

/// Installed engine components
pub trait ComponentRepository: Send + Sync {
    fn get(&self, id: &str) -> VeaResult<CoreComponent>;
    fn list(&self) -> VeaResult<Vec<CoreComponent>>;
    fn get_by_kind(&self, kind: ComponentKind) -> VeaResult<CoreComponent>;
    fn upsert(&self, component: CoreComponent) -> VeaResult<CoreComponent>;
}

/// Singleton settings
pub trait SettingsRepository: Send + Sync {
    fn get_proxy_config(&self) -> VeaResult<ProxyConfig>;
    fn update_proxy_config(&self, config: ProxyConfig) -> VeaResult<ProxyConfig>;
    /// `engine.defaultEngine` frontend setting
    fn default_engine(&self) -> PreferredEngine;
    fn set_default_engine(&self, engine: PreferredEngine) -> VeaResult<()>;
}
