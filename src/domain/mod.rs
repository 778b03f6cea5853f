pub mod component;
pub mod error;
pub mod frouter;
pub mod node;
pub mod proxy_config;

pub use component::{ComponentKind, CoreComponent};
pub use error::{CompileError, EntityKind, VeaError, VeaResult};
pub use frouter::{
    is_slot_id, FRouter, GraphPosition, ProxyEdge, RouteMatchRule, SlotNode,
    EDGE_BLOCK, EDGE_DIRECT, EDGE_LOCAL, RULE_TYPE_NONE, RULE_TYPE_ROUTE, SLOT_PREFIX,
};
pub use node::{filter_nodes_by_id, Node, NodeProtocol, NodeTls, NodeTransport};
pub use proxy_config::{
    EngineKind, InboundMode, LogConfig, PreferredEngine, ProxyConfig, ProxyConfigPatch, TunSettings,
};
