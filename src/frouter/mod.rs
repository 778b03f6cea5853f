pub mod compiler;
pub mod plan;

pub use compiler::{active_node_ids, compile, normalize_default_priorities, RouteAction};
pub use plan::{compile_measurement_plan, compile_proxy_plan, Purpose, RuntimePlan};
