//! HTTP API served to the router layer.

pub mod error;
pub mod handlers;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;

use crate::probe::ProbeService;
use crate::proxy::ProxyService;
use crate::repository::{
    ComponentRepository, FRouterRepository, NodeRepository, SettingsRepository, Store,
};


/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub frouters: Arc<dyn FRouterRepository>,
    pub nodes: Arc<dyn NodeRepository>,
    pub components: Arc<dyn ComponentRepository>,
    pub settings: Arc<dyn SettingsRepository>,
    pub proxy: Arc<ProxyService>,
    pub probes: Arc<ProbeService>,
}

impl AppState {
    pub fn from_store(store: Arc<Store>, proxy: Arc<ProxyService>, probes: Arc<ProbeService>) -> Self {
        Self {
            frouters: store.clone(),
            nodes: store.clone(),
            components: store.clone(),
            settings: store,
            proxy,
            probes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/snapshot", get(handlers::get_snapshot))
        .route(
            "/frouters",
            get(handlers::list_frouters).post(handlers::create_frouter),
        )
        .route(
            "/frouters/{id}",
            get(handlers::get_frouter).delete(handlers::delete_frouter),
        )
        .route(
            "/frouters/{id}/graph",
            get(handlers::get_graph).put(handlers::put_graph),
        )
        .route(
            "/frouters/{id}/graph/validate",
            post(handlers::validate_graph),
        )
        .route("/frouters/{id}/ping", post(handlers::ping_frouter))
        .route("/frouters/{id}/speedtest", post(handlers::speedtest_frouter))
        .route(
            "/proxy/config",
            get(handlers::get_proxy_config).put(handlers::put_proxy_config),
        )
        .route("/proxy/start", post(handlers::start_proxy))
        .route("/proxy/stop", post(handlers::stop_proxy))
        .route("/proxy/status", get(handlers::proxy_status))
        .route("/proxy/kernel/logs", get(handlers::kernel_logs))
        .route(
            "/nodes",
            get(handlers::list_nodes).post(handlers::create_node),
        )
        .route("/nodes/{id}", axum::routing::delete(handlers::delete_node))
        .route("/nodes/{id}/ping", post(handlers::ping_node))
        .route("/nodes/{id}/speedtest", post(handlers::speedtest_node))
        .with_state(state)
}

/// Bind `listen` and serve until `shutdown` resolves.
pub async fn serve<F>(listen: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind API listener on {}", listen))?;
    tracing::info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::default_adapters;
    use crate::measure::Measurer;
    use serde_json::{json, Value};
    use std::path::PathBuf;

    struct TestServer {
        base_url: String,
        client: reqwest::Client,
        dir: PathBuf,
        _handle: tokio::task::JoinHandle<()>,
    }

    impl TestServer {
        async fn start() -> Self {
            let dir = std::env::temp_dir().join(format!("vea-api-{}", uuid::Uuid::new_v4()));
            let store = Arc::new(Store::in_memory());
            let proxy = Arc::new(ProxyService::new(
                store.clone(),
                store.clone(),
                store.clone(),
                store.clone(),
                default_adapters(),
                &dir,
            ));
            let measurer = Arc::new(Measurer::new(
                store.clone(),
                store.clone(),
                default_adapters(),
                &dir,
            ));
            let probes = Arc::new(ProbeService::new(store.clone(), store.clone(), measurer));
            let state = AppState::from_store(store, proxy, probes);

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let handle = tokio::spawn(async move {
                let _ = axum::serve(listener, router(state)).await;
            });

            Self {
                base_url: format!("http://127.0.0.1:{}", port),
                client: reqwest::Client::new(),
                dir,
                _handle: handle,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }

        async fn create_frouter(&self, body: Value) -> String {
            let resp = self
                .client
                .post(self.url("/frouters"))
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 201);
            let created: Value = resp.json().await.unwrap();
            created["id"].as_str().unwrap().to_string()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[tokio::test]
    async fn test_start_with_empty_graph_is_rejected() {
        let server = TestServer::start().await;
        let id = server
            .create_frouter(json!({"name": "empty", "chainProxy": {"edges": []}}))
            .await;

        let resp = server
            .client
            .post(server.url("/proxy/start"))
            .json(&json!({"frouterId": id}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "invalid frouter");
        let problems = body["problems"].as_array().unwrap();
        assert!(problems
            .iter()
            .any(|p| p.as_str().unwrap().contains("missing default edge")));
    }

    #[tokio::test]
    async fn test_graph_save_normalizes_default_priority() {
        let server = TestServer::start().await;
        let id = server.create_frouter(json!({"name": "fr"})).await;

        let resp = server
            .client
            .put(server.url(&format!("/frouters/{}/graph", id)))
            .json(&json!({
                "edges": [{"id": "e1", "from": "local", "to": "direct", "priority": 123, "enabled": true}]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp.headers().get("x-vea-effects").is_none());

        let graph: Value = server
            .client
            .get(server.url(&format!("/frouters/{}/graph", id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(graph["edges"][0]["priority"], 0);
        assert!(graph["updatedAt"].is_string());
    }

    #[tokio::test]
    async fn test_graph_save_rejects_invalid_graph() {
        let server = TestServer::start().await;
        let id = server.create_frouter(json!({"name": "fr"})).await;

        let resp = server
            .client
            .put(server.url(&format!("/frouters/{}/graph", id)))
            .json(&json!({"edges": [{"id": "e1", "from": "local", "to": "ghost", "enabled": true}]}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert!(!body["problems"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_missing_target() {
        let server = TestServer::start().await;
        let id = server.create_frouter(json!({"name": "fr"})).await;

        let resp = server
            .client
            .post(server.url(&format!("/frouters/{}/graph/validate", id)))
            .json(&json!({
                "edges": [
                    {"id": "d", "from": "local", "to": "direct", "enabled": true},
                    {"id": "r", "from": "local", "to": "missing-node", "enabled": true,
                     "priority": 10, "ruleType": "route", "routeRule": {"domains": ["x.com"]}}
                ]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["valid"], false);
        let errors = body["errors"].as_array().unwrap();
        assert!(errors
            .iter()
            .any(|e| e.as_str().unwrap().contains("not found")));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_status_idle() {
        let server = TestServer::start().await;
        for _ in 0..2 {
            let resp = server
                .client
                .post(server.url("/proxy/stop"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 200);
        }

        let status: Value = server
            .client
            .get(server.url("/proxy/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["state"], "idle");
        assert_eq!(status["running"], false);
    }

    #[tokio::test]
    async fn test_unknown_entities_are_not_found() {
        let server = TestServer::start().await;
        let resp = server
            .client
            .get(server.url("/frouters/nope/graph"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        let resp = server
            .client
            .post(server.url("/nodes/nope/ping"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_create_invalid_node_is_bad_request() {
        let server = TestServer::start().await;
        let resp = server
            .client
            .post(server.url("/nodes"))
            .json(&json!({"name": "n", "address": "1.2.3.4", "port": 0, "protocol": "trojan"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_proxy_config_patch_keeps_unset_fields() {
        let server = TestServer::start().await;
        let resp = server
            .client
            .put(server.url("/proxy/config"))
            .json(&json!({"inboundPort": 7890, "frouterId": "fr-1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        let resp = server
            .client
            .put(server.url("/proxy/config"))
            .json(&json!({"inboundPort": 0}))
            .send()
            .await
            .unwrap();
        let config: Value = resp.json().await.unwrap();
        assert_eq!(config["inboundPort"], 7890);
        assert_eq!(config["frouterId"], "fr-1");
    }

    #[tokio::test]
    async fn test_snapshot_lists_entities() {
        let server = TestServer::start().await;
        server.create_frouter(json!({"name": "fr"})).await;
        let snapshot: Value = server
            .client
            .get(server.url("/snapshot"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(snapshot["frouters"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["proxyStatus"]["state"], "idle");
        assert!(snapshot["generatedAt"].is_string());
    }
}
