pub mod assets;
pub mod kernel_log;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::domain::{
    EngineKind, InboundMode, ProxyConfig, VeaError, VeaResult,
};
use crate::engine::{
    resolve_binary, select_engine, AdapterRegistry, BuildContext, EngineProcess, ProcessSpec,
};
use crate::frouter::compile_proxy_plan;
use crate::repository::{ComponentRepository, FRouterRepository, NodeRepository, SettingsRepository};

pub use assets::AssetFetcher;
use kernel_log::{read_window, LogWindow};

const STOP_GRACE: Duration = Duration::from_secs(10);
const TUN_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProxyState {
    pub fn as_str(&self) -> &str {
        match self {
            ProxyState::Idle => "idle",
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Stopping => "stopping",
            ProxyState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub state: ProxyState,
    pub running: bool,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frouter_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_mode: Option<InboundMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbound_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelLogSnapshot {
    pub session: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineKind>,
    pub running: bool,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub path: String,
    #[serde(flatten)]
    pub window: LogWindow,
}

/// What the current (or last) engine run was started with
#[derive(Debug, Clone)]
struct ActiveRun {
    engine: EngineKind,
    config: ProxyConfig,
    log_path: PathBuf,
}

#[derive(Debug, Default)]
struct Inner {
    state: ProxyState,
    process: Option<EngineProcess>,
    active: Option<ActiveRun>,
    session: u64,
    user_stopped: bool,
    last_error: Option<String>,
    last_restart_at: Option<DateTime<Utc>>,
}

/// Everything a start needs, gathered before the process is launched
struct Prepared {
    spec: ProcessSpec,
    run: ActiveRun,
    ready_timeout: Duration,
    ready_host: String,
    ready_port: Option<u16>,
    tun_interface: Option<String>,
}

/// Owns the single long-lived engine process.
pub struct ProxyService {
    frouters: Arc<dyn FRouterRepository>,
    nodes: Arc<dyn NodeRepository>,
    components: Arc<dyn ComponentRepository>,
    settings: Arc<dyn SettingsRepository>,
    adapters: AdapterRegistry,
    artifacts_dir: PathBuf,
    assets: AssetFetcher,
    inner: Arc<Mutex<Inner>>,
}

impl ProxyService {
    pub fn new(
        frouters: Arc<dyn FRouterRepository>,
        nodes: Arc<dyn NodeRepository>,
        components: Arc<dyn ComponentRepository>,
        settings: Arc<dyn SettingsRepository>,
        adapters: AdapterRegistry,
        artifacts_dir: &Path,
    ) -> Self {
        Self {
            frouters,
            nodes,
            components,
            settings,
            adapters,
            artifacts_dir: artifacts_dir.to_path_buf(),
            assets: AssetFetcher::new(artifacts_dir),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `<artifacts>/core/<engine>`
    pub fn engine_dir(&self, engine: EngineKind) -> PathBuf {
        self.artifacts_dir.join("core").join(engine.dir_name())
    }

    pub fn status(&self) -> ProxyStatus {
        status_of(&self.lock())
    }

    pub fn is_running(&self) -> bool {
        self.lock().state == ProxyState::Running
    }

    /// Launch the engine for `config` and wait until it serves.
    pub async fn start(&self, config: ProxyConfig) -> VeaResult<ProxyStatus> {
        {
            let mut inner = self.lock();
            match inner.state {
                ProxyState::Idle | ProxyState::Failed => {}
                state => return Err(VeaError::Busy(format!("proxy is {}", state.as_str()))),
            }
            inner.state = ProxyState::Starting;
            inner.user_stopped = false;
            inner.last_error = None;
        }
        let _guard = StartGuard { inner: &self.inner };

        let prepared = match self.prepare(config).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let mut inner = self.lock();
                inner.state = ProxyState::Idle;
                inner.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let process = match EngineProcess::spawn(prepared.spec.clone()).await {
            Ok(process) => process,
            Err(e) => {
                let mut inner = self.lock();
                inner.state = ProxyState::Idle;
                inner.last_error = Some(format!("{:#}", e));
                return Err(VeaError::Io(e));
            }
        };

        let session = {
            let mut inner = self.lock();
            inner.session += 1;
            inner.process = Some(process.clone());
            inner.active = Some(prepared.run.clone());
            inner.session
        };

        if let Err(e) = wait_ready(&process, &prepared).await {
            if let Err(stop_err) = process.stop(STOP_GRACE).await {
                tracing::warn!("failed to stop engine after readiness failure: {:#}", stop_err);
            }
            let mut inner = self.lock();
            inner.state = ProxyState::Failed;
            inner.process = None;
            inner.last_error = Some(format!("{:#}", e));
            return Err(VeaError::Io(e));
        }

        if let Err(e) = self.settings.update_proxy_config(prepared.run.config.clone()) {
            tracing::warn!("failed to persist proxy config: {}", e);
        }

        tracing::info!(
            engine = %prepared.run.engine,
            pid = process.pid(),
            "proxy engine running"
        );
        self.spawn_crash_watcher(&process, session);

        let mut inner = self.lock();
        inner.state = ProxyState::Running;
        Ok(status_of(&inner))
    }

    async fn prepare(&self, config: ProxyConfig) -> VeaResult<Prepared> {
        let default_engine = self.settings.default_engine();
        let config = config.with_start_defaults(default_engine);
        if config.frouter_id.trim().is_empty() {
            return Err(VeaError::invalid("proxyConfig.frouterId is required"));
        }

        let frouter = self.frouters.get(&config.frouter_id)?;
        let nodes = self.nodes.list()?;

        let selection = select_engine(
            config.inbound_mode,
            &frouter,
            &nodes,
            config.preferred_engine,
            default_engine,
            self.components.as_ref(),
            &self.adapters,
        )?;
        let engine = selection.engine;
        let adapter = self
            .adapters
            .get(&engine)
            .cloned()
            .ok_or_else(|| VeaError::invalid(format!("engine {} is not available", engine)))?;
        let binary = resolve_binary(adapter.as_ref(), selection.component.as_ref())?;

        let plan = compile_proxy_plan(engine, &config, &frouter, &nodes)?;
        for warning in &plan.compiled.warnings {
            tracing::warn!(frouter = %frouter.id, "{}", warning);
        }

        let engine_dir = self.engine_dir(engine);
        tokio::fs::create_dir_all(&engine_dir)
            .await
            .with_context(|| format!("Failed to create {}", engine_dir.display()))?;

        let ctx = BuildContext::detect(&self.artifacts_dir);
        let rendered = adapter
            .build_config(&plan, &ctx)
            .map_err(|e| VeaError::invalid(format!("{:#}", e)))?;

        let config_path = engine_dir.join(adapter.config_file_name());
        assets::write_atomic(&config_path, &rendered).await?;
        assets::write_atomic(&engine_dir.join("config.explain.txt"), plan.explain().as_bytes())
            .await?;

        let captured = kernel_log::prepare_kernel_log(&engine_dir, &self.artifacts_dir, engine).await?;

        let ensured = match engine {
            EngineKind::SingBox => self.assets.ensure_rule_sets(&rendered).await,
            EngineKind::Clash => self.assets.ensure_geodata(&engine_dir).await,
        };
        if let Err(e) = ensured {
            tracing::warn!(engine = %engine, "engine assets incomplete: {:#}", e);
        }

        let tun = config.inbound_mode == InboundMode::Tun;
        Ok(Prepared {
            spec: ProcessSpec {
                engine,
                binary,
                args: adapter.command_args(&config_path, &engine_dir),
                work_dir: engine_dir.clone(),
                log_path: captured.clone(),
            },
            ready_timeout: adapter.ready_timeout(),
            ready_host: config.inbound_listen(),
            ready_port: (config.inbound_port > 0).then_some(config.inbound_port),
            tun_interface: tun.then(|| config.tun_interface_name()),
            run: ActiveRun {
                engine,
                log_path: kernel_log::resolve_log_path(engine, &config, &engine_dir, &captured),
                config,
            },
        })
    }

    fn spawn_crash_watcher(&self, process: &EngineProcess, session: u64) {
        let inner = self.inner.clone();
        let mut exit_rx = process.exit_watcher();
        tokio::spawn(async move {
            let info = match exit_rx.wait_for(|e| e.is_some()).await {
                Ok(info) => info.clone(),
                Err(_) => return,
            };
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.session != session || inner.user_stopped {
                return;
            }
            if inner.state == ProxyState::Running {
                let message = info
                    .map(|i| i.message)
                    .unwrap_or_else(|| "engine exited".to_string());
                tracing::error!("proxy engine crashed: {}", message);
                inner.state = ProxyState::Failed;
                inner.process = None;
                inner.last_error = Some(message);
            }
        });
    }

    /// Stop the engine. A no-op when idle; clears a failed state.
    pub async fn stop(&self) -> VeaResult<ProxyStatus> {
        let process = {
            let mut inner = self.lock();
            match inner.state {
                ProxyState::Idle => return Ok(status_of(&inner)),
                ProxyState::Failed => {
                    inner.state = ProxyState::Idle;
                    inner.process = None;
                    return Ok(status_of(&inner));
                }
                ProxyState::Running => {}
                state => return Err(VeaError::Busy(format!("proxy is {}", state.as_str()))),
            }
            inner.state = ProxyState::Stopping;
            inner.user_stopped = true;
            inner.process.take()
        };

        if let Some(process) = process {
            if let Err(e) = process.stop(STOP_GRACE).await {
                tracing::warn!("engine stop: {:#}", e);
            }
        }

        let mut inner = self.lock();
        inner.state = ProxyState::Idle;
        tracing::info!("proxy engine stopped");
        Ok(status_of(&inner))
    }

    /// Stop, then start again with the last active (or persisted) config.
    pub async fn restart(&self) -> VeaResult<ProxyStatus> {
        let active = self.lock().active.as_ref().map(|a| a.config.clone());
        let config = match active {
            Some(config) => config,
            None => self.settings.get_proxy_config()?,
        };
        self.stop().await?;
        let result = self.start(config).await;
        let mut inner = self.lock();
        inner.last_restart_at = Some(Utc::now());
        if let Err(e) = &result {
            inner.last_error = Some(e.to_string());
        }
        drop(inner);
        result
    }

    /// Restart in the background when the engine is running. Returns whether one was scheduled.
    pub fn schedule_restart(self: &Arc<Self>) -> bool {
        if !self.is_running() {
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.restart().await {
                tracing::error!("proxy restart failed: {}", e);
            }
        });
        true
    }

    /// Start the persisted config on boot when it names an FRouter.
    pub async fn auto_start(&self) {
        let config = match self.settings.get_proxy_config() {
            Ok(config) if !config.frouter_id.trim().is_empty() => config,
            Ok(_) => {
                tracing::info!("auto start skipped: no frouter configured");
                return;
            }
            Err(e) => {
                tracing::warn!("auto start skipped: {}", e);
                return;
            }
        };
        match self.start(config).await {
            Ok(status) => tracing::info!(engine = ?status.engine, "auto start complete"),
            Err(e) => tracing::warn!("auto start failed: {}", e),
        }
    }

    /// Kernel log slice starting at byte `since`.
    pub async fn kernel_logs(&self, since: i64) -> KernelLogSnapshot {
        let (session, engine, running, pid, started_at, path) = {
            let inner = self.lock();
            (
                inner.session,
                inner.active.as_ref().map(|a| a.engine),
                inner.state == ProxyState::Running,
                inner.process.as_ref().map(|p| p.pid()).unwrap_or(0),
                inner.process.as_ref().map(|p| p.started_at()),
                inner.active.as_ref().map(|a| a.log_path.clone()),
            )
        };

        let window = match &path {
            Some(path) => read_window(path, since).await,
            None => LogWindow::default(),
        };
        KernelLogSnapshot {
            session,
            engine,
            running,
            pid,
            started_at,
            path: path.map(|p| p.display().to_string()).unwrap_or_default(),
            window,
        }
    }
}

/// Puts a start that was dropped mid-flight back to idle and stops its engine.
struct StartGuard<'a> {
    inner: &'a Mutex<Inner>,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != ProxyState::Starting {
            return;
        }
        inner.state = ProxyState::Idle;
        inner.last_error = Some("start cancelled".to_string());
        let Some(process) = inner.process.take() else {
            tracing::warn!("proxy start cancelled");
            return;
        };
        tracing::warn!(pid = process.pid(), "proxy start cancelled, stopping engine");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = process.stop(STOP_GRACE).await {
                        tracing::warn!("engine stop: {:#}", e);
                    }
                });
            }
            Err(_) => process.kill(),
        }
    }
}

fn status_of(inner: &Inner) -> ProxyStatus {
    let process = inner.process.as_ref();
    let active = inner.active.as_ref();
    ProxyStatus {
        state: inner.state,
        running: inner.state == ProxyState::Running,
        busy: matches!(inner.state, ProxyState::Starting | ProxyState::Stopping),
        pid: process.map(|p| p.pid()),
        engine: active.map(|a| a.engine),
        frouter_id: active.map(|a| a.config.frouter_id.clone()),
        inbound_mode: active.map(|a| a.config.inbound_mode),
        inbound_port: active
            .map(|a| a.config.inbound_port)
            .filter(|p| *p > 0),
        started_at: process.map(|p| p.started_at()),
        last_restart_at: inner.last_restart_at,
        last_error: inner.last_error.clone(),
    }
}

async fn wait_ready(process: &EngineProcess, prepared: &Prepared) -> anyhow::Result<()> {
    process
        .wait_for_ready(&prepared.ready_host, prepared.ready_port, prepared.ready_timeout)
        .await?;
    if let Some(name) = &prepared.tun_interface {
        process.wait_for_interface(name, TUN_READY_TIMEOUT).await?;
    }
    Ok(())
}
