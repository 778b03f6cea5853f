pub mod latency;
pub mod throughput;
pub mod tls;

use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::domain::{
    EngineKind, FRouter, InboundMode, Node, PreferredEngine, VeaError, VeaResult,
};
use crate::engine::process::pick_free_port;
use crate::engine::{
    resolve_binary, select_engine, AdapterRegistry, BuildContext, EngineProcess, EngineSelection,
    ProcessSpec,
};
use crate::frouter::{active_node_ids, compile, compile_measurement_plan, RouteAction};
use crate::proxy::assets::{write_atomic, AssetFetcher};
use crate::repository::{ComponentRepository, SettingsRepository};

pub use throughput::ProgressFn;
use throughput::Route;

pub const LATENCY_TEST_TIMEOUT: Duration = Duration::from_secs(8);
pub const SPEED_TEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const SPEED_TEST_DURATION: Duration = Duration::from_secs(3);
pub const SPEED_TEST_WORKERS: usize = 1;
pub const MEASURE_CONCURRENCY: usize = 4;
const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Runs latency and throughput probes for an FRouter.
///
/// Throughput through proxies needs a throwaway engine; at most
/// [`MEASURE_CONCURRENCY`] of those are alive at once.
pub struct Measurer {
    components: Arc<dyn ComponentRepository>,
    settings: Arc<dyn SettingsRepository>,
    adapters: AdapterRegistry,
    artifacts_dir: PathBuf,
    assets: AssetFetcher,
    slots: Arc<Semaphore>,
}

/// A live measurement engine. Dropping it kills the process and removes
/// the run directory; [`MeasurementRun::stop`] does the same gracefully.
pub struct MeasurementRun {
    pub engine: EngineKind,
    pub port: u16,
    pub run_dir: PathBuf,
    process: Option<EngineProcess>,
    _permit: OwnedSemaphorePermit,
}

impl MeasurementRun {
    pub async fn stop(mut self) {
        if let Some(process) = self.process.take() {
            if let Err(e) = process.stop(STOP_GRACE).await {
                tracing::warn!(engine = %self.engine, "measurement engine stop: {:#}", e);
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.run_dir).await {
            tracing::debug!(dir = %self.run_dir.display(), "remove measurement dir: {}", e);
        }
    }
}

impl Drop for MeasurementRun {
    fn drop(&mut self) {
        // The handle's drop kills the child; the directory goes with it.
        self.process = None;
        if self.run_dir.exists() {
            let _ = std::fs::remove_dir_all(&self.run_dir);
        }
    }
}

impl Measurer {
    pub fn new(
        components: Arc<dyn ComponentRepository>,
        settings: Arc<dyn SettingsRepository>,
        adapters: AdapterRegistry,
        artifacts_dir: &Path,
    ) -> Self {
        Self {
            components,
            settings,
            adapters,
            artifacts_dir: artifacts_dir.to_path_buf(),
            assets: AssetFetcher::new(artifacts_dir),
            slots: Arc::new(Semaphore::new(MEASURE_CONCURRENCY)),
        }
    }

    /// Slots currently free for measurement engines
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Latency of the FRouter's default path, in ms.
    ///
    /// A node default is dialed straight from this host, without an engine.
    /// A direct default times HEAD requests; block is 0.
    pub async fn measure_latency(&self, frouter: &FRouter, nodes: &[Node]) -> VeaResult<i64> {
        let compiled = compile(frouter, nodes)?;
        let probe = async {
            match &compiled.default {
                RouteAction::Node(id) => {
                    let node = nodes
                        .iter()
                        .find(|n| &n.id == id)
                        .ok_or_else(|| anyhow::anyhow!("default node not found: {}", id))?;
                    latency::node_latency(node)
                        .await
                        .context("measure node latency direct")
                }
                RouteAction::Direct => latency::direct_latency(latency::DIRECT_TARGETS)
                    .await
                    .context("measure latency direct"),
                RouteAction::Block => Ok(0),
            }
        };

        match timeout(LATENCY_TEST_TIMEOUT, probe).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(VeaError::Io(anyhow::anyhow!(
                "latency test timed out after {}s",
                LATENCY_TEST_TIMEOUT.as_secs()
            ))),
        }
    }

    /// Download throughput of the FRouter, in Mbps.
    ///
    /// Without active nodes the host's own network is measured.
    pub async fn measure_speed(
        &self,
        frouter: &FRouter,
        nodes: &[Node],
        progress: Option<ProgressFn>,
    ) -> VeaResult<f64> {
        let compiled = compile(frouter, nodes)?;
        let workers = SPEED_TEST_WORKERS;

        if active_node_ids(&compiled).is_empty() {
            let measured = timeout(
                SPEED_TEST_TIMEOUT,
                throughput::measure_download(
                    Route::Direct,
                    throughput::DOWNLOAD_TARGETS,
                    SPEED_TEST_DURATION,
                    workers,
                    progress,
                ),
            )
            .await;
            return finish_speed(measured, "measure download direct");
        }

        let run = self.start_measurement(frouter, nodes).await?;
        let measured = timeout(
            SPEED_TEST_TIMEOUT,
            throughput::measure_download(
                Route::Socks5 { port: run.port },
                throughput::DOWNLOAD_TARGETS,
                SPEED_TEST_DURATION,
                workers,
                progress,
            ),
        )
        .await;
        run.stop().await;
        finish_speed(measured, "measure download")
    }

    /// Start an isolated SOCKS engine for `frouter` on a free port.
    pub async fn start_measurement(
        &self,
        frouter: &FRouter,
        nodes: &[Node],
    ) -> VeaResult<MeasurementRun> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| VeaError::Io(anyhow::anyhow!("measurement slots closed: {}", e)))?;

        let selection = self.select_engine(frouter, nodes)?;
        let engine = selection.engine;
        let adapter = self
            .adapters
            .get(&engine)
            .cloned()
            .ok_or_else(|| VeaError::invalid(format!("engine {} is not available", engine)))?;
        let binary = resolve_binary(adapter.as_ref(), selection.component.as_ref())?;

        let port = pick_free_port().await.context("pick free port")?;
        let run_dir = self.create_run_dir(engine).await?;

        let mut run = MeasurementRun {
            engine,
            port,
            run_dir: run_dir.clone(),
            process: None,
            _permit: permit,
        };

        let plan = compile_measurement_plan(engine, port, frouter, nodes)?;
        let ctx = BuildContext::detect(&self.artifacts_dir);
        let config = match adapter.build_config(&plan, &ctx) {
            Ok(config) => config,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&run_dir).await;
                return Err(VeaError::invalid(format!("build measurement config: {:#}", e)));
            }
        };

        let prepared = async {
            match engine {
                EngineKind::SingBox => self
                    .assets
                    .ensure_rule_sets(&config)
                    .await
                    .context("ensure sing-box rule-set")?,
                EngineKind::Clash => self.assets.ensure_geodata(&run_dir).await?,
            }
            let config_path = run_dir.join(adapter.config_file_name());
            write_atomic(&config_path, &config).await?;
            Ok::<_, anyhow::Error>(config_path)
        };
        let config_path = match prepared.await {
            Ok(path) => path,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&run_dir).await;
                return Err(VeaError::Io(e));
            }
        };

        let spec = ProcessSpec {
            engine,
            binary,
            args: adapter.command_args(&config_path, &run_dir),
            work_dir: run_dir.clone(),
            log_path: run_dir.join("kernel.log"),
        };
        let process = match EngineProcess::spawn(spec).await {
            Ok(process) => process,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&run_dir).await;
                return Err(VeaError::Io(e.context("start measurement process")));
            }
        };
        run.process = Some(process.clone());

        if let Err(e) = process.wait_for_ready("127.0.0.1", Some(port), ENGINE_READY_TIMEOUT).await {
            run.stop().await;
            return Err(VeaError::Io(e.context("measurement process not ready")));
        }

        tracing::debug!(
            engine = %engine,
            port,
            frouter = %frouter.id,
            free_slots = self.available_slots(),
            "measurement engine ready"
        );
        Ok(run)
    }

    /// Settings default first; fall back to `auto` when that engine cannot
    /// run the graph or is not installed.
    fn select_engine(&self, frouter: &FRouter, nodes: &[Node]) -> VeaResult<EngineSelection> {
        let preferred = self.settings.default_engine();
        let select = |preferred: PreferredEngine| {
            select_engine(
                InboundMode::Socks,
                frouter,
                nodes,
                preferred,
                preferred,
                self.components.as_ref(),
                &self.adapters,
            )
        };

        if preferred == PreferredEngine::Auto {
            return select(PreferredEngine::Auto);
        }
        match select(preferred) {
            Ok(selection) if selection.component.is_some() => Ok(selection),
            Err(e @ VeaError::Compile(_)) => Err(e),
            _ => select(PreferredEngine::Auto),
        }
    }

    async fn create_run_dir(&self, engine: EngineKind) -> VeaResult<PathBuf> {
        let base = self
            .artifacts_dir
            .join("runtime")
            .join("measure")
            .join(engine.dir_name());
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let dir = base.join(format!("run-{}", suffix));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }
}

fn finish_speed(
    measured: Result<anyhow::Result<f64>, tokio::time::error::Elapsed>,
    what: &str,
) -> VeaResult<f64> {
    match measured {
        Ok(Ok(mbps)) => Ok(mbps),
        Ok(Err(e)) => Err(VeaError::Io(e.context(what.to_string()))),
        Err(_) => Err(VeaError::Io(anyhow::anyhow!(
            "{}: timed out after {}s",
            what,
            SPEED_TEST_TIMEOUT.as_secs()
        ))),
    }
}
