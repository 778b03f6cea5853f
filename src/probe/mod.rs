use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::domain::{FRouter, VeaResult};
use crate::measure::{Measurer, ProgressFn};
use crate::repository::{FRouterRepository, NodeRepository};

pub const QUEUE_CAPACITY: usize = 1024;
pub const WORKERS_PER_QUEUE: usize = 4;
/// Minimum gap between persisted speed progress updates
pub const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    Latency,
    Speed,
}

impl ProbeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ProbeKind::Latency => "latency",
            ProbeKind::Speed => "speed",
        }
    }
}

/// What a probe measures
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProbeTarget {
    Node(String),
    FRouter(String),
}

impl ProbeTarget {
    fn id(&self) -> &str {
        match self {
            ProbeTarget::Node(id) | ProbeTarget::FRouter(id) => id,
        }
    }
}

/// Exponential smoothing of progress samples; 0.4 weight on the new sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedSmoother {
    last: f64,
}

impl SpeedSmoother {
    /// Feed a sample; returns the smoothed value, or `None` for non-positive samples.
    pub fn update(&mut self, sample: f64) -> Option<f64> {
        if sample <= 0.0 {
            return None;
        }
        let smoothed = if self.last <= 0.0 {
            sample
        } else if sample > self.last {
            self.last + (sample - self.last) * 0.4
        } else {
            self.last * 0.6 + sample * 0.4
        };
        self.last = smoothed;
        Some(smoothed)
    }

    /// Reported final speed never drops below what the UI already showed.
    pub fn finish(&self, measured: f64) -> f64 {
        measured.max(self.last)
    }
}

/// Smoothed speed samples with rate-limited persistence.
#[derive(Debug, Default)]
struct SpeedProgress {
    smoother: SpeedSmoother,
    persisted_at: Option<Instant>,
}

impl SpeedProgress {
    /// Feed a sample; returns the smoothed value when it is due to be stored.
    fn record(&mut self, sample: f64, now: Instant) -> Option<f64> {
        let smoothed = self.smoother.update(sample)?;
        let due = self
            .persisted_at
            .map_or(true, |at| now.duration_since(at) >= PROGRESS_PERSIST_INTERVAL);
        if !due {
            return None;
        }
        self.persisted_at = Some(now);
        Some(smoothed)
    }
}

struct Shared {
    nodes: Arc<dyn NodeRepository>,
    frouters: Arc<dyn FRouterRepository>,
    measurer: Arc<Measurer>,
    in_flight: Mutex<HashSet<(ProbeKind, ProbeTarget)>>,
}

impl Shared {
    fn finish(&self, kind: ProbeKind, target: &ProbeTarget) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&(kind, target.clone()));
    }
}

/// Background latency / speed probing with per-kind queues.
///
/// A target already queued or running is not queued again; a full queue
/// drops the request.
pub struct ProbeService {
    shared: Arc<Shared>,
    latency_tx: mpsc::Sender<ProbeTarget>,
    speed_tx: mpsc::Sender<ProbeTarget>,
    shutdown_tx: watch::Sender<bool>,
    _queues: [SharedReceiver; 2],
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<ProbeTarget>>>;

impl ProbeService {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        frouters: Arc<dyn FRouterRepository>,
        measurer: Arc<Measurer>,
    ) -> Self {
        Self::with_workers(nodes, frouters, measurer, WORKERS_PER_QUEUE, QUEUE_CAPACITY)
    }

    fn with_workers(
        nodes: Arc<dyn NodeRepository>,
        frouters: Arc<dyn FRouterRepository>,
        measurer: Arc<Measurer>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            nodes,
            frouters,
            measurer,
            in_flight: Mutex::new(HashSet::new()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (latency_tx, latency_rx) = mpsc::channel(capacity.max(1));
        let (speed_tx, speed_rx) = mpsc::channel(capacity.max(1));

        let queues = [
            spawn_workers(ProbeKind::Latency, latency_rx, workers, &shared, &shutdown_rx),
            spawn_workers(ProbeKind::Speed, speed_rx, workers, &shared, &shutdown_rx),
        ];

        Self {
            shared,
            latency_tx,
            speed_tx,
            shutdown_tx,
            _queues: queues,
        }
    }

    /// Queue a probe; returns whether it was accepted.
    pub fn enqueue(&self, kind: ProbeKind, target: ProbeTarget) -> bool {
        let mut in_flight = self
            .shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let key = (kind, target.clone());
        if in_flight.contains(&key) {
            return false;
        }

        let tx = match kind {
            ProbeKind::Latency => &self.latency_tx,
            ProbeKind::Speed => &self.speed_tx,
        };
        match tx.try_send(target) {
            Ok(()) => {
                in_flight.insert(key);
                true
            }
            Err(e) => {
                tracing::debug!(kind = kind.as_str(), "probe dropped: {}", e);
                false
            }
        }
    }

    pub fn probe_node_latency(&self, id: &str) -> bool {
        self.enqueue(ProbeKind::Latency, ProbeTarget::Node(id.to_string()))
    }

    pub fn probe_node_speed(&self, id: &str) -> bool {
        self.enqueue(ProbeKind::Speed, ProbeTarget::Node(id.to_string()))
    }

    pub fn probe_frouter_latency(&self, id: &str) -> bool {
        self.enqueue(ProbeKind::Latency, ProbeTarget::FRouter(id.to_string()))
    }

    pub fn probe_frouter_speed(&self, id: &str) -> bool {
        self.enqueue(ProbeKind::Speed, ProbeTarget::FRouter(id.to_string()))
    }

    /// Stop all workers after their current probe.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ProbeService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_workers(
    kind: ProbeKind,
    rx: mpsc::Receiver<ProbeTarget>,
    workers: usize,
    shared: &Arc<Shared>,
    shutdown_rx: &watch::Receiver<bool>,
) -> SharedReceiver {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..workers {
        let rx = rx.clone();
        let shared = shared.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    next = async { rx.lock().await.recv().await } => next,
                };
                let Some(target) = next else { return };
                run_probe(&shared, kind, &target).await;
                shared.finish(kind, &target);
            }
        });
    }
    rx
}

async fn run_probe(shared: &Shared, kind: ProbeKind, target: &ProbeTarget) {
    let result = match kind {
        ProbeKind::Latency => probe_latency(shared, target).await,
        ProbeKind::Speed => probe_speed(shared, target).await,
    };
    if let Err(e) = result {
        tracing::warn!(
            kind = kind.as_str(),
            target = target.id(),
            "probe failed: {}",
            e
        );
    }
}

/// Resolve the FRouter and node set a probe runs against.
fn probe_graph(shared: &Shared, target: &ProbeTarget) -> VeaResult<(FRouter, Vec<crate::domain::Node>)> {
    match target {
        ProbeTarget::Node(id) => {
            let node = shared.nodes.get(id)?;
            Ok((FRouter::synthetic_for_node(&node.id, &node.name), vec![node]))
        }
        ProbeTarget::FRouter(id) => Ok((shared.frouters.get(id)?, shared.nodes.list()?)),
    }
}

fn record_latency(shared: &Shared, target: &ProbeTarget, ms: i64, error: &str) -> VeaResult<()> {
    match target {
        ProbeTarget::Node(id) => shared.nodes.update_latency(id, ms, error),
        ProbeTarget::FRouter(id) => shared.frouters.update_latency(id, ms, error),
    }
}

fn record_speed(shared: &Shared, target: &ProbeTarget, mbps: f64, error: &str) -> VeaResult<()> {
    match target {
        ProbeTarget::Node(id) => shared.nodes.update_speed(id, mbps, error),
        ProbeTarget::FRouter(id) => shared.frouters.update_speed(id, mbps, error),
    }
}

async fn probe_latency(shared: &Shared, target: &ProbeTarget) -> VeaResult<()> {
    let (frouter, nodes) = probe_graph(shared, target)?;
    match shared.measurer.measure_latency(&frouter, &nodes).await {
        Ok(ms) => record_latency(shared, target, ms, ""),
        Err(e) => {
            record_latency(shared, target, 0, &e.to_string())?;
            Err(e)
        }
    }
}

async fn probe_speed(shared: &Shared, target: &ProbeTarget) -> VeaResult<()> {
    let (frouter, nodes) = probe_graph(shared, target)?;

    let live = Arc::new(Mutex::new(SpeedProgress::default()));
    let progress: ProgressFn = {
        let live = live.clone();
        let nodes = shared.nodes.clone();
        let frouters = shared.frouters.clone();
        let target = target.clone();
        Arc::new(move |mbps| {
            let due = live
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(mbps, Instant::now());
            let Some(smoothed) = due else { return };
            let stored = match &target {
                ProbeTarget::Node(id) => nodes.update_speed(id, smoothed, ""),
                ProbeTarget::FRouter(id) => frouters.update_speed(id, smoothed, ""),
            };
            if let Err(e) = stored {
                tracing::debug!(target = target.id(), "store speed progress: {}", e);
            }
        })
    };

    match shared
        .measurer
        .measure_speed(&frouter, &nodes, Some(progress))
        .await
    {
        Ok(mbps) => {
            let smoother = live.lock().unwrap_or_else(|e| e.into_inner()).smoother;
            record_speed(shared, target, smoother.finish(mbps), "")
        }
        Err(e) => {
            record_speed(shared, target, 0.0, &e.to_string())?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::NodeSecurity;
    use crate::domain::{Node, NodeProtocol};
    use crate::engine::default_adapters;
    use crate::repository::Store;
    use tokio::net::TcpListener;

    fn service(store: Arc<Store>, workers: usize, capacity: usize) -> ProbeService {
        let dir = std::env::temp_dir().join(format!("vea-probe-{}", uuid::Uuid::new_v4()));
        let measurer = Arc::new(Measurer::new(
            store.clone(),
            store.clone(),
            default_adapters(),
            &dir,
        ));
        ProbeService::with_workers(store.clone(), store, measurer, workers, capacity)
    }

    fn in_flight(svc: &ProbeService, kind: ProbeKind, target: &ProbeTarget) -> bool {
        svc.shared
            .in_flight
            .lock()
            .unwrap()
            .contains(&(kind, target.clone()))
    }

    #[test]
    fn test_smoother() {
        let mut s = SpeedSmoother::default();
        assert_eq!(s.update(0.0), None);
        assert_eq!(s.update(10.0), Some(10.0));
        // increase moves 40% of the way
        let up = s.update(20.0).unwrap();
        assert!((up - 14.0).abs() < 1e-9);
        // decrease blends 0.6 old / 0.4 new
        let down = s.update(4.0).unwrap();
        assert!((down - (14.0 * 0.6 + 4.0 * 0.4)).abs() < 1e-9);
        assert_eq!(s.finish(1.0), down);
        assert_eq!(s.finish(100.0), 100.0);
    }

    #[test]
    fn test_speed_progress_is_rate_limited() {
        let mut live = SpeedProgress::default();
        let start = Instant::now();
        assert_eq!(live.record(0.0, start), None);
        assert_eq!(live.record(10.0, start), Some(10.0));

        // A 3s window ticks every 100ms; only one write per second gets through.
        let stored = (1..=30)
            .filter_map(|i| live.record(10.0, start + Duration::from_millis(100 * i)))
            .count();
        assert_eq!(stored, 3);
        assert_eq!(live.smoother.finish(0.0), 10.0);
    }

    #[tokio::test]
    async fn test_same_target_is_deduplicated() {
        let svc = service(Arc::new(Store::in_memory()), 0, 16);
        assert!(svc.probe_node_latency("n1"));
        assert!(!svc.probe_node_latency("n1"));
        assert!(svc.probe_node_speed("n1"));
        assert!(svc.probe_frouter_latency("n1"));
        assert!(in_flight(&svc, ProbeKind::Latency, &ProbeTarget::Node("n1".to_string())));
    }

    #[tokio::test]
    async fn test_full_queue_drops_request() {
        let svc = service(Arc::new(Store::in_memory()), 0, 1);
        assert!(svc.probe_node_latency("a"));
        assert!(!svc.probe_node_latency("b"));
        assert!(!in_flight(&svc, ProbeKind::Latency, &ProbeTarget::Node("b".to_string())));
    }

    #[tokio::test]
    async fn test_worker_records_node_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                drop(conn);
            }
        });

        let store = Arc::new(Store::in_memory());
        NodeRepository::create(
            store.as_ref(),
            Node {
                id: "n1".to_string(),
                name: "local".to_string(),
                address: "127.0.0.1".to_string(),
                port,
                protocol: NodeProtocol::Shadowsocks,
                security: Some(NodeSecurity {
                    method: "aes-128-gcm".to_string(),
                    password: "pw".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .unwrap();

        let svc = service(store.clone(), 1, 8);
        assert!(svc.probe_node_latency("n1"));

        let target = ProbeTarget::Node("n1".to_string());
        for _ in 0..100 {
            if !in_flight(&svc, ProbeKind::Latency, &target) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let node = NodeRepository::get(store.as_ref(), "n1").unwrap();
        assert!(node.last_latency_ms > 0);
        assert!(node.last_latency_error.is_empty());
        svc.shutdown();
    }

    #[tokio::test]
    async fn test_missing_node_clears_in_flight() {
        let svc = service(Arc::new(Store::in_memory()), 1, 8);
        assert!(svc.probe_node_latency("ghost"));
        let target = ProbeTarget::Node("ghost".to_string());
        for _ in 0..100 {
            if !in_flight(&svc, ProbeKind::Latency, &target) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(svc.probe_node_latency("ghost"));
    }
}
