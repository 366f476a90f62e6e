//! Process-level wiring: store, quota, executor, worker pool, sweeper, and
//! outbox delivery assembled from one immutable configuration record.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use labelsquor_workflow::{OrchestratorConfig, Result};

use crate::events::{EventBus, EventSubscriber};
use crate::executor::{StageExecutor, StageRegistry};
use crate::ingress::Orchestrator;
use crate::observability::ObservabilityView;
use crate::quota::QuotaManager;
use crate::shutdown::Shutdown;
use crate::store::SqliteWorkflowStore;
use crate::sweeper::ResumeSweeper;
use crate::worker::WorkerPool;

pub struct WorkflowRuntime {
    orchestrator: Orchestrator,
    observability: ObservabilityView,
    quota: Arc<QuotaManager>,
    store: Arc<SqliteWorkflowStore>,
    shutdown: Arc<Shutdown>,
    workers: WorkerPool,
    background: Vec<JoinHandle<()>>,
}

impl WorkflowRuntime {
    /// Open the store and start workers, sweeper, and outbox delivery.
    /// Must be called from within a tokio runtime.
    pub fn start(
        db_path: &str,
        config: OrchestratorConfig,
        registry: StageRegistry,
        subscribers: Vec<Arc<dyn EventSubscriber>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(SqliteWorkflowStore::open(db_path)?);
        let quota = Arc::new(QuotaManager::new(Arc::clone(&store), Arc::clone(&config)));
        let executor = Arc::new(StageExecutor::new(
            Arc::clone(&store),
            Arc::clone(&quota),
            registry,
            config.stage_timeout,
        ));
        let shutdown = Shutdown::new();

        let workers = WorkerPool::start(
            Arc::clone(&store),
            executor,
            Arc::clone(&config),
            Arc::clone(&shutdown),
        );

        let sweeper = ResumeSweeper::new(
            Arc::clone(&store),
            Arc::clone(&quota),
            config.sweeper_interval,
        );
        let sweeper_shutdown = Arc::clone(&shutdown);
        let sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_shutdown).await });

        let bus = EventBus::new(
            Arc::clone(&store),
            subscribers,
            config.event_retry_base,
            config.event_retry_cap,
        );
        let bus_shutdown = Arc::clone(&shutdown);
        let bus_handle = tokio::spawn(async move { bus.run(bus_shutdown).await });

        info!(
            workers = config.num_workers,
            sweeper_interval_s = config.sweeper_interval.as_secs(),
            "workflow runtime started"
        );

        Ok(Self {
            orchestrator: Orchestrator::new(Arc::clone(&store)),
            observability: ObservabilityView::new(Arc::clone(&store), Arc::clone(&quota)),
            quota,
            store,
            shutdown,
            workers,
            background: vec![sweeper_handle, bus_handle],
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn observability(&self) -> &ObservabilityView {
        &self.observability
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub fn store(&self) -> &Arc<SqliteWorkflowStore> {
        &self.store
    }

    /// Graceful shutdown: stop claiming, wait out the grace period for
    /// in-flight stages, then stop the background loops.
    pub async fn shutdown(self) {
        self.shutdown.trigger();
        self.workers.shutdown().await;
        for handle in self.background {
            let _ = handle.await;
        }
        info!("workflow runtime stopped");
    }
}
