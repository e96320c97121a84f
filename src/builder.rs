use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::appserver::AppServer;
use crate::config::CoreConfig;
use crate::dispatch::{EventQueue, IngressHook, WorkItem, WorkerEnv, WorkerPool};
use crate::error::{Error, Result};
use crate::monitor::{
    AbortOnFault, EventAccumulator, ExceptionHandler, LoadMonitor, NullAccumulator,
    NullLoadMonitor,
};
use crate::sip::{
    NullStatelessSender, NullTransactionSink, SipPipeline, StatelessSender, TransactionSink,
};

/// Wires configuration, registered services and collaborator sinks into a
/// runnable core. Collaborators all have inert defaults so the core can be
/// brought up before the surrounding engine is attached.
pub struct SipCoreBuilder {
    config: CoreConfig,
    services: Vec<Arc<dyn AppServer>>,
    stateless: Arc<dyn StatelessSender>,
    transactions: Arc<dyn TransactionSink>,
    latency_table: Arc<dyn EventAccumulator>,
    queue_size_table: Arc<dyn EventAccumulator>,
    load_monitor: Arc<dyn LoadMonitor>,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl SipCoreBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            services: Vec::new(),
            stateless: Arc::new(NullStatelessSender),
            transactions: Arc::new(NullTransactionSink),
            latency_table: Arc::new(NullAccumulator),
            queue_size_table: Arc::new(NullAccumulator),
            load_monitor: Arc::new(NullLoadMonitor),
            exception_handler: Arc::new(AbortOnFault),
        }
    }

    /// Registers a named application service. Order matters only for
    /// documentation; lookup is by service name.
    pub fn register_service(mut self, service: Arc<dyn AppServer>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_stateless_sender(mut self, sender: Arc<dyn StatelessSender>) -> Self {
        self.stateless = sender;
        self
    }

    pub fn with_transaction_sink(mut self, sink: Arc<dyn TransactionSink>) -> Self {
        self.transactions = sink;
        self
    }

    pub fn with_latency_table(mut self, table: Arc<dyn EventAccumulator>) -> Self {
        self.latency_table = table;
        self
    }

    pub fn with_queue_size_table(mut self, table: Arc<dyn EventAccumulator>) -> Self {
        self.queue_size_table = table;
        self
    }

    pub fn with_load_monitor(mut self, monitor: Arc<dyn LoadMonitor>) -> Self {
        self.load_monitor = monitor;
        self
    }

    pub fn with_exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = handler;
        self
    }

    pub fn build(self) -> Result<CoreRuntime> {
        if self.config.dispatch.num_worker_threads == 0 {
            return Err(Error::configuration(
                "at least one worker thread is required",
            ));
        }
        if self.config.home_domain.is_empty() {
            return Err(Error::configuration("home domain must be configured"));
        }

        let config = Arc::new(self.config);
        let queue = Arc::new(EventQueue::new());
        queue.set_deadlock_threshold(Duration::from_millis(
            config.dispatch.deadlock_threshold_ms,
        ));

        let pipeline = Arc::new(SipPipeline::new(
            config.clone(),
            self.services,
            self.stateless.clone(),
            self.transactions,
        ));

        let env = Arc::new(WorkerEnv {
            latency_table: self.latency_table,
            load_monitor: self.load_monitor,
            exception_handler: self.exception_handler.clone(),
            stateless: self.stateless.clone(),
        });

        Ok(CoreRuntime {
            config,
            queue,
            pipeline,
            env,
            queue_size_table: self.queue_size_table,
            exception_handler: self.exception_handler,
            stateless: self.stateless,
        })
    }
}

/// A built but not yet running core.
pub struct CoreRuntime {
    config: Arc<CoreConfig>,
    queue: Arc<EventQueue<WorkItem>>,
    pipeline: Arc<SipPipeline>,
    env: Arc<WorkerEnv>,
    queue_size_table: Arc<dyn EventAccumulator>,
    exception_handler: Arc<dyn ExceptionHandler>,
    stateless: Arc<dyn StatelessSender>,
}

impl CoreRuntime {
    /// Spawns the worker pool and produces the ingress hook for the SIP
    /// engine to call on every received message.
    pub fn start(self) -> Result<CoreHandle> {
        let workers = self.config.dispatch.num_worker_threads;
        info!(
            workers,
            home_domain = %self.config.home_domain,
            "starting sip message processing core"
        );

        let pool = WorkerPool::start(
            workers,
            self.queue.clone(),
            self.pipeline.clone(),
            self.env,
        )?;
        let ingress = Arc::new(IngressHook::new(
            self.queue.clone(),
            self.queue_size_table,
            self.exception_handler,
            self.stateless,
            self.config.dispatch.queue_high_watermark,
        ));

        Ok(CoreHandle {
            queue: self.queue,
            ingress,
            pipeline: self.pipeline,
            pool,
        })
    }
}

/// Running core: owns the queue and the worker pool, and hands out the
/// ingress hook plus the pipeline for engine callbacks (inbound-leg
/// failures).
pub struct CoreHandle {
    queue: Arc<EventQueue<WorkItem>>,
    ingress: Arc<IngressHook>,
    pipeline: Arc<SipPipeline>,
    pool: WorkerPool,
}

impl CoreHandle {
    pub fn ingress(&self) -> Arc<IngressHook> {
        self.ingress.clone()
    }

    pub fn pipeline(&self) -> Arc<SipPipeline> {
        self.pipeline.clone()
    }

    /// Terminates the queue and waits for every worker to exit.
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            queue,
            ingress: _,
            pipeline: _,
            pool,
        } = self;
        info!("stopping sip message processing core");
        queue.terminate();
        tokio::task::spawn_blocking(move || pool.join())
            .await
            .map_err(|join_error| {
                Error::runtime(format!("worker join task panicked: {join_error}"))
            })?;
        Ok(())
    }
}
