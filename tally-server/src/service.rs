use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tally_config::Config;
use tally_metrics::MetricBatch;
use tally_system::{Addr, SendError, Service};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::services::aggregator::AggregatorService;
use crate::services::backend::create_backends;
use crate::services::cloud::{CloudService, create_provider};
use crate::services::dispatcher::{Dispatcher, worker_queues};
use crate::services::flush::{Flush, FlushNow, FlushService};
use crate::services::internal::InternalMetricsService;
use crate::services::receiver::{Ingestion, LineHandler};
use crate::services::stats::PipelineStats;

/// Indicates the type of failure of the server.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ServiceError {
    /// Creating the runtime failed.
    #[error("could not create the runtime")]
    Runtime,

    /// A backend could not be created from its configuration.
    #[error("could not initialize backends")]
    Backends,

    /// The cloud provider could not be created from its configuration.
    #[error("could not initialize the cloud provider")]
    CloudProvider,

    /// Binding the receiver failed.
    #[error("bind to interface failed")]
    BindFailed,

    /// The internal metrics drain could not be spawned.
    #[error("could not start the internal metrics drain")]
    InternalMetrics,
}

/// Constructs a tokio [`Runtime`] configured for running [services](tally_system::Service).
pub fn create_runtime(name: &str, threads: usize) -> io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name(name)
        .worker_threads(threads)
        .enable_all()
        .build()
}

/// The running pipeline.
#[derive(Debug)]
pub struct ServiceState {
    ingestion: Ingestion,
    flush: Addr<Flush>,
    flush_handle: JoinHandle<()>,
}

impl ServiceState {
    /// Starts all services.
    ///
    /// Must be called from within the runtime. If `internal_metrics` is given, the daemon's own
    /// metrics received on this channel are aggregated like any other metric.
    pub fn start(
        config: Arc<Config>,
        internal_metrics: Option<crossbeam_channel::Receiver<Vec<u8>>>,
    ) -> Result<Self> {
        let stats = Arc::new(PipelineStats::default());
        let backends = create_backends(&config).context(ServiceError::Backends)?;

        let cloud = match config.cloud() {
            Some(cloud_config) => {
                let provider =
                    create_provider(&cloud_config.provider).context(ServiceError::CloudProvider)?;
                tally_log::info!(provider = provider.name(), "starting cloud tag enricher");
                Some(CloudService::new(provider, cloud_config.clone()).start())
            }
            None => None,
        };

        let aggregator_config = config.aggregator();
        let (queues, receivers) = worker_queues(
            aggregator_config.max_workers.max(1),
            aggregator_config.max_queue_size,
        );
        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(worker, queue)| {
                AggregatorService::new(worker, aggregator_config, queue).start_detached()
            })
            .collect();

        let dispatcher = Dispatcher::new(queues, cloud, stats.clone());

        if let Some(rx) = internal_metrics {
            InternalMetricsService::new(rx, dispatcher.clone())
                .start()
                .context(ServiceError::InternalMetrics)?;
        }

        let (flush, flush_handle) =
            FlushService::new(&config, workers, backends, dispatcher.clone(), stats.clone())
                .start_joinable();

        let handler = LineHandler::new(config.parser(), dispatcher, stats);
        let ingestion = Ingestion::start(&config, handler, CancellationToken::new())
            .context(ServiceError::BindFailed)?;

        Ok(Self {
            ingestion,
            flush,
            flush_handle,
        })
    }

    /// Returns the address the receiver is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.ingestion.local_addr()
    }

    /// Flushes all workers immediately, in addition to the regular flush interval.
    pub async fn flush(&self) -> Result<Arc<MetricBatch>, SendError> {
        self.flush.send(FlushNow::default()).await
    }

    /// Stops the pipeline gracefully.
    ///
    /// Stops reading, waits until everything read so far is dispatched and performs a final flush.
    /// Resolves once all backends have finished with the final batch.
    pub async fn shutdown(self) {
        let Self {
            ingestion,
            flush,
            flush_handle,
        } = self;

        ingestion.stop().await;

        match flush.send(FlushNow { drain: true }).await {
            Ok(batch) => tally_log::info!(metrics = batch.len(), "final flush completed"),
            Err(error) => tally_log::error!(
                error = &error as &dyn std::error::Error,
                "final flush failed"
            ),
        }

        // The flush service stops once its last address is gone, releasing the workers.
        drop(flush);
        if let Err(error) = flush_handle.await {
            tally_log::error!(
                error = &error as &dyn std::error::Error,
                "flush service panicked"
            );
        }
    }
}
