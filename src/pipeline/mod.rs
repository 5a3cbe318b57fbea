//! Steady-state shipping: filter → batching queue → ingest client.
//!
//! A `Pipeline` is built from a completed `ProvisioningState` and never
//! re-provisions. Hub callbacks feed it through `handle_state_change`,
//! which is synchronous and never waits on the network.

use crate::batching::{BatchConfig, BatchingQueue};
use crate::config::HistoryConfig;
use crate::diagnostics::{DiagnosticCounters, DiagnosticsSnapshot};
use crate::event::StateChangeEvent;
use crate::filter::{EntityFilter, FilterConfig};
use crate::ingest::{BatchSink, IngestClient, IngestOptions};
use crate::provisioning::ProvisioningState;
use anyhow::Result;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, trace};

/// Everything the pipeline needs besides the provisioned identifiers.
#[derive(Clone)]
pub struct PipelineSettings {
    /// `scheme://host` of the cluster
    pub base_url: String,
    pub token: String,
    pub filter: FilterConfig,
    pub batch: BatchConfig,
    pub ingest: IngestOptions,
}

impl PipelineSettings {
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self {
            base_url: config.base_url(),
            token: config.bearer_token.clone(),
            filter: config.filter_config(),
            batch: config.batch_config(),
            ingest: config.ingest_options(),
        }
    }
}

pub struct Pipeline {
    filter: RwLock<Arc<EntityFilter>>,
    queue: BatchingQueue,
    client: Arc<IngestClient>,
    counters: DiagnosticCounters,
}

impl Pipeline {
    /// Build the ingest client and start the batching worker.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(settings: PipelineSettings, state: &ProvisioningState) -> Result<Self> {
        let counters = DiagnosticCounters::new();
        let client = Arc::new(IngestClient::new(
            settings.base_url,
            settings.token,
            state.ingest_target(),
            settings.ingest,
            counters.clone(),
        )?);

        info!(
            ingest_url = %client.ingest_url(),
            batch_size = settings.batch.batch_size,
            "Starting history pipeline"
        );

        let sink: Arc<dyn BatchSink> = client.clone();
        let queue = BatchingQueue::start(settings.batch, sink, counters.clone());

        Ok(Self {
            filter: RwLock::new(Arc::new(EntityFilter::new(&settings.filter))),
            queue,
            client,
            counters,
        })
    }

    /// Probe the ingest endpoint and record the result in diagnostics.
    pub async fn check_connectivity(&self) -> bool {
        self.client.check_connectivity().await
    }

    /// Filter and enqueue one hub state change. Returns true if it was queued.
    pub fn handle_state_change(&self, event: StateChangeEvent) -> bool {
        let filter = self.current_filter();
        let rule = filter.evaluate(&event.entity_id, &event.device_class);

        if !rule.admits() {
            trace!(entity_id = %event.entity_id, rule = %rule, "Event filtered out");
            return false;
        }

        self.queue.enqueue(event)
    }

    /// Swap in a new filter. Events already queued are unaffected.
    pub fn replace_filter(&self, config: &FilterConfig) {
        let compiled = Arc::new(EntityFilter::new(config));
        *self
            .filter
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = compiled;
        debug!("Entity filter replaced");
    }

    pub fn counters(&self) -> &DiagnosticCounters {
        &self.counters
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.counters.snapshot()
    }

    /// Cut the active batch now.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Stop intake and wait until every queued batch is accounted.
    pub async fn shutdown(&self) {
        info!("Shutting down history pipeline");
        self.queue.shutdown().await;

        let snapshot = self.diagnostics();
        info!(
            events_sent = snapshot.events_sent,
            events_dropped = snapshot.events_dropped,
            "History pipeline stopped"
        );
    }

    fn current_filter(&self) -> Arc<EntityFilter> {
        Arc::clone(
            &self
                .filter
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}
