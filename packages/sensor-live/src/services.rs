use std::sync::{Arc, OnceLock};
use tracing::info;

use crate::config::LiveConfig;
use crate::multiplexer::{ConnectionMultiplexer, Subscription};
use crate::pull::{FetchAndApply, HttpPull};
use crate::scheduler::{RefreshController, RefreshScheduler};
use crate::sse::SseTransport;
use crate::synchronizer::SharedSynchronizer;
use crate::traits::{
    ElementLookup, LiveResult, PullTransport, PushTransport, RefreshNotifier, SnapshotSink,
};

/// Live-data services shared by every dashboard view
///
/// Built once by the application and passed around by reference. The
/// multiplexer is created lazily on first use and never rebuilt.
pub struct LiveServices {
    config: LiveConfig,
    transport: Arc<dyn PushTransport>,
    multiplexer: OnceLock<ConnectionMultiplexer>,
}

impl LiveServices {
    pub fn new(config: LiveConfig, transport: Arc<dyn PushTransport>) -> Self {
        Self {
            config,
            transport,
            multiplexer: OnceLock::new(),
        }
    }

    /// Build services backed by the SSE transport
    pub fn from_config(config: LiveConfig) -> LiveResult<Self> {
        config.validate()?;
        let transport = SseTransport::from_config(&config)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// The shared connection multiplexer; the same instance on every call
    pub fn multiplexer(&self) -> &ConnectionMultiplexer {
        self.multiplexer.get_or_init(|| {
            info!(
                "Connection multiplexer initialized (event types: {})",
                self.config.event_types.join(",")
            );
            ConnectionMultiplexer::with_event_types(
                self.transport.clone(),
                self.config.event_types.clone(),
            )
        })
    }

    /// Route the push updates of `topics` into a view's synchronizer
    pub fn bind_view<L>(&self, topics: &[String], synchronizer: &SharedSynchronizer<L>) -> Vec<Subscription>
    where
        L: ElementLookup + 'static,
    {
        topics
            .iter()
            .map(|topic| {
                self.multiplexer()
                    .subscribe_handler(topic.clone(), synchronizer.handler())
            })
            .collect()
    }

    /// Start polling the configured snapshot URL; `None` when none is configured
    pub fn start_refresh(
        &self,
        pull: Arc<dyn PullTransport>,
        sink: Arc<dyn SnapshotSink>,
        notifier: Arc<dyn RefreshNotifier>,
    ) -> Option<RefreshController> {
        let url = self.config.snapshot_url.clone()?;
        info!("Polling snapshots from {}", url);

        let operation = FetchAndApply::new(pull, url, sink);
        Some(RefreshScheduler::spawn(
            Arc::new(operation),
            self.config.refresh_policy(),
            notifier,
        ))
    }

    /// `start_refresh` over HTTP with the configured request timeout
    pub fn start_http_refresh(
        &self,
        sink: Arc<dyn SnapshotSink>,
        notifier: Arc<dyn RefreshNotifier>,
    ) -> LiveResult<Option<RefreshController>> {
        if self.config.snapshot_url.is_none() {
            return Ok(None);
        }
        let pull = HttpPull::from_config(&self.config)?;
        Ok(self.start_refresh(Arc::new(pull), sink, notifier))
    }
}
