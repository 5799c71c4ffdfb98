//! Correlation engine: registry plus its background tasks.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::CorrelationConfig;
use crate::dispatcher::ReplyDispatcher;
use crate::registry::PendingReplyRegistry;
use crate::requester::Requester;
use crate::stats::StatsSnapshot;
use crate::sweeper::ExpirySweeper;
use crate::transport::{reply_channel, LoopbackBehavior, LoopbackBroker, ReplyReceiver, Transport};

/// Owns the registry, the reply dispatcher task and the expiry sweeper task.
///
/// Must be started inside a tokio runtime. Dropping the engine stops its
/// tasks; [`CorrelationEngine::shutdown`] additionally waits for them and
/// fails every request still pending.
pub struct CorrelationEngine<T: Transport> {
    config: CorrelationConfig,
    registry: PendingReplyRegistry,
    requester: Requester<T>,
    dispatcher: ReplyDispatcher,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: Transport> CorrelationEngine<T> {
    /// Start an engine sending through `transport` and consuming `replies`.
    pub fn start(config: CorrelationConfig, transport: Arc<T>, replies: ReplyReceiver) -> Self {
        let registry = PendingReplyRegistry::new(&config);
        let requester = Requester::new(registry.clone(), transport, &config);
        let dispatcher = ReplyDispatcher::new(registry.clone());
        let sweeper = ExpirySweeper::new(registry.clone(), config.sweep_interval());
        let shutdown = CancellationToken::new();

        let dispatcher_task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let shutdown = shutdown.clone();
            async move {
                dispatcher.run(replies, shutdown).await;
            }
            .instrument(info_span!("reply_dispatcher"))
        });

        let sweeper_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                sweeper.run(shutdown).await;
            }
            .instrument(info_span!("expiry_sweeper"))
        });

        info!(
            mode = ?config.mode,
            request_timeout_ms = config.request_timeout_ms,
            "Correlation engine started"
        );

        Self {
            config,
            registry,
            requester,
            dispatcher,
            shutdown,
            tasks: vec![dispatcher_task, sweeper_task],
        }
    }

    pub fn requester(&self) -> &Requester<T> {
        &self.requester
    }

    pub fn registry(&self) -> &PendingReplyRegistry {
        &self.registry
    }

    /// Dispatcher for transports that push replies from their own threads.
    pub fn dispatcher(&self) -> &ReplyDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.registry.stats()
    }

    /// Stop the background tasks and fail every pending request.
    pub async fn shutdown(mut self) -> StatsSnapshot {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                warn!(error = %error, "Correlation engine task ended abnormally");
            }
        }

        let failed = self.registry.close_all();
        let stats = self.registry.stats();
        info!(
            failed,
            delivered = stats.delivered,
            timeouts = stats.timeouts,
            "Correlation engine stopped"
        );
        stats
    }
}

impl CorrelationEngine<LoopbackBroker> {
    /// Start an engine wired to a fresh in-memory broker.
    pub fn with_loopback(
        config: CorrelationConfig,
        behavior: LoopbackBehavior,
    ) -> (Self, Arc<LoopbackBroker>) {
        let (reply_tx, reply_rx) = reply_channel(config.reply_channel_capacity());
        let broker = Arc::new(LoopbackBroker::new(reply_tx, behavior));
        let engine = Self::start(config, Arc::clone(&broker), reply_rx);
        (engine, broker)
    }
}

impl<T: Transport> Drop for CorrelationEngine<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
