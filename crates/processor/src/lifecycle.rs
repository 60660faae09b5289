//! Process lifecycle for one view
//!
//! Startup reads the checkpoint, opens the source right after it and starts
//! the consumer. The runner then waits for either the shutdown signal, which
//! leads to a graceful stop, or a fatal termination of the consumer.

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use viewsync_types::{CheckpointScope, StartOffset};

use crate::checkpoint::{CheckpointGuard, CheckpointStore};
use crate::config::ConsumerConfig;
use crate::consumer::{
    CheckpointingConsumer, ConsumerHandle, ConsumerReport, ExitProcess, FatalHandler,
};
use crate::error::Result;
use crate::materializer::Materializer;
use crate::source::SourceConnector;

/// Runs one view from checkpoint load to graceful stop
pub struct ViewRunner {
    scope: CheckpointScope,
    connector: Arc<dyn SourceConnector>,
    materializer: Arc<dyn Materializer>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ConsumerConfig,
    fatal: Arc<dyn FatalHandler>,
}

impl ViewRunner {
    pub fn new(
        scope: CheckpointScope,
        connector: Arc<dyn SourceConnector>,
        materializer: Arc<dyn Materializer>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            scope,
            connector,
            materializer,
            checkpoints,
            config,
            fatal: Arc::new(ExitProcess),
        }
    }

    /// Replace the fatal error handler, [`ExitProcess`] by default
    pub fn with_fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal = handler;
        self
    }

    /// Load the checkpoint, connect the source and start consuming
    ///
    /// With no checkpoint the source starts at the oldest retained message;
    /// otherwise right after the checkpoint.
    pub async fn start(self) -> Result<ConsumerHandle> {
        self.config.validate()?;

        let guard = Arc::new(CheckpointGuard::new(
            self.checkpoints.clone(),
            self.scope.clone(),
        ));
        let checkpoint = guard.load().await?;
        let start = StartOffset::resume_after(checkpoint);

        info!(
            scope = %self.scope,
            checkpoint = ?checkpoint,
            start = %start,
            "Opening source"
        );
        let source = self.connector.connect(&self.scope, start).await?;

        let consumer = CheckpointingConsumer::new(
            self.scope,
            source,
            self.materializer,
            guard,
            self.config,
        )?
        .with_fatal_handler(self.fatal);

        Ok(consumer.start())
    }

    /// Run until `shutdown` resolves, then stop gracefully
    ///
    /// Returns early with the error if the consumer fails first.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ConsumerReport>
    where
        F: Future<Output = ()> + Send,
    {
        let scope = self.scope.clone();
        let mut handle = self.start().await?;

        tokio::select! {
            _ = shutdown => {
                info!(scope = %scope, "Shutdown requested");
            }
            _ = handle.terminated() => {
                warn!(scope = %scope, state = %handle.state(), "Consumer terminated");
            }
        }

        handle.stop().await
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
