// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Coordinated Shutdown
//!
//! Shutdown flows from the edge inward: the consumer stops taking
//! deliveries and drains, producers reject what is still pending, an
//! optional user callback runs, and finally the shared connection cores are
//! reset. A callback failure propagates; it is not swallowed.

use crate::connection::ConnectionCore;
use crate::consumer::Consumer;
use crate::errors::ClientError;
use crate::producer::Producer;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Options for a single component shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownOptions {
    /// How long to wait for in-flight work before giving up.
    pub timeout: Duration,
    /// Skip waiting and cancel in-flight work immediately.
    pub force: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        ShutdownOptions {
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            force: false,
        }
    }
}

impl ShutdownOptions {
    pub fn forced() -> Self {
        ShutdownOptions {
            force: true,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of a component shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownResult {
    /// True when no work was left behind.
    pub success: bool,
    /// Handlers or requests still outstanding when shutdown completed.
    pub pending_count: usize,
    /// True when the drain deadline was reached with work still pending.
    pub timed_out: bool,
}

impl ShutdownResult {
    pub(crate) fn clean() -> Self {
        ShutdownResult {
            success: true,
            pending_count: 0,
            timed_out: false,
        }
    }
}

/// Aggregated outcome of an orchestrated shutdown.
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    pub consumer: Option<ShutdownResult>,
    pub producers: Vec<ShutdownResult>,
    pub total_pending: usize,
}

type ShutdownCallback = Box<dyn Fn() -> BoxFuture<'static, Result<(), ClientError>> + Send + Sync>;

/// Sequences consumer, producers, user callback, and connection reset.
pub struct ShutdownOrchestrator {
    consumer: Option<Arc<Consumer>>,
    producers: Vec<Arc<Producer>>,
    timeout: Duration,
    on_shutdown: Option<ShutdownCallback>,
}

impl ShutdownOrchestrator {
    pub fn new() -> Self {
        ShutdownOrchestrator {
            consumer: None,
            producers: Vec::new(),
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            on_shutdown: None,
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_producer(mut self, producer: Arc<Producer>) -> Self {
        self.producers.push(producer);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), ClientError>> + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Box::new(callback));
        self
    }

    /// Runs the shutdown sequence. Consumer first so no new deliveries
    /// arrive, then producers so their waiters settle, then the user
    /// callback (whose error propagates), then the connection registry.
    pub async fn run(&self) -> Result<ShutdownSummary, ClientError> {
        let mut summary = ShutdownSummary::default();

        if let Some(consumer) = &self.consumer {
            let result = consumer
                .shutdown(ShutdownOptions {
                    timeout: self.timeout,
                    force: false,
                })
                .await;
            summary.total_pending += result.pending_count;
            summary.consumer = Some(result);
        }

        for producer in &self.producers {
            let result = producer
                .shutdown(ShutdownOptions {
                    timeout: self.timeout,
                    force: true,
                })
                .await;
            summary.total_pending += result.pending_count;
            summary.producers.push(result);
        }

        if let Some(callback) = &self.on_shutdown {
            callback().await?;
        }

        ConnectionCore::reset_all().await;
        Ok(summary)
    }
}

impl Default for ShutdownOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for the process-signal glue.
#[derive(Debug, Clone)]
pub struct GracefulShutdownOptions {
    pub exit_process: bool,
    pub exit_code: i32,
}

impl Default for GracefulShutdownOptions {
    fn default() -> Self {
        GracefulShutdownOptions {
            exit_process: false,
            exit_code: 0,
        }
    }
}

/// Registers SIGTERM/SIGINT hooks that run the orchestrator once.
pub fn setup_graceful_shutdown(
    orchestrator: ShutdownOrchestrator,
    options: GracefulShutdownOptions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        match orchestrator.run().await {
            Ok(summary) => {
                info!(pending = summary.total_pending, "graceful shutdown complete")
            }
            Err(err) => error!(error = err.to_string(), "shutdown callback failed"),
        }
        if options.exit_process {
            std::process::exit(options.exit_code);
        }
    })
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!(error = err.to_string(), "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
