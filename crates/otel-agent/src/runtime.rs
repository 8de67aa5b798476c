//! Agent runtime.
//!
//! Builds the service from a configuration and the compiled-in factories,
//! starts it, and keeps it running until a shutdown signal (SIGINT, SIGTERM)
//! arrives or the runtime's cancellation token fires. Shutdown always runs,
//! whatever ended the wait.

use crate::components::default_factories;
use crate::error::{AgentError, Result};
use otel_agent_pipeline::{BuildInfo, Factories, Service, ServiceConfig};
use tokio_util::sync::CancellationToken;

/// Runs one service until told to stop.
pub struct Runtime {
    config: ServiceConfig,
    factories: Factories,
    build_info: BuildInfo,
    cancel_token: CancellationToken,
}

impl Runtime {
    /// Creates a runtime using every built-in component.
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in factories conflict.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Ok(Self::with_factories(config, default_factories()?))
    }

    /// Creates a runtime resolving components through `factories`.
    pub fn with_factories(config: ServiceConfig, factories: Factories) -> Self {
        Self {
            config,
            factories,
            build_info: BuildInfo::default(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Overrides the build information reported to components.
    pub fn with_build_info(mut self, build_info: BuildInfo) -> Self {
        self.build_info = build_info;
        self
    }

    /// Returns a handle to the cancellation token.
    ///
    /// Cancelling it stops a running [`Runtime::run`] as a signal would.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Builds, starts and runs the service until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not describe a valid
    /// graph, if any component fails to start, or if shutdown reports
    /// failures. A failed start has already stopped what it started.
    pub async fn run(self) -> Result<()> {
        let service = Service::new(self.build_info, &self.config, &self.factories)?;
        tracing::debug!(?service, "Service built");

        service.start().await?;

        let waited = wait_for_shutdown(&self.cancel_token).await;
        if let Err(e) = &waited {
            tracing::error!(error = %e, "Signal handling failed, shutting down");
        }

        service.shutdown().await?;
        waited
    }
}

async fn wait_for_shutdown(cancel_token: &CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate()).map_err(AgentError::Signal)?;
        tokio::select! {
            () = cancel_token.cancelled() => tracing::debug!("Shutdown requested"),
            result = tokio::signal::ctrl_c() => {
                result.map_err(AgentError::Signal)?;
                tracing::info!("Received SIGINT");
            }
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        () = cancel_token.cancelled() => tracing::debug!("Shutdown requested"),
        result = tokio::signal::ctrl_c() => {
            result.map_err(AgentError::Signal)?;
            tracing::info!("Received Ctrl-C");
        }
    }

    Ok(())
}
