//! The consumer contract between components.
//!
//! Every hand-off inside a pipeline is a call to [`Consumer::consume`]. A
//! consumer either accepts the batch or fails with a [`ConsumeError`] that tells
//! the caller whether retrying could help.

use crate::context::Context;
use async_trait::async_trait;
use otel_agent_pdata::Batch;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error used as the source of consume failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Capabilities a consumer advertises to whoever feeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// The consumer modifies the batches it receives. Fan-outs hand such
    /// consumers an independent copy.
    pub mutates_data: bool,
}

impl Capabilities {
    /// Capabilities of a consumer that only reads.
    pub const READ_ONLY: Capabilities = Capabilities {
        mutates_data: false,
    };

    /// Capabilities of a consumer that modifies its input.
    pub const MUTATES: Capabilities = Capabilities { mutates_data: true };

    /// Combines the capabilities of two chained consumers.
    #[must_use]
    pub fn merge(self, other: Capabilities) -> Capabilities {
        Capabilities {
            mutates_data: self.mutates_data || other.mutates_data,
        }
    }
}

/// Accepts batches of one signal type.
#[async_trait]
pub trait Consumer<T: Batch>: Send + Sync {
    /// Returns what this consumer does with the batches it receives.
    fn capabilities(&self) -> Capabilities;

    /// Consumes one batch.
    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError>;
}

/// Shared handle onto a consumer.
pub type DynConsumer<T> = Arc<dyn Consumer<T>>;

/// Failure of a consume call.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// A retry may succeed.
    #[error("transient error: {0}")]
    Transient(#[source] BoxError),

    /// Retrying will not help; the data is dropped.
    #[error("permanent error: {0}")]
    Permanent(#[source] BoxError),

    /// A sending queue rejected the batch because it is full or stopped.
    #[error("sending queue is full")]
    QueueFull,

    /// The caller's context was cancelled before the call completed.
    #[error("request is cancelled or timed out")]
    Cancelled,

    /// Retrying was interrupted because the exporter is shutting down.
    #[error("interrupted due to shutdown: {0}")]
    Shutdown(#[source] BoxError),

    /// Several downstream consumers failed.
    #[error("{}", display_joined(.0))]
    Joined(Vec<ConsumeError>),
}

fn display_joined(errors: &[ConsumeError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConsumeError {
    /// Wraps an error as retryable.
    pub fn transient(error: impl Into<BoxError>) -> Self {
        Self::Transient(error.into())
    }

    /// Wraps an error as not retryable.
    pub fn permanent(error: impl Into<BoxError>) -> Self {
        Self::Permanent(error.into())
    }

    /// Joins a list of errors.
    ///
    /// Returns `Ok(())` for an empty list and the error itself for a list of one.
    pub fn join(mut errors: Vec<ConsumeError>) -> Result<(), ConsumeError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConsumeError::Joined(errors)),
        }
    }

    /// Returns whether retrying cannot succeed. A joined error is permanent
    /// if any of its members is.
    pub fn is_permanent(&self) -> bool {
        match self {
            ConsumeError::Permanent(_) | ConsumeError::QueueFull => true,
            ConsumeError::Joined(errors) => errors.iter().any(ConsumeError::is_permanent),
            ConsumeError::Transient(_) | ConsumeError::Cancelled | ConsumeError::Shutdown(_) => {
                false
            }
        }
    }

    /// Returns whether the error, or any joined member, is a full queue.
    pub fn is_queue_full(&self) -> bool {
        match self {
            ConsumeError::QueueFull => true,
            ConsumeError::Joined(errors) => errors.iter().any(ConsumeError::is_queue_full),
            _ => false,
        }
    }

    /// Returns whether the error was caused by an exporter shutting down.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ConsumeError::Shutdown(_))
    }
}

/// A consumer backed by an async closure.
pub struct FnConsumer<T, F> {
    capabilities: Capabilities,
    func: F,
    _batch: PhantomData<fn(T)>,
}

impl<T, F, Fut> FnConsumer<T, F>
where
    T: Batch,
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send,
{
    /// Creates a consumer calling `func` for every batch.
    pub fn new(capabilities: Capabilities, func: F) -> Self {
        Self {
            capabilities,
            func,
            _batch: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Consumer<T> for FnConsumer<T, F>
where
    T: Batch,
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send,
{
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        (self.func)(ctx.clone(), batch).await
    }
}

impl<T, F> fmt::Debug for FnConsumer<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConsumer")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Forwards to another consumer while advertising different capabilities.
///
/// The graph puts one at the head of every pipeline so that receivers see the
/// combined capabilities of the processors behind it.
pub struct CapabilitiesConsumer<T: Batch> {
    next: DynConsumer<T>,
    capabilities: Capabilities,
}

impl<T: Batch> CapabilitiesConsumer<T> {
    /// Wraps `next`, advertising `capabilities`.
    pub fn new(next: DynConsumer<T>, capabilities: Capabilities) -> Self {
        Self { next, capabilities }
    }
}

#[async_trait]
impl<T: Batch> Consumer<T> for CapabilitiesConsumer<T> {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn consume(&self, ctx: &Context, batch: T) -> Result<(), ConsumeError> {
        self.next.consume(ctx, batch).await
    }
}
