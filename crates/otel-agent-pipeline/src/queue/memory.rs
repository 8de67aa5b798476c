//! Bounded in-memory queue.

use super::{DropFn, Queue, QueueError, SendFn};
use crate::component::Host;
use crate::context::Context;
use async_trait::async_trait;
use otel_agent_pdata::Batch;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// A bounded FIFO drained by a pool of workers.
///
/// The size counter covers items waiting in the channel and items a worker is
/// still sending, so the number of accepted but unfinished items never exceeds
/// the capacity.
pub struct MemoryQueue<T: Batch> {
    capacity: usize,
    num_workers: usize,
    size: Arc<AtomicUsize>,
    stopped: AtomicBool,
    started: AtomicBool,
    sender: Mutex<Option<flume::Sender<T>>>,
    receiver: flume::Receiver<T>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    send: SendFn<T>,
    on_drop: Option<DropFn<T>>,
    ctx: Context,
}

impl<T: Batch> MemoryQueue<T> {
    /// Creates a queue holding at most `capacity` items, drained by
    /// `num_workers` workers calling `send`.
    pub fn new(
        capacity: usize,
        num_workers: usize,
        send: SendFn<T>,
        on_drop: Option<DropFn<T>>,
    ) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self {
            capacity,
            num_workers,
            size: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::new()),
            send,
            on_drop,
            ctx: Context::background(),
        }
    }

    fn reject(&self, batch: T) -> QueueError {
        if let Some(on_drop) = &self.on_drop {
            on_drop(batch);
        }
        QueueError::QueueFull
    }

    fn claim_slot(&self) -> bool {
        self.size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                (size < self.capacity).then_some(size + 1)
            })
            .is_ok()
    }
}

#[async_trait]
impl<T: Batch> Queue<T> for MemoryQueue<T> {
    async fn offer(&self, _ctx: &Context, batch: T) -> Result<(), QueueError> {
        if self.stopped.load(Ordering::Acquire) || !self.claim_slot() {
            return Err(self.reject(batch));
        }

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            drop(sender);
            self.size.fetch_sub(1, Ordering::AcqRel);
            return Err(self.reject(batch));
        };
        match tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(batch) | flume::TrySendError::Disconnected(batch)) => {
                drop(sender);
                self.size.fetch_sub(1, Ordering::AcqRel);
                Err(self.reject(batch))
            }
        }
    }

    async fn start(&self, _host: &dyn Host) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..self.num_workers {
            let receiver = self.receiver.clone();
            let send = Arc::clone(&self.send);
            let size = Arc::clone(&self.size);
            let ctx = self.ctx.clone();
            workers.push(tokio::spawn(async move {
                while let Ok(batch) = receiver.recv_async().await {
                    if let Err(e) = send(ctx.clone(), batch).await {
                        tracing::trace!(error = %e, "queued batch not delivered");
                    }
                    size.fetch_sub(1, Ordering::AcqRel);
                }
            }));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        self.stopped.store(true, Ordering::Release);
        // Dropping the only sender lets workers exit once the channel is empty.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "queue worker panicked");
            }
        }

        // Items nobody will ever send.
        for batch in self.receiver.drain() {
            self.size.fetch_sub(1, Ordering::AcqRel);
            if let Some(on_drop) = &self.on_drop {
                on_drop(batch);
            }
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
