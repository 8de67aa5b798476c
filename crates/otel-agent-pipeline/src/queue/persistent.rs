//! Queue persisted in a storage extension.
//!
//! Layout of the storage namespace:
//!
//! | key | value |
//! |-----|-------|
//! | `ri` | read index, next item to hand to a worker |
//! | `wi` | write index, slot of the next offered item |
//! | `di` | indices handed to workers and not yet acknowledged |
//! | `<index>` | marshaled batch |
//!
//! Items are delivered in write-index order. A worker acknowledges an item
//! once its send finished, which deletes the value and drops the index from
//! `di`. Whatever is left in `di` at the next start was in flight when the
//! process stopped and is offered again at the tail.

use super::index::{
    DISPATCHED_KEY, READ_INDEX_KEY, WRITE_INDEX_KEY, decode_index, decode_indices,
    encode_index, encode_indices, item_key,
};
use super::{DropFn, Queue, QueueError, QueueSettings, SendFn};
use crate::component::{ComponentId, Host, Kind};
use crate::consumer::ConsumeError;
use crate::context::Context;
use crate::storage::{Operation, StorageClient};
use async_trait::async_trait;
use otel_agent_pdata::Batch;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A FIFO kept in a storage extension with at-least-once delivery.
pub struct PersistentQueue<T: Batch> {
    inner: Arc<Inner<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner<T: Batch> {
    capacity: usize,
    num_workers: usize,
    storage: ComponentId,
    owner: ComponentId,
    kind: Kind,
    state: tokio::sync::Mutex<State>,
    // One permit per queued item; closed on shutdown.
    tokens: Semaphore,
    size: AtomicUsize,
    stopped: AtomicBool,
    send: SendFn<T>,
    on_drop: Option<DropFn<T>>,
    ctx: Context,
}

#[derive(Default)]
struct State {
    client: Option<Arc<dyn StorageClient>>,
    // The startup reference plus one per item being sent.
    refs: usize,
    read_index: u64,
    write_index: u64,
    dispatched: Vec<u64>,
    stopped: bool,
}

enum Claim<T> {
    Stopped,
    Empty,
    Dropped,
    Item(u64, T),
}

impl<T: Batch> PersistentQueue<T> {
    /// Creates a queue of at most `capacity` items stored through the
    /// extension `storage`, drained by `num_workers` workers.
    pub fn new(
        capacity: usize,
        num_workers: usize,
        storage: ComponentId,
        settings: QueueSettings<T>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                num_workers,
                storage,
                owner: settings.owner,
                kind: settings.kind,
                state: tokio::sync::Mutex::new(State::default()),
                tokens: Semaphore::new(0),
                size: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                send: settings.send,
                on_drop: settings.on_drop,
                ctx: Context::background(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Batch> Inner<T> {
    fn reject(&self, batch: T, err: QueueError) -> QueueError {
        if let Some(on_drop) = &self.on_drop {
            on_drop(batch);
        }
        err
    }

    async fn open_client(&self, host: &dyn Host) -> Result<Arc<dyn StorageClient>, QueueError> {
        let extension =
            host.extensions()
                .get(&self.storage)
                .ok_or_else(|| QueueError::NoStorageClient {
                    id: self.storage.clone(),
                    source: None,
                })?;
        let storage = extension
            .as_storage()
            .ok_or_else(|| QueueError::WrongExtensionType(self.storage.clone()))?;
        storage
            .get_client(self.kind, &self.owner, T::SIGNAL)
            .await
            .map_err(|e| QueueError::NoStorageClient {
                id: self.storage.clone(),
                source: Some(e),
            })
    }

    async fn load_indices(
        &self,
        state: &mut State,
        client: &dyn StorageClient,
    ) -> Result<(), QueueError> {
        let mut ops = [
            Operation::get(READ_INDEX_KEY),
            Operation::get(WRITE_INDEX_KEY),
        ];
        client.batch(&mut ops).await?;
        let [read, write] = ops;
        state.read_index = read.value.as_deref().map(decode_index).transpose()?.unwrap_or(0);
        state.write_index = write
            .value
            .as_deref()
            .map(decode_index)
            .transpose()?
            .unwrap_or(0);
        if state.read_index > state.write_index {
            return Err(QueueError::InvalidIndex("read index is past write index"));
        }
        self.size.store(
            (state.write_index - state.read_index) as usize,
            Ordering::Release,
        );
        Ok(())
    }

    /// Moves every item left dispatched by the previous run to the tail.
    async fn recover_dispatched(
        &self,
        state: &mut State,
        client: &dyn StorageClient,
    ) -> Result<(), QueueError> {
        let Some(bytes) = client.get(DISPATCHED_KEY).await? else {
            return Ok(());
        };
        let dispatched = decode_indices(&bytes)?;
        if dispatched.is_empty() {
            return Ok(());
        }
        tracing::info!(
            count = dispatched.len(),
            "Re-enqueueing items dispatched before the last shutdown"
        );

        let mut ops: Vec<Operation> = std::iter::once(Operation::set(
            DISPATCHED_KEY,
            encode_indices(&[]),
        ))
        .chain(dispatched.iter().map(|index| Operation::get(item_key(*index))))
        .collect();
        client.batch(&mut ops).await?;

        let mut recovered = Vec::with_capacity(dispatched.len());
        for (index, op) in dispatched.iter().zip(&ops[1..]) {
            let Some(value) = op.value.as_deref() else {
                tracing::warn!(index, "Dispatched item missing from storage, skipping");
                continue;
            };
            match T::unmarshal(value) {
                Ok(batch) => {
                    // Recovered items bypass the capacity check.
                    if let Err(e) = self.put(state, client, &batch).await {
                        tracing::error!(index, error = %e, "Failed to re-enqueue dispatched item");
                        continue;
                    }
                    recovered.push(*index);
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "Dispatched item could not be decoded, skipping");
                }
            }
        }

        let mut deletes: Vec<Operation> = dispatched
            .iter()
            .map(|index| Operation::delete(item_key(*index)))
            .collect();
        if let Err(e) = client.batch(&mut deletes).await {
            tracing::warn!(error = %e, "Failed to delete re-enqueued items");
        }
        tracing::debug!(recovered = recovered.len(), "Recovery finished");
        Ok(())
    }

    /// Writes `batch` at the write index. The index only advances once the
    /// storage batch succeeded.
    async fn put(
        &self,
        state: &mut State,
        client: &dyn StorageClient,
        batch: &T,
    ) -> Result<(), QueueError> {
        let index = state.write_index;
        let next = index + 1;
        let mut ops = [
            Operation::set(WRITE_INDEX_KEY, encode_index(next)),
            Operation::set(item_key(index), batch.marshal()),
        ];
        client.batch(&mut ops).await?;
        state.write_index = next;
        self.size.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn claim(&self) -> Claim<T> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Claim::Stopped;
        }
        let Some(client) = state.client.clone() else {
            return Claim::Stopped;
        };
        if state.read_index == state.write_index {
            return Claim::Empty;
        }

        let index = state.read_index;
        state.read_index += 1;
        state.dispatched.push(index);
        self.size.fetch_sub(1, Ordering::AcqRel);

        let mut ops = [
            Operation::set(READ_INDEX_KEY, encode_index(state.read_index)),
            Operation::set(DISPATCHED_KEY, encode_indices(&state.dispatched)),
            Operation::get(item_key(index)),
        ];
        if let Err(e) = client.batch(&mut ops).await {
            tracing::error!(index, error = %e, "Failed to claim item, dropping it");
            self.remove_dispatched(&mut state, client.as_ref(), index)
                .await;
            return Claim::Dropped;
        }

        let [_, _, value] = ops;
        let Some(bytes) = value.value else {
            tracing::warn!(index, "Claimed item missing from storage, dropping it");
            self.remove_dispatched(&mut state, client.as_ref(), index)
                .await;
            return Claim::Dropped;
        };
        match T::unmarshal(&bytes) {
            Ok(batch) => {
                state.refs += 1;
                Claim::Item(index, batch)
            }
            Err(e) => {
                tracing::error!(index, error = %e, "Claimed item could not be decoded, dropping it");
                self.remove_dispatched(&mut state, client.as_ref(), index)
                    .await;
                Claim::Dropped
            }
        }
    }

    /// Called once the send of a claimed item finished.
    async fn acknowledge(&self, index: u64, result: Result<(), ConsumeError>) {
        let mut state = self.state.lock().await;
        match (&result, state.client.clone()) {
            // Left in `di` so the next start delivers it again.
            (Err(e), _) if e.is_shutdown() => {
                tracing::debug!(index, "Send interrupted by shutdown, keeping item");
            }
            (_, Some(client)) => {
                self.remove_dispatched(&mut state, client.as_ref(), index)
                    .await;
            }
            (_, None) => {}
        }
        self.unref(&mut state).await;
    }

    async fn remove_dispatched(&self, state: &mut State, client: &dyn StorageClient, index: u64) {
        state.dispatched.retain(|i| *i != index);
        let dispatched = encode_indices(&state.dispatched);
        let key = item_key(index);

        let mut ops = [
            Operation::set(DISPATCHED_KEY, dispatched.clone()),
            Operation::delete(key.clone()),
        ];
        let Err(e) = client.batch(&mut ops).await else {
            return;
        };
        tracing::warn!(index, error = %e, "Failed to acknowledge item, retrying step by step");
        if let Err(e) = client.delete(&key).await {
            tracing::warn!(index, error = %e, "Failed to delete acknowledged item");
        }
        if let Err(e) = client.set(DISPATCHED_KEY, dispatched).await {
            tracing::warn!(index, error = %e, "Failed to update dispatched items");
        }
    }

    /// Drops one client reference, closing the client on the last one.
    async fn unref(&self, state: &mut State) {
        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 {
            return;
        }
        if let Some(client) = state.client.take()
            && let Err(e) = client.close().await
        {
            tracing::warn!(error = %e, "Failed to close storage client");
        }
    }

    async fn run_worker(self: Arc<Self>) {
        loop {
            match self.tokens.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return,
            }
            let (index, batch) = match self.claim().await {
                Claim::Stopped => return,
                Claim::Empty | Claim::Dropped => continue,
                Claim::Item(index, batch) => (index, batch),
            };
            let result = (self.send)(self.ctx.clone(), batch).await;
            self.acknowledge(index, result).await;
        }
    }
}

#[async_trait]
impl<T: Batch> Queue<T> for PersistentQueue<T> {
    async fn offer(&self, _ctx: &Context, batch: T) -> Result<(), QueueError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return Err(inner.reject(batch, QueueError::QueueFull));
        }

        let mut state = inner.state.lock().await;
        let Some(client) = state.client.clone() else {
            drop(state);
            return Err(inner.reject(batch, QueueError::NotStarted));
        };
        if state.stopped {
            drop(state);
            return Err(inner.reject(batch, QueueError::QueueFull));
        }
        if (state.write_index - state.read_index) as usize >= inner.capacity {
            drop(state);
            return Err(inner.reject(batch, QueueError::QueueFull));
        }
        if let Err(e) = inner.put(&mut state, client.as_ref(), &batch).await {
            drop(state);
            return Err(inner.reject(batch, e));
        }
        drop(state);

        inner.tokens.add_permits(1);
        Ok(())
    }

    async fn start(&self, host: &dyn Host) -> Result<(), QueueError> {
        let inner = &self.inner;
        let client = inner.open_client(host).await?;

        {
            let mut state = inner.state.lock().await;
            state.client = Some(Arc::clone(&client));
            state.refs = 1;
            inner.load_indices(&mut state, client.as_ref()).await?;
            inner.recover_dispatched(&mut state, client.as_ref()).await?;
            inner
                .tokens
                .add_permits((state.write_index - state.read_index) as usize);
        }

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..inner.num_workers {
            workers.push(tokio::spawn(Arc::clone(inner).run_worker()));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.state.lock().await.stopped = true;
        inner.tokens.close();

        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "queue worker panicked");
            }
        }

        // Release the reference taken at start.
        let mut state = inner.state.lock().await;
        if state.client.is_some() {
            inner.unref(&mut state).await;
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.size.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
