//! One component instance serving several signals.
//!
//! A factory that wants a single instance per id (a receiver running one HTTP
//! server for traces, metrics and logs, say) keeps a [`SharedComponents`] map
//! and returns the same [`SharedComponent`] from each of its per-signal
//! constructors. The graph then sees one node per signal, but the wrapped
//! component is started once and shut down once.

use crate::component::{Component, ComponentId, Host};
use crate::error::ComponentError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

type Entries<C> = Mutex<HashMap<ComponentId, Arc<SharedComponent<C>>>>;

/// Map of shared instances, keyed by component id.
pub struct SharedComponents<C> {
    entries: Arc<Entries<C>>,
}

impl<C> Default for SharedComponents<C> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<C: Component> SharedComponents<C> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the instance for `id`, creating it with `create` if absent.
    ///
    /// # Errors
    ///
    /// Propagates the error of `create`; nothing is stored in that case.
    pub fn get_or_add<F>(
        &self,
        id: &ComponentId,
        create: F,
    ) -> Result<Arc<SharedComponent<C>>, ComponentError>
    where
        F: FnOnce() -> Result<C, ComponentError>,
    {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = entries.get(id) {
            return Ok(Arc::clone(existing));
        }

        let shared = Arc::new(SharedComponent {
            id: id.clone(),
            inner: Arc::new(create()?),
            state: tokio::sync::Mutex::new(State::Created),
            owner: Arc::downgrade(&self.entries),
        });
        entries.insert(id.clone(), Arc::clone(&shared));
        Ok(shared)
    }

    /// Returns the live instance for `id`.
    pub fn get(&self, id: &ComponentId) -> Option<Arc<SharedComponent<C>>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the number of live instances.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Returns whether no instance is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Stopped,
}

/// A component started on the first call to `start` and stopped on the first
/// call to `shutdown`.
///
/// Stopping removes the instance from its [`SharedComponents`] map so a later
/// build creates a fresh one.
pub struct SharedComponent<C> {
    id: ComponentId,
    inner: Arc<C>,
    state: tokio::sync::Mutex<State>,
    owner: Weak<Entries<C>>,
}

impl<C> SharedComponent<C> {
    /// Returns the wrapped component.
    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }
}

#[async_trait]
impl<C: Component> Component for SharedComponent<C> {
    async fn start(&self, host: &dyn Host) -> Result<(), ComponentError> {
        let mut state = self.state.lock().await;
        if *state != State::Created {
            return Ok(());
        }
        self.inner.start(host).await?;
        *state = State::Started;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ComponentError> {
        let mut state = self.state.lock().await;
        if *state == State::Stopped {
            return Ok(());
        }
        *state = State::Stopped;
        if let Some(entries) = self.owner.upgrade() {
            entries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&self.id);
        }
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticHost;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        starts: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl Component for Counting {
        async fn start(&self, _host: &dyn Host) -> Result<(), ComponentError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ComponentError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_same_id_returns_same_instance() {
        let shared = SharedComponents::<Counting>::new();
        let id: ComponentId = "otlp".parse().unwrap();
        let a = shared.get_or_add(&id, || Ok(Counting::default())).unwrap();
        let b = shared
            .get_or_add(&id, || panic!("must not create twice"))
            .unwrap();
        assert!(Arc::ptr_eq(a.inner(), b.inner()));
        assert!(Arc::ptr_eq(shared.get(&id).unwrap().inner(), a.inner()));
        assert_eq!(shared.len(), 1);
    }

    #[tokio::test]
    async fn test_starts_and_stops_once() {
        let shared = SharedComponents::<Counting>::new();
        let id: ComponentId = "otlp".parse().unwrap();
        let host = StaticHost::new();
        let traces = shared.get_or_add(&id, || Ok(Counting::default())).unwrap();
        let logs = shared.get_or_add(&id, || Ok(Counting::default())).unwrap();

        traces.start(&host).await.unwrap();
        logs.start(&host).await.unwrap();
        traces.shutdown().await.unwrap();
        logs.shutdown().await.unwrap();

        assert_eq!(traces.inner().starts.load(Ordering::SeqCst), 1);
        assert_eq!(traces.inner().shutdowns.load(Ordering::SeqCst), 1);
        assert!(shared.is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_stores_nothing() {
        let shared = SharedComponents::<Counting>::new();
        let id: ComponentId = "otlp".parse().unwrap();
        let result = shared.get_or_add(&id, || Err(ComponentError::start("bind failed")));
        assert!(result.is_err());
        assert!(shared.is_empty());
    }
}
