//! Hierarchical cancellation of spawned tasks.

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};

/// Cancellation flag plus the tasks it governs. Stopping a group stops all its children.
#[derive(Clone)]
pub(crate) struct StopGroup {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<StopGroup>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StopGroup {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    /// New group that is stopped whenever `self` is.
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Child of `parent` if there is one, otherwise a new root group.
    pub fn child_of(parent: Option<&StopGroup>) -> Self {
        match parent {
            Some(parent) => parent.child(),
            None => Self::new(),
        }
    }

    fn with_parent(parent: Option<StopGroup>) -> Self {
        let (tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                tx,
                parent,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn stop(&self) {
        self.inner.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .map(|parent| parent.is_stopped())
                .unwrap_or(false)
    }

    /// Completes once this group or any of its ancestors is stopped.
    pub fn stopped(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.inner.tx.subscribe();
        let parent = self.inner.parent.clone();

        Box::pin(async move {
            let own = async move {
                // The sender lives as long as `self`, which the caller keeps alive.
                let _ = rx.wait_for(|stopped| *stopped).await;
            };

            match parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => (),
                        _ = parent.stopped() => (),
                    }
                }
                None => own.await,
            }
        })
    }

    /// Spawns a task that is dropped at its next suspension point once the group stops.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stopped = self.stopped();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = future => (),
                _ = stopped => (),
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Waits for every task spawned in this group, including those spawned while waiting.
    pub async fn wait(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                break;
            }

            for task in tasks {
                if let Err(error) = task.await {
                    if error.is_panic() {
                        log::error!("task panicked: {}", error);
                    }
                }
            }
        }
    }

    pub async fn stop_and_wait(&self) {
        self.stop();
        self.wait().await;
    }
}
