/// Per-conversation ordered send queue
///
/// Each conversation key owns a chain: a task starts only after the task
/// enqueued before it (same key) has settled, success or failure. Keys are
/// independent, there is no global send lock.
use crate::error::{GatewayError, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

type Tail = Shared<BoxFuture<'static, ()>>;

struct SendChain {
    tail: Tail,
    generation: u64,
}

#[derive(Default)]
struct Chains {
    by_key: HashMap<String, SendChain>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct SendSerializer {
    chains: Arc<Mutex<Chains>>,
}

/// Resolves to the result of one enqueued task.
///
/// Dropping the handle does not cancel the task; it still runs in order.
pub struct SendHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T> Future for SendHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(GatewayError::Internal(format!(
                "send task failed: {}",
                e
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A running task's place in its chain. Dropping it, even while a panic
/// unwinds, releases the successor and clears the chain if this was its tail.
struct ChainLink {
    chains: Arc<Mutex<Chains>>,
    key: String,
    generation: u64,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for ChainLink {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        let mut chains = lock(&self.chains);
        if chains.by_key.get(&self.key).map(|c| c.generation) == Some(self.generation) {
            chains.by_key.remove(&self.key);
            debug!("send chain for {} is idle", self.key);
        }
    }
}

fn lock(chains: &Mutex<Chains>) -> MutexGuard<'_, Chains> {
    chains.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SendSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` to the chain for `key`.
    ///
    /// Position in the chain is fixed by this call, before the returned
    /// handle is ever polled.
    pub fn enqueue<T, F, Fut>(&self, key: &str, task: F) -> SendHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let tail: Tail = async move {
            let _ = done_rx.await;
        }
        .boxed()
        .shared();

        let (previous, generation) = {
            let mut chains = lock(&*self.chains);
            let generation = chains.next_generation;
            chains.next_generation += 1;
            let previous = chains.by_key.insert(
                key.to_string(),
                SendChain {
                    tail: tail.clone(),
                    generation,
                },
            );
            (previous.map(|c| c.tail), generation)
        };

        let link = ChainLink {
            chains: self.chains.clone(),
            key: key.to_string(),
            generation,
            done: Some(done_tx),
        };
        let inner = tokio::spawn(async move {
            if let Some(previous) = previous {
                debug!("send for {} waiting on predecessor", link.key);
                previous.await;
            }
            let result = task().await;
            drop(link);
            result
        });

        SendHandle { inner }
    }

    /// Number of conversations with pending or running sends
    pub fn active_chains(&self) -> usize {
        lock(&*self.chains).by_key.len()
    }
}
