//! Unique job runner -- at most one in-flight job per key.
//!
//! The first caller for a key spawns the job; callers arriving while it runs
//! attach as followers and receive a clone of the same result. The job runs
//! on its own task, so a caller that gives up does not cancel it for the rest.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job ended without a result (panicked or the runtime shut down).
    #[error("job abandoned before completion")]
    Abandoned,
}

type Waiters<T> = Vec<oneshot::Sender<T>>;

pub struct UniqueJobRunner<K, T> {
    inflight: Arc<Mutex<HashMap<K, Waiters<T>>>>,
}

impl<K, T> Clone for UniqueJobRunner<K, T> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

impl<K, T> Default for UniqueJobRunner<K, T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<K, T>(m: &Mutex<HashMap<K, Waiters<T>>>) -> MutexGuard<'_, HashMap<K, Waiters<T>>> {
    // Critical sections never panic mid-update, so a poisoned map is still consistent.
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the key on drop, releasing any followers still waiting.
struct Completion<K: Eq + Hash, T> {
    key: Option<K>,
    inflight: Arc<Mutex<HashMap<K, Waiters<T>>>>,
}

impl<K: Eq + Hash, T: Clone> Completion<K, T> {
    fn finish(mut self, result: T) {
        if let Some(key) = self.key.take() {
            let waiters = lock(&self.inflight).remove(&key).unwrap_or_default();
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

impl<K: Eq + Hash, T> Drop for Completion<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.inflight).remove(&key);
        }
    }
}

impl<K, T> UniqueJobRunner<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` for `key`, or wait for the run already in flight.
    ///
    /// `job` is only invoked when this caller starts the run.
    pub async fn run<F, Fut>(&self, key: K, job: F) -> Result<T, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let start = {
            let mut inflight = lock(&self.inflight);
            match inflight.get_mut(&key) {
                Some(waiters) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    inflight.insert(key.clone(), vec![tx]);
                    true
                }
            }
        };

        if start {
            let fut = job();
            let completion = Completion {
                key: Some(key),
                inflight: self.inflight.clone(),
            };
            tokio::spawn(async move {
                let result = fut.await;
                completion.finish(result);
            });
        }

        rx.await.map_err(|_| JobError::Abandoned)
    }

    pub fn is_running(&self, key: &K) -> bool {
        lock(&self.inflight).contains_key(key)
    }
}
