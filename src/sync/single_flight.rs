//! Keyed in-flight coalescing.
//!
//! Concurrent callers with the same key share one underlying future and
//! all observe its result; callers with different keys run in parallel.
//! The entry is removed once its future completes, so a later call with
//! the same key starts fresh work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex as StdMutex;

use futures::future::{BoxFuture, FutureExt, Shared};

pub struct SingleFlight<T: Clone> {
    inflight: StdMutex<HashMap<String, Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: StdMutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight call for `key`, or start one with `make`.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let fut = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let fut = make().boxed().shared();
                    inflight.insert(key.to_string(), fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        // Only the future we awaited may be evicted; a newer flight for
        // the same key must survive.
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(current) = inflight.get(key) {
            if Shared::ptr_eq(current, &fut) {
                inflight.remove(key);
            }
        }

        result
    }
}
