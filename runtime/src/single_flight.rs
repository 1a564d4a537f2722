//! Single-flight coalescing of concurrent loads.
//!
//! Concurrent misses for the same key elect one leader to run the origin
//! loader; every waiter receives a clone of the leader's result. The result
//! itself is not cached here — callers decide what to do with failures.
//!
//! # Example
//!
//! ```rust
//! use vigil_runtime::single_flight::SingleFlight;
//!
//! # async fn example() {
//! let flights: SingleFlight<String, u32> = SingleFlight::new();
//! let value = flights
//!     .run("user:42".to_string(), || async { 7 })
//!     .await;
//! assert_eq!(value, 7);
//! # }
//! ```

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

/// Per-key coalescing map.
///
/// Cloning is cheap; clones share the in-flight table.
#[derive(Debug)]
pub struct SingleFlight<K, T> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<T>>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    /// Create an empty coalescing map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `loader` for `key`, coalescing with any in-flight load.
    ///
    /// The first caller for a key becomes the leader and runs the loader;
    /// callers arriving while the load is in flight wait for the leader's
    /// result instead of running the loader again. If the leader vanishes
    /// (cancelled mid-load), a waiter promotes itself and loads.
    pub async fn run<F, Fut>(&self, key: K, loader: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        // Subscribe-or-lead under the lock so no waiter can miss the send.
        let mut receiver = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    inflight.insert(key.clone(), sender);
                    drop(inflight);

                    let result = loader().await;

                    // Remove-then-send under the lock: late arrivals either
                    // subscribed in time or become the next leader.
                    let mut inflight = self.inflight.lock().await;
                    if let Some(sender) = inflight.remove(&key) {
                        let _ = sender.send(result.clone());
                    }
                    return result;
                }
            }
        };

        match receiver.recv().await {
            Ok(result) => result,
            // Leader dropped without sending; promote ourselves.
            Err(_) => Box::pin(self.run(key, loader)).await,
        }
    }

    /// Number of loads currently in flight.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }
}
