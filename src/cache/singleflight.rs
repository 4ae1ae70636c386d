//! Single-flight coalescing for cache fills.
//!
//! The first caller for a key is elected leader and runs the computation;
//! concurrent callers for the same key wait on the leader's broadcast
//! result instead of recomputing. A leader that fails (or is dropped before
//! publishing) clears the registry entry so the next caller re-elects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

type Broadcast<T> = Option<std::result::Result<T, String>>;
type Registry<T> = Arc<Mutex<HashMap<String, watch::Receiver<Broadcast<T>>>>>;

/// Outcome of joining a flight for a key.
pub enum Flight<T> {
    /// This caller must run the computation and publish via the guard.
    Leader(FlightGuard<T>),
    /// Another caller computed the value; this is the broadcast result.
    Waited(std::result::Result<T, String>),
}

/// Held by the leader; publishes the result and clears the registry entry.
pub struct FlightGuard<T> {
    key: String,
    tx: watch::Sender<Broadcast<T>>,
    registry: Registry<T>,
}

impl<T: Clone> FlightGuard<T> {
    /// Publish the computation result to all waiters.
    pub fn complete(self, result: std::result::Result<T, String>) {
        let _ = self.tx.send(Some(result));
        // Drop clears the registry entry after the broadcast is visible.
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.registry.lock() {
            map.remove(&self.key);
        }
        // If complete() never ran, dropping `tx` closes the channel and
        // waiters re-elect.
    }
}

/// Per-key in-flight registry.
pub struct SingleFlight<T> {
    registry: Registry<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + Sync> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`: become leader or wait for one.
    pub async fn join(&self, key: &str) -> Flight<T> {
        loop {
            let mut rx = {
                let mut map = match self.registry.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(rx) = map.get(key) {
                    rx.clone()
                } else {
                    let (tx, rx) = watch::channel(None);
                    map.insert(key.to_string(), rx);
                    return Flight::Leader(FlightGuard {
                        key: key.to_string(),
                        tx,
                        registry: Arc::clone(&self.registry),
                    });
                }
            };

            let waited = rx.wait_for(|v| v.is_some()).await.map(|v| v.clone());
            match waited {
                Ok(value) => {
                    if let Some(result) = value {
                        return Flight::Waited(result);
                    }
                }
                // Leader dropped without publishing; re-elect.
                Err(_) => continue,
            }
        }
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registry.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_leader_then_waiter() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let guard = match flights.join("k").await {
            Flight::Leader(guard) => guard,
            Flight::Waited(_) => panic!("first caller must lead"),
        };

        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move { flights.join("k").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.complete(Ok(42));

        match waiter.await.unwrap() {
            Flight::Waited(Ok(v)) => assert_eq!(v, 42),
            _ => panic!("second caller must wait"),
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_broadcast_and_reelected() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let guard = match flights.join("k").await {
            Flight::Leader(guard) => guard,
            Flight::Waited(_) => panic!(),
        };
        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move { flights.join("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.complete(Err("boom".to_string()));

        match waiter.await.unwrap() {
            Flight::Waited(Err(msg)) => assert_eq!(msg, "boom"),
            _ => panic!("waiter must observe the failure"),
        }

        // Registry entry is gone, so the next join re-elects.
        assert!(matches!(flights.join("k").await, Flight::Leader(_)));
    }

    #[tokio::test]
    async fn test_dropped_leader_triggers_reelection() {
        let flights: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());

        let guard = match flights.join("k").await {
            Flight::Leader(guard) => guard,
            Flight::Waited(_) => panic!(),
        };
        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move { flights.join("k").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        // The waiter re-elects itself leader.
        match waiter.await.unwrap() {
            Flight::Leader(guard) => guard.complete(Ok(7)),
            Flight::Waited(_) => panic!("waiter should have re-elected"),
        }
    }

    #[tokio::test]
    async fn test_many_concurrent_joins_single_leader() {
        let flights: Arc<SingleFlight<u64>> = Arc::new(SingleFlight::new());
        let leaders = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flights = Arc::clone(&flights);
            let leaders = Arc::clone(&leaders);
            handles.push(tokio::spawn(async move {
                match flights.join("shared").await {
                    Flight::Leader(guard) => {
                        leaders.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        guard.complete(Ok(99));
                        99
                    }
                    Flight::Waited(result) => result.unwrap(),
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 99);
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }
}
