//! Pending-request table keyed by outgoing frame id.
//!
//! One primitive: register an id, get a receiver, resolve it with the first
//! matching reply. Backs both peer send-and-await and the MCP stdio dialog.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::HubError;

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Pending<T> {
    tx: oneshot::Sender<T>,
    filter: Option<Filter<T>>,
}

/// Correlates replies to outstanding requests by id.
///
/// Each id has at most one outstanding entry, resolved exactly once: by a
/// matching value, removal on timeout, or [`Correlator::fail_all`] at
/// shutdown.
pub struct Correlator<T> {
    pending: Mutex<HashMap<String, Pending<T>>>,
}

impl<T: Clone + Send + 'static> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Correlator<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register an outstanding request. The returned receiver resolves with
    /// the first value offered under this id that passes `filter`.
    pub fn register(
        &self,
        id: impl Into<String>,
        filter: Option<Filter<T>>,
    ) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        pending.insert(id.into(), Pending { tx, filter });
        rx
    }

    /// Offer a value against a request id. Returns true if a pending entry
    /// accepted it. A value failing the filter leaves the entry untouched.
    pub fn resolve(&self, request_id: &str, value: &T) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(request_id) {
            Some(entry) => {
                if let Some(filter) = &entry.filter {
                    if !filter(value) {
                        return false;
                    }
                }
            }
            None => return false,
        }
        let entry = pending.remove(request_id).unwrap();
        entry.tx.send(value.clone()).is_ok()
    }

    /// Drop a pending entry (timeout path). Late replies find no match and
    /// are discarded.
    pub fn remove(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    /// Fail every outstanding request; awaiters observe `Shutdown`.
    pub fn fail_all(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Await a registered receiver with a deadline. On timeout the pending
    /// entry is removed and `Timeout` returned; a dropped sender maps to
    /// `Shutdown`.
    pub async fn await_reply(
        &self,
        id: &str,
        rx: oneshot::Receiver<T>,
        operation: &str,
        timeout: Duration,
    ) -> Result<T, HubError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(HubError::Shutdown),
            Err(_) => {
                self.remove(id);
                Err(HubError::timeout(operation, timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let correlator: Correlator<String> = Correlator::new();
        let rx = correlator.register("r1", None);
        assert!(correlator.resolve("r1", &"hello".to_string()));
        assert!(!correlator.resolve("r1", &"again".to_string()));
        assert_eq!(rx.await.unwrap(), "hello");
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_filter_leaves_entry_untouched() {
        let correlator: Correlator<u32> = Correlator::new();
        let rx = correlator.register("r1", Some(Box::new(|v: &u32| *v > 10)));
        assert!(!correlator.resolve("r1", &5));
        assert_eq!(correlator.len(), 1);
        assert!(correlator.resolve("r1", &42));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_discards_late_reply() {
        let correlator: Correlator<u32> = Correlator::new();
        let rx = correlator.register("r1", None);
        let err = correlator
            .await_reply("r1", rx, "test", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout { .. }));
        // Late reply finds no pending match.
        assert!(!correlator.resolve("r1", &1));
    }

    #[tokio::test]
    async fn test_fail_all_surfaces_shutdown() {
        let correlator: Correlator<u32> = Correlator::new();
        let rx = correlator.register("r1", None);
        correlator.fail_all();
        let err = correlator
            .await_reply("r1", rx, "test", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, HubError::Shutdown);
    }

    #[tokio::test]
    async fn test_unknown_request_id_ignored() {
        let correlator: Correlator<u32> = Correlator::new();
        assert!(!correlator.resolve("nope", &1));
    }
}
