// SPDX-License-Identifier: MIT OR Apache-2.0

//! Named side-channels multiplexed over replication.
//!
//! An extension is a `(name, handler)` pair. Registration advertises the
//! name to peers; incoming extension payloads dispatch to the handler with
//! the sending peer's id. The registry is shared by every session of a log.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tidelog_sync::Replicator;

/// Callback receiving `(peer, payload)` for one named channel.
pub type ExtensionHandler = Arc<dyn Fn(u64, Vec<u8>) + Send + Sync>;

/// Shared extension registry.
#[derive(Clone, Default)]
pub struct Extensions {
    inner: Arc<Mutex<HashMap<String, ExtensionHandler>>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: ExtensionHandler) {
        self.inner
            .lock()
            .expect("extension registry")
            .insert(name.to_owned(), handler);
    }

    pub fn unregister(&self, name: &str) {
        self.inner.lock().expect("extension registry").remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .lock()
            .expect("extension registry")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Route one incoming payload to its handler; unknown names are dropped.
    pub fn dispatch(&self, name: &str, peer: u64, payload: Vec<u8>) {
        let handler = {
            let registry = self.inner.lock().expect("extension registry");
            registry.get(name).cloned()
        };
        if let Some(handler) = handler {
            handler(peer, payload);
        }
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("names", &self.names())
            .finish()
    }
}

/// Sending side of one registered extension.
#[derive(Clone)]
pub struct ExtensionHandle {
    name: String,
    replicator: Replicator,
}

impl ExtensionHandle {
    pub(crate) fn new(name: String, replicator: Replicator) -> Self {
        Self { name, replicator }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a payload to one peer.
    pub async fn send(&self, peer: u64, payload: Vec<u8>) {
        self.replicator
            .send_extension(&self.name, payload, Some(peer))
            .await;
    }

    /// Send a payload to every connected peer.
    pub async fn broadcast(&self, payload: Vec<u8>) {
        self.replicator.send_extension(&self.name, payload, None).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::Extensions;

    #[test]
    fn dispatch_routes_to_the_named_handler() {
        let extensions = Extensions::new();
        let hits = Arc::new(AtomicU64::new(0));
        let seen = hits.clone();
        extensions.register(
            "chat",
            Arc::new(move |peer, payload| {
                assert_eq!(peer, 7);
                assert_eq!(payload, b"hey");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        extensions.dispatch("chat", 7, b"hey".to_vec());
        extensions.dispatch("unknown", 7, b"dropped".to_vec());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn names_are_sorted() {
        let extensions = Extensions::new();
        extensions.register("b", Arc::new(|_, _| {}));
        extensions.register("a", Arc::new(|_, _| {}));
        assert_eq!(extensions.names(), vec!["a".to_owned(), "b".to_owned()]);
        extensions.unregister("a");
        assert_eq!(extensions.names(), vec!["b".to_owned()]);
    }
}
