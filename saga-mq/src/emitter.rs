use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

// Deliveries waiting for a slow handler; with prefetch 1 per queue the
// backlog stays tiny in practice.
const HANDLER_BACKLOG: usize = 100;

/// Registry mapping an event or command key to the one handler registered for
/// it. The first registration for a key wins; later ones are ignored.
pub struct Emitter<H, K>
where
    H: Send + 'static,
    K: Eq + Hash + Send + 'static,
{
    handlers: Arc<Mutex<HashMap<K, mpsc::Sender<H>>>>,
}

impl<H, K> Clone for Emitter<H, K>
where
    H: Send + 'static,
    K: Eq + Hash + Send + 'static,
{
    fn clone(&self) -> Self {
        Emitter {
            handlers: self.handlers.clone(),
        }
    }
}

impl<H, K> fmt::Debug for Emitter<H, K>
where
    H: Send + 'static,
    K: Eq + Hash + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

impl<H, K> Default for Emitter<H, K>
where
    H: Send + 'static,
    K: Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<H, K> Emitter<H, K>
where
    H: Send + 'static,
    K: Eq + Hash + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Emitter {
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn subscribe(&self, key: K) -> mpsc::Receiver<H> {
        let (tx, rx) = mpsc::channel(HANDLER_BACKLOG);
        self.handlers.lock().await.entry(key).or_insert(tx);
        rx
    }

    /// Registers `handler` for `key` and drains its deliveries sequentially on
    /// a dedicated task, preserving per-queue ordering.
    pub async fn on<F, Fut>(&self, key: K, mut handler: F)
    where
        F: FnMut(H) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.subscribe(key).await;
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                handler(data).await;
            }
        });
    }

    pub(crate) async fn emit(&self, key: K, data: H) {
        let handlers = self.handlers.lock().await;
        if let Some(sender) = handlers.get(&key) {
            let _ = sender.send(data).await;
        }
    }
}
