use std::future::Future;

use tokio::task::JoinHandle;
use tracing::error;

use crate::metrics;

/// Spawns a long-running loop that survives panics: a panicking iteration is
/// logged, counted, and the loop restarted from the factory. Returns the
/// supervisor handle; it resolves once the loop finishes cleanly.
pub fn spawn_with_restart<F, Fut>(name: &'static str, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    error!("panic in {name} loop: {err}; restarting");
                    metrics::panics();
                }
                // Cancelled at runtime shutdown.
                Err(_) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn panicking_loop_is_restarted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handle = spawn_with_restart("test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
            }
        });
        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
