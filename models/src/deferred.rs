/*!
`Deferred` is a value that may only become known after some asynchronous work completes, such as an
installer image reference that depends on a schematic id returned by the image factory.

A `Deferred` is cheap to clone and resolves at most once: every clone observes the same result. Values are
derived from it with `map`, which keeps the ordering between producer and consumer explicit without blocking a
thread or polling for readiness.
*/

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The error observed by every consumer of a failed `Deferred`.
pub type DeferredError<E> = Arc<E>;

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, DeferredError<E>>>>;

pub struct Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    inner: SharedResult<T, E>,
}

impl<T, E> Clone for Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Deferred {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    E: Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peek() {
            Some(Ok(value)) => f.debug_tuple("Deferred::Resolved").field(value).finish(),
            Some(Err(err)) => f.debug_tuple("Deferred::Failed").field(err).finish(),
            None => f.write_str("Deferred::Pending"),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Wraps a future whose output will become the deferred value.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Deferred {
            inner: future.map(|result| result.map_err(Arc::new)).boxed().shared(),
        }
    }

    /// A value which is already known.
    pub fn ready(value: T) -> Self {
        Deferred {
            inner: futures::future::ready(Ok(value)).boxed().shared(),
        }
    }

    /// Derives a new deferred value by applying a pure function once this one resolves.
    pub fn map<U, F>(&self, f: F) -> Deferred<U, E>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred {
            inner: async move { inner.await.map(f) }.boxed().shared(),
        }
    }

    /// Waits for the value.
    pub async fn resolve(&self) -> Result<T, DeferredError<E>> {
        self.inner.clone().await
    }

    /// Returns the value without waiting, if it has already been resolved successfully.
    pub fn peek(&self) -> Option<T> {
        match self.inner.peek() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Boom;

    #[tokio::test]
    async fn test_map() {
        let schematic: Deferred<String, Boom> = Deferred::ready("abc123".to_string());
        let installer = schematic.map(|id| format!("factory.talos.dev/nocloud-installer/{}:v1.9.0", id));

        assert_eq!(
            installer.resolve().await.unwrap(),
            "factory.talos.dev/nocloud-installer/abc123:v1.9.0"
        );
        assert_eq!(installer.peek().as_deref(), Some("factory.talos.dev/nocloud-installer/abc123:v1.9.0"));
    }

    #[tokio::test]
    async fn test_resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let deferred: Deferred<u32, Boom> = Deferred::new(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });

        let doubled = deferred.map(|v| v * 2);
        assert_eq!(deferred.resolve().await.unwrap(), 7);
        assert_eq!(doubled.resolve().await.unwrap(), 14);
        assert_eq!(deferred.clone().resolve().await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let deferred: Deferred<u32, Boom> = Deferred::new(async { Err(Boom) });
        let mapped = deferred.map(|v| v + 1);

        assert_eq!(*mapped.resolve().await.unwrap_err(), Boom);
        assert_eq!(*deferred.resolve().await.unwrap_err(), Boom);
        assert!(mapped.peek().is_none());
    }
}
