use core::future::Future;

use async_trait::async_trait;

use crate::error::Result;

/// Loads an entity from the source of truth when the cache cannot answer.
///
/// `Ok(None)` means the entity does not exist; the cache remembers that for
/// a short while. Any `Err` is passed back to the caller (pass-through
/// reads) or logged (background rebuilds) and nothing is written.
///
/// Async closures taking the id by value implement this trait directly:
///
/// ```
/// use flashgate::{Error, Loader, Result};
///
/// # async fn run() -> Result<()> {
/// let loader = |id: u64| async move {
///     Ok::<_, Error>(if id == 1 { Some("one".to_string()) } else { None })
/// };
/// assert_eq!(loader.load(&1).await?, Some("one".to_string()));
/// assert_eq!(loader.load(&2).await?, None);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Loader<ID, V>: Send + Sync {
    async fn load(&self, id: &ID) -> Result<Option<V>>;
}

#[async_trait]
impl<ID, V, F, Fut> Loader<ID, V> for F
where
    ID: Clone + Send + Sync + 'static,
    V: Send + 'static,
    F: Fn(ID) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<V>>> + Send,
{
    async fn load(&self, id: &ID) -> Result<Option<V>> {
        (self)(id.clone()).await
    }
}
