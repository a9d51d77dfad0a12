//! Remote object store access
//!
//! [`ObjectStore`] is the seam between the pipeline and the blob store. The
//! backend implements three primitives; pagination and suffix filtering are
//! layered on top by [`ObjectStore::list_all`].

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use posync_common::{Result, SyncError};

pub mod config;
pub mod s3;

pub use config::StorageConfig;
pub use s3::S3ObjectStore;

/// One listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: i64,
}

/// One bounded listing page
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Present while the listing is truncated
    pub next_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one page, starting after `continuation` when given
    async fn list_page(&self, bucket: &str, continuation: Option<String>) -> Result<ListPage>;

    /// Open an object for reading. Fails with `Transfer`.
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream>;

    /// Write an object. Fails with `Transfer`.
    async fn put(&self, bucket: &str, key: &str, body: ByteStream, content_type: &str)
        -> Result<()>;

    /// Every object whose key ends with `suffix`, following continuation
    /// tokens lazily until the listing is exhausted
    fn list_all<'a>(&'a self, bucket: &'a str, suffix: &'a str) -> BoxStream<'a, Result<ObjectEntry>> {
        stream::try_unfold(Some(None::<String>), move |cursor| async move {
            let Some(continuation) = cursor else {
                return Ok::<_, SyncError>(None);
            };
            let page = self.list_page(bucket, continuation).await?;
            let next = page.next_token.filter(|t| !t.is_empty()).map(Some);
            Ok::<_, SyncError>(Some((page.entries, next)))
        })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok::<_, SyncError>)))
        .try_flatten()
        .try_filter(move |entry| futures::future::ready(entry.key.ends_with(suffix)))
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves `keys` two per page
    struct PagedKeys {
        keys: Vec<&'static str>,
    }

    #[async_trait]
    impl ObjectStore for PagedKeys {
        async fn list_page(&self, _bucket: &str, continuation: Option<String>) -> Result<ListPage> {
            let start: usize = continuation.map_or(0, |t| t.parse().unwrap());
            let end = (start + 2).min(self.keys.len());
            Ok(ListPage {
                entries: self.keys[start..end]
                    .iter()
                    .map(|key| ObjectEntry {
                        key: key.to_string(),
                        size: 1,
                    })
                    .collect(),
                next_token: (end < self.keys.len()).then(|| end.to_string()),
            })
        }

        async fn get(&self, _bucket: &str, key: &str) -> Result<ByteStream> {
            Err(SyncError::Transfer(format!("get {key}: not served")))
        }

        async fn put(&self, _bucket: &str, _key: &str, _body: ByteStream, _content_type: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_list_all_follows_pages_and_filters_suffix() {
        let store = PagedKeys {
            keys: vec!["a.zip", "notes.txt", "b.zip", "c.ZIP", "d.zip"],
        };

        let keys: Vec<String> = store
            .list_all("bucket", ".zip")
            .map_ok(|entry| entry.key)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(keys, vec!["a.zip", "b.zip", "d.zip"]);
    }
}
