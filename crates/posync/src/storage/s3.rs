use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use posync_common::{Result, SyncError};
use tracing::{debug, info, instrument};

use super::{config::StorageConfig, ListPage, ObjectEntry, ObjectStore};

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig) -> Self {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            path_style = config.path_style,
            "Initializing object store"
        );

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "posync-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            }
            None => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(bucket = %config.bucket, "Object store client initialized");

        Self { client }
    }
}

fn transfer_error(action: &str, key: &str, err: impl std::error::Error) -> SyncError {
    SyncError::Transfer(format!("{action} {key}: {}", DisplayErrorContext(err)))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list_page(&self, bucket: &str, continuation: Option<String>) -> Result<ListPage> {
        let mut request = self.client.list_objects_v2().bucket(bucket);
        if let Some(token) = continuation {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transfer_error("list", bucket, e))?;

        let entries: Vec<ObjectEntry> = response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectEntry {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                })
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        debug!(
            count = entries.len(),
            truncated = next_token.is_some(),
            "Listed object page"
        );

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| transfer_error("get", key, e))?;

        Ok(response.body)
    }

    #[instrument(skip(self, body))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| transfer_error("put", key, e))?;

        debug!("Uploaded s3://{}/{}", bucket, key);
        Ok(())
    }
}
