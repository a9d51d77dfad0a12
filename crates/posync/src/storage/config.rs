use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_REGION: &str = "us-east-2";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials; when either half is absent the default AWS
    /// provider chain is used instead
    pub access_key: Option<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|e| !e.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_default(),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    pub fn for_aws(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: region.into(),
            bucket: bucket.into(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }

    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint, Some("http://localhost:9000".to_string()));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
        assert_eq!(
            config.static_credentials(),
            Some(("minioadmin", "minioadmin"))
        );
    }

    #[test]
    fn test_for_aws_uses_provider_chain() {
        let config = StorageConfig::for_aws("us-west-2", "my-bucket");
        assert_eq!(config.endpoint, None);
        assert_eq!(config.region, "us-west-2");
        assert!(!config.path_style);
        assert!(config.static_credentials().is_none());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::remove_var("S3_BUCKET");
        assert!(StorageConfig::from_env().unwrap().bucket.is_empty());

        std::env::set_var("S3_BUCKET", "invoices");
        std::env::remove_var("S3_REGION");
        let config = StorageConfig::from_env().unwrap();
        assert_eq!(config.bucket, "invoices");
        assert_eq!(config.region, DEFAULT_REGION);

        std::env::remove_var("S3_BUCKET");
    }
}
