use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};

use crate::config::StorageConfig;
use crate::error::{MarketDashError, MarketDashResult};

/// The only component that knows which object-store vendor is behind the
/// presigned uploads. S3 covers MinIO/Supabase/AWS; Memory backs the tests.
#[derive(Clone)]
pub enum ObjectStorage {
    S3(Arc<object_store::aws::AmazonS3>),
    Memory(Arc<object_store::memory::InMemory>),
}

impl ObjectStorage {
    pub fn from_config(cfg: &StorageConfig) -> MarketDashResult<Self> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&cfg.endpoint)
            .with_bucket_name(&cfg.bucket)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .with_region(&cfg.region)
            .with_allow_http(cfg.endpoint.starts_with("http://"))
            .build()
            .map_err(|e| MarketDashError::Storage(format!("storage init: {}", e)))?;
        Ok(ObjectStorage::S3(Arc::new(store)))
    }

    pub fn memory() -> Self {
        ObjectStorage::Memory(Arc::new(object_store::memory::InMemory::new()))
    }

    fn as_generic(&self) -> Arc<dyn ObjectStore> {
        match self {
            ObjectStorage::S3(store) => store.clone() as Arc<dyn ObjectStore>,
            ObjectStorage::Memory(store) => store.clone() as Arc<dyn ObjectStore>,
        }
    }

    /// Time-bound PUT URL for a direct client upload.
    pub async fn presign_put(
        &self,
        key: &str,
        _content_type: &str,
        ttl: Duration,
    ) -> MarketDashResult<String> {
        match self {
            ObjectStorage::S3(store) => {
                let url = store.signed_url(Method::PUT, &Path::from(key), ttl).await?;
                Ok(url.to_string())
            }
            // The memory store has nothing to sign; tests PUT through the
            // adapter directly.
            ObjectStorage::Memory(_) => Ok(format!("memory:///{}", key)),
        }
    }

    /// Byte stream of an object without buffering it whole.
    pub async fn stream_get(
        &self,
        key: &str,
    ) -> MarketDashResult<BoxStream<'static, object_store::Result<Bytes>>> {
        let result = self.as_generic().get(&Path::from(key)).await?;
        Ok(result.into_stream())
    }

    pub async fn get_bytes(&self, key: &str) -> MarketDashResult<Bytes> {
        let result = self.as_generic().get(&Path::from(key)).await?;
        Ok(result.bytes().await?)
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> MarketDashResult<()> {
        self.as_generic()
            .put(&Path::from(key), PutPayload::from(bytes))
            .await?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> MarketDashResult<bool> {
        match self.as_generic().head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, key: &str) -> MarketDashResult<()> {
        match self.as_generic().delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip_and_head() {
        let storage = ObjectStorage::memory();
        let key = "uploads/j1/report.csv";
        assert!(!storage.exists(key).await.unwrap());

        storage
            .put(key, Bytes::from_static(b"date,product\n"))
            .await
            .unwrap();
        assert!(storage.exists(key).await.unwrap());
        assert_eq!(
            storage.get_bytes(key).await.unwrap(),
            Bytes::from_static(b"date,product\n")
        );

        storage.delete(key).await.unwrap();
        assert!(!storage.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn missing_object_maps_to_not_found() {
        let storage = ObjectStorage::memory();
        let err = storage.get_bytes("nope").await.unwrap_err();
        assert!(matches!(err, crate::error::MarketDashError::NotFound));
    }
}
