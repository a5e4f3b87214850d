//! Object transfer bridge to the local object layer.
//!
//! The engine decides which object operations to replay; this client hands
//! them to the local object layer's internal API, which owns the actual
//! payload movement and conflict handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftio_core::{BucketShard, DriftError, ObjectTransfer, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ObjectOpRequest<'a> {
    source_zone: &'a str,
    bucket_name: &'a str,
    bucket_id: &'a str,
    shard_id: i32,
    object: &'a str,
    instance: &'a str,
    versioned_epoch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct HttpTransfer {
    client: Client,
    endpoint: String,
}

impl HttpTransfer {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_op(&self, path: &str, request: &ObjectOpRequest<'_>) -> Result<()> {
        let url = Url::parse(&format!("{}{}", self.endpoint, path))
            .map_err(|error| DriftError::Http(error.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|error| DriftError::Http(error.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DriftError::ObjectNotFound(format!(
                "{}/{}",
                request.bucket_name, request.object
            )));
        }

        if !response.status().is_success() {
            return Err(DriftError::Http(format!(
                "object op {} failed: status={} bucket={} object={}",
                path,
                response.status(),
                request.bucket_name,
                request.object
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ObjectTransfer for HttpTransfer {
    async fn fetch_object(
        &self,
        source_zone: &str,
        bucket: &BucketShard,
        key: &driftio_core::ObjKey,
        versioned_epoch: u64,
    ) -> Result<()> {
        self.post_op(
            "/internal/v1/sync/fetch",
            &ObjectOpRequest {
                source_zone,
                bucket_name: &bucket.bucket_name,
                bucket_id: &bucket.bucket_id,
                shard_id: bucket.shard_id,
                object: &key.name,
                instance: &key.instance,
                versioned_epoch,
                timestamp: None,
            },
        )
        .await
    }

    async fn remove_object(
        &self,
        source_zone: &str,
        bucket: &BucketShard,
        key: &driftio_core::ObjKey,
        versioned_epoch: u64,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.post_op(
            "/internal/v1/sync/remove",
            &ObjectOpRequest {
                source_zone,
                bucket_name: &bucket.bucket_name,
                bucket_id: &bucket.bucket_id,
                shard_id: bucket.shard_id,
                object: &key.name,
                instance: &key.instance,
                versioned_epoch,
                timestamp,
            },
        )
        .await
    }
}
