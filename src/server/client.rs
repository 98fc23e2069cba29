//! HTTP transport between replicas

use crate::cluster::{ReplicaClient, ReplicaReply};
use crate::common::{Error, Result};
use crate::server::http::{PROXY_HEADER, TIMESTAMP_HEADER};
use bytes::Bytes;
use std::time::Duration;

/// Proxies entity requests to peers over HTTP. Node ids are base URLs.
#[derive(Debug, Clone)]
pub struct HttpReplicaClient {
    http: reqwest::Client,
}

impl HttpReplicaClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    fn entity_url(node: &str) -> String {
        format!("{}/v0/entity", node.trim_end_matches('/'))
    }

    fn id_param(key: &[u8]) -> [(&'static str, String); 1] {
        [("id", String::from_utf8_lossy(key).into_owned())]
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<ReplicaReply> {
        let response = request.header(PROXY_HEADER, "true").send().await?;
        let status = response.status().as_u16();
        let timestamp = match response.headers().get(TIMESTAMP_HEADER) {
            None => None,
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|v| v.parse::<i64>().ok())
                    .filter(|ts| *ts > 0)
                    .ok_or_else(|| {
                        Error::Protocol(format!("bad {} header: {:?}", TIMESTAMP_HEADER, value))
                    })?,
            ),
        };
        let body = response.bytes().await?;
        Ok(ReplicaReply {
            status,
            timestamp,
            body,
        })
    }
}

impl ReplicaClient for HttpReplicaClient {
    async fn get(&self, node: &str, key: &[u8]) -> Result<ReplicaReply> {
        let request = self
            .http
            .get(Self::entity_url(node))
            .query(&Self::id_param(key));
        self.send(request).await
    }

    async fn put(&self, node: &str, key: &[u8], value: Bytes) -> Result<ReplicaReply> {
        let request = self
            .http
            .put(Self::entity_url(node))
            .query(&Self::id_param(key))
            .body(value);
        self.send(request).await
    }

    async fn delete(&self, node: &str, key: &[u8]) -> Result<ReplicaReply> {
        let request = self
            .http
            .delete(Self::entity_url(node))
            .query(&Self::id_param(key));
        self.send(request).await
    }
}
