use crate::error::{PackError, Result};
use crate::peer::AcquireRequest;
use crate::transport::wire::{
    wire_blobs_to_exports, WireAcquireRequest, WireAcquireResponse, WireError, WireLeaseRequest,
};
use crate::transport::{RemoteLease, Transport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Header carrying the client-supplied idempotency key for seal/release.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// JSON-over-HTTP adapter. Handles are path-style only; memory blobs
/// surface as opaque tokens.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, op: &str) -> String {
        format!("{}/{}", self.base_url, op)
    }

    async fn lease_op(
        &self,
        op: &str,
        lease_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let mut request = self.client.post(self.url(op)).json(&WireLeaseRequest {
            lease_id: lease_id.to_string(),
        });
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }
        let response = request.send().await?;
        check(response).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<WireError>().await {
        Ok(wire) => Err(wire.into_err()),
        Err(_) => Err(PackError::Transport(format!("http status {}", status))),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn acquire(&self, req: &AcquireRequest) -> Result<RemoteLease> {
        let body = WireAcquireRequest::from(req);
        let response = self
            .client
            .post(self.url("acquire"))
            .json(&body)
            .send()
            .await?;
        let payload: WireAcquireResponse = check(response).await?.json().await?;

        let blobs = wire_blobs_to_exports(payload.blobs, &mut [])?;
        Ok(RemoteLease {
            lease_id: payload.lease_id,
            object_id: payload.object.objid,
            state: payload.object.state,
            seal_ts: payload
                .object
                .seal_ts_ms
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64)),
            blobs,
        })
    }

    async fn seal(&self, lease_id: &str, idempotency_key: Option<&str>) -> Result<()> {
        self.lease_op("seal", lease_id, idempotency_key).await
    }

    async fn discard(&self, lease_id: &str) -> Result<()> {
        self.lease_op("discard", lease_id, None).await
    }

    async fn release(&self, lease_id: &str, idempotency_key: Option<&str>) -> Result<()> {
        self.lease_op("release", lease_id, idempotency_key).await
    }

    async fn renew(&self, lease_id: &str) -> Result<()> {
        self.lease_op("renew", lease_id, None).await
    }
}
