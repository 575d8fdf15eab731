use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};

use super::proto::remote_store_client::RemoteStoreClient;
use super::proto::ApplyRequest;
use super::NetworkError;
use crate::config::RemoteConfig;
use crate::sync::{RawError, RemoteExecutor, SyncOperation};

/// Remote executor speaking the `remote.RemoteStore` gRPC service.
///
/// Connects on first use and reconnects after the remote becomes
/// unavailable. Every call carries the operation id so the server can
/// deduplicate re-dispatches.
pub struct GrpcRemoteExecutor {
    address: String,
    auth_token: Option<String>,
    connect_timeout: Duration,
    client: Mutex<Option<RemoteStoreClient<Channel>>>,
}

impl GrpcRemoteExecutor {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            address: config.address.clone(),
            auth_token: config.auth_token.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            client: Mutex::new(None),
        }
    }

    pub async fn connect(&self) -> Result<RemoteStoreClient<Channel>, NetworkError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(self.address.clone())
            .map_err(|e| NetworkError::InvalidAddress(e.to_string()))?;
        let channel = endpoint
            .connect_timeout(self.connect_timeout)
            .connect()
            .await?;

        log::info!("Connected to remote store at {}", self.address);
        let client = RemoteStoreClient::new(channel);
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn disconnect(&self) {
        self.client.lock().await.take();
    }

    fn build_request(&self, op: &SyncOperation) -> Result<Request<ApplyRequest>, RawError> {
        let payload = serde_json::to_vec(&op.payload)
            .map_err(|e| RawError::Other(format!("payload encoding failed: {e}")))?;

        let mut request = Request::new(ApplyRequest {
            operation_id: op.id.clone(),
            table: op.table.clone(),
            record_id: op.record_id.clone(),
            op_type: op.op_type.as_str().to_string(),
            payload,
            attempt: op.attempt,
        });

        if let Some(token) = self.auth_token.as_deref() {
            let value = MetadataValue::try_from(format!("Bearer {token}"))
                .map_err(|_| RawError::Other("invalid auth token for metadata".to_string()))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

#[async_trait]
impl RemoteExecutor for GrpcRemoteExecutor {
    async fn execute(&self, op: &SyncOperation) -> Result<(), RawError> {
        let mut client = match self.connect().await {
            Ok(client) => client,
            Err(e) => return Err(RawError::Network(e.to_string())),
        };

        let request = self.build_request(op)?;
        match client.apply(request).await {
            Ok(response) if response.get_ref().applied => Ok(()),
            Ok(_) => Err(RawError::Other(format!(
                "remote store did not apply operation {}",
                op.id
            ))),
            Err(status) => {
                if status.code() == Code::Unavailable {
                    self.disconnect().await;
                }
                Err(status_to_raw(&status))
            }
        }
    }
}

/// Translate a gRPC status into the HTTP-style shapes the classifier reads.
pub fn status_to_raw(status: &Status) -> RawError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unauthenticated => RawError::http(401, message),
        Code::PermissionDenied => RawError::http(403, message),
        Code::ResourceExhausted => RawError::http(429, message),
        Code::AlreadyExists | Code::Aborted => RawError::http(409, message),
        Code::InvalidArgument | Code::OutOfRange => RawError::http(400, message),
        Code::NotFound => RawError::http(404, message),
        Code::FailedPrecondition => RawError::http(412, message),
        Code::Unavailable => RawError::Network(message),
        Code::DeadlineExceeded => RawError::Timeout,
        Code::Unimplemented => RawError::http(501, message),
        _ => RawError::http(500, message),
    }
}
