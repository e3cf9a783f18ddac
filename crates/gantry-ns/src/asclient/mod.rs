//! Application-server client pool.
//!
//! The network server keeps one long-lived gRPC client per application
//! server hostname. Clients are built lazily on first use, either without
//! transport security (all TLS material empty) or with mutual TLS, and live
//! for the process lifetime; there is no eviction.

pub mod mock;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use gantry_proto::v1::application_server_client::ApplicationServerClient;
use gantry_proto::v1::{HandleDownlinkAckRequest, HandleErrorRequest};
use tokio::sync::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{info, warn};

/// Bound on connection establishment towards an application server.
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Application-server client errors.
#[derive(Debug, thiserror::Error)]
pub enum AsClientError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid TLS configuration: {0}")]
    Tls(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("RPC call failed: {0}")]
    RpcFailed(String),

    #[error("No application-server pool configured")]
    NoPool,
}

/// The application-server API consumed by the core: queue feedback events.
#[async_trait]
pub trait ApplicationServer: Send + Sync {
    /// Report an error related to a device.
    async fn handle_error(&self, req: HandleErrorRequest) -> Result<(), AsClientError>;

    /// Report the (n)acknowledgement of a confirmed downlink.
    async fn handle_downlink_ack(&self, req: HandleDownlinkAckRequest)
        -> Result<(), AsClientError>;
}

/// Cache of application-server clients keyed by hostname.
///
/// The TLS material is trusted to be stable per hostname within a process
/// lifetime; it only participates in client construction, not in the key.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Get (or build) the client for the given `hostname:port`.
    async fn get(
        &self,
        hostname: &str,
        ca_cert: &[u8],
        tls_cert: &[u8],
        tls_key: &[u8],
    ) -> Result<Arc<dyn ApplicationServer>, AsClientError>;
}

/// gRPC-backed application-server client.
pub struct GrpcApplicationServer {
    client: ApplicationServerClient<Channel>,
}

#[async_trait]
impl ApplicationServer for GrpcApplicationServer {
    async fn handle_error(&self, req: HandleErrorRequest) -> Result<(), AsClientError> {
        let mut client = self.client.clone();
        client
            .handle_error(req)
            .await
            .map_err(|e| AsClientError::RpcFailed(e.to_string()))?;
        Ok(())
    }

    async fn handle_downlink_ack(
        &self,
        req: HandleDownlinkAckRequest,
    ) -> Result<(), AsClientError> {
        let mut client = self.client.clone();
        client
            .handle_downlink_ack(req)
            .await
            .map_err(|e| AsClientError::RpcFailed(e.to_string()))?;
        Ok(())
    }
}

/// The process-wide client pool.
pub struct ClientPool {
    // held for the whole lookup+insert, so one client is built per hostname
    clients: Mutex<HashMap<String, Arc<dyn ApplicationServer>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pool for ClientPool {
    async fn get(
        &self,
        hostname: &str,
        ca_cert: &[u8],
        tls_cert: &[u8],
        tls_key: &[u8],
    ) -> Result<Arc<dyn ApplicationServer>, AsClientError> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(hostname) {
            return Ok(client.clone());
        }

        let client = create_client(hostname, ca_cert, tls_cert, tls_key).await?;
        let client: Arc<dyn ApplicationServer> = Arc::new(client);
        clients.insert(hostname.to_string(), client.clone());

        Ok(client)
    }
}

async fn create_client(
    hostname: &str,
    ca_cert: &[u8],
    tls_cert: &[u8],
    tls_key: &[u8],
) -> Result<GrpcApplicationServer, AsClientError> {
    let insecure = ca_cert.is_empty() && tls_cert.is_empty() && tls_key.is_empty();
    let scheme = if insecure { "http" } else { "https" };

    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{hostname}"))
        .map_err(|e| AsClientError::InvalidAddress(e.to_string()))?
        .connect_timeout(DIAL_TIMEOUT);

    if insecure {
        warn!(server = %hostname, "Creating insecure application-server client");
    } else {
        info!(server = %hostname, "Creating application-server client");
        let tls = ClientTlsConfig::new()
            .identity(Identity::from_pem(tls_cert, tls_key))
            .ca_certificate(Certificate::from_pem(ca_cert));
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| AsClientError::Tls(e.to_string()))?;
    }

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| AsClientError::ConnectFailed(e.to_string()))?;

    Ok(GrpcApplicationServer {
        client: ApplicationServerClient::new(channel),
    })
}

static POOL: RwLock<Option<Arc<dyn Pool>>> = RwLock::new(None);

/// Install the process-wide application-server pool.
pub fn set_pool(pool: Arc<dyn Pool>) {
    let mut guard = POOL.write().expect("AS pool lock poisoned");
    *guard = Some(pool);
}

/// The process-wide application-server pool.
pub fn pool() -> Result<Arc<dyn Pool>, AsClientError> {
    let guard = POOL.read().expect("AS pool lock poisoned");
    guard.clone().ok_or(AsClientError::NoPool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_failure_is_returned() {
        let pool = ClientPool::new();
        // nothing listens on port 9; the bounded dial reports the failure
        let result = pool.get("127.0.0.1:9", &[], &[], &[]).await;
        assert!(matches!(result, Err(AsClientError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn invalid_tls_material_is_returned() {
        let pool = ClientPool::new();
        let result = pool
            .get("127.0.0.1:9", b"not a cert", b"not a cert", b"not a key")
            .await;
        assert!(result.is_err());
    }
}
