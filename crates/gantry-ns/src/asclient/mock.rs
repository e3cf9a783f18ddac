//! Channel-backed application-server mocks.
//!
//! Used by the device-queue tests to observe the feedback events emitted by
//! the scheduling primitive, in order.

use std::sync::Arc;

use async_trait::async_trait;
use gantry_proto::v1::{HandleDownlinkAckRequest, HandleErrorRequest};
use tokio::sync::mpsc;

use super::{ApplicationServer, AsClientError, Pool};

/// An application server that records every request on a channel.
pub struct MockApplicationServer {
    handle_error_tx: mpsc::UnboundedSender<HandleErrorRequest>,
    handle_downlink_ack_tx: mpsc::UnboundedSender<HandleDownlinkAckRequest>,
}

/// The receiving ends of a [`MockApplicationServer`].
pub struct MockApplicationServerReceivers {
    pub handle_error: mpsc::UnboundedReceiver<HandleErrorRequest>,
    pub handle_downlink_ack: mpsc::UnboundedReceiver<HandleDownlinkAckRequest>,
}

impl MockApplicationServer {
    pub fn new() -> (Arc<Self>, MockApplicationServerReceivers) {
        let (handle_error_tx, handle_error) = mpsc::unbounded_channel();
        let (handle_downlink_ack_tx, handle_downlink_ack) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                handle_error_tx,
                handle_downlink_ack_tx,
            }),
            MockApplicationServerReceivers {
                handle_error,
                handle_downlink_ack,
            },
        )
    }
}

#[async_trait]
impl ApplicationServer for MockApplicationServer {
    async fn handle_error(&self, req: HandleErrorRequest) -> Result<(), AsClientError> {
        self.handle_error_tx
            .send(req)
            .map_err(|e| AsClientError::RpcFailed(e.to_string()))
    }

    async fn handle_downlink_ack(
        &self,
        req: HandleDownlinkAckRequest,
    ) -> Result<(), AsClientError> {
        self.handle_downlink_ack_tx
            .send(req)
            .map_err(|e| AsClientError::RpcFailed(e.to_string()))
    }
}

/// A pool that hands out the same mock client for every hostname.
pub struct MockPool {
    client: Arc<dyn ApplicationServer>,
}

impl MockPool {
    pub fn new(client: Arc<dyn ApplicationServer>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl Pool for MockPool {
    async fn get(
        &self,
        _hostname: &str,
        _ca_cert: &[u8],
        _tls_cert: &[u8],
        _tls_key: &[u8],
    ) -> Result<Arc<dyn ApplicationServer>, AsClientError> {
        Ok(self.client.clone())
    }
}
