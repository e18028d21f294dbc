//! BLE Transport Module
//!
//! The GATT primitives the rest of the crate is written against, and the
//! per-operation [`TransportSession`] that owns one live connection.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Callback invoked once per inbound notification
pub type NotifyHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device {address} unavailable: {reason}")]
    DeviceUnavailable { address: String, reason: String },

    #[error("write to {uuid} failed: {reason}")]
    WriteFailed { uuid: String, reason: String },

    #[error("subscribe to {uuid} failed: {reason}")]
    SubscribeFailed { uuid: String, reason: String },

    #[error("unsubscribe from {uuid} failed: {reason}")]
    UnsubscribeFailed { uuid: String, reason: String },

    #[error("disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// Resolves a device address and establishes a GATT connection to it.
///
/// Device discovery happens elsewhere: the device must already be known to
/// the host BLE stack. Implementations own any connection retry policy.
pub trait GattTransport: Send + Sync {
    type Link: GattLink + 'static;

    fn connect(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// One established GATT connection
pub trait GattLink: Send + Sync {
    fn write(
        &self,
        uuid: &str,
        data: &[u8],
        require_ack: bool,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &self,
        uuid: &str,
        handler: NotifyHandler,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unsubscribe(&self, uuid: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A connection scoped to a single logical operation.
///
/// Call [`close`](Self::close) on every exit path. A session dropped without
/// being closed (for example when the owning future is cancelled) schedules
/// the same teardown on the current tokio runtime.
pub struct TransportSession<L: GattLink + 'static> {
    link: Arc<L>,
    address: String,
    subscriptions: Vec<String>,
    closed: bool,
}

impl<L: GattLink + 'static> TransportSession<L> {
    /// Connect to `address` through `transport`
    pub async fn open<T>(transport: &T, address: &str) -> Result<Self, TransportError>
    where
        T: GattTransport<Link = L>,
    {
        debug!("Connecting to {}", address);
        let link = transport
            .connect(address)
            .await
            .map_err(|e| match e {
                TransportError::DeviceUnavailable { .. } => e,
                other => TransportError::DeviceUnavailable {
                    address: address.to_string(),
                    reason: other.to_string(),
                },
            })?;
        debug!("Connected to {}", address);

        Ok(Self {
            link: Arc::new(link),
            address: address.to_string(),
            subscriptions: Vec::new(),
            closed: false,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn write_characteristic(
        &self,
        uuid: &str,
        data: &[u8],
        require_ack: bool,
    ) -> Result<(), TransportError> {
        self.link
            .write(uuid, data, require_ack)
            .await
            .map_err(|e| match e {
                TransportError::WriteFailed { .. } => e,
                other => TransportError::WriteFailed {
                    uuid: uuid.to_string(),
                    reason: other.to_string(),
                },
            })
    }

    pub async fn subscribe(
        &mut self,
        uuid: &str,
        handler: NotifyHandler,
    ) -> Result<(), TransportError> {
        self.link
            .subscribe(uuid, handler)
            .await
            .map_err(|e| match e {
                TransportError::SubscribeFailed { .. } => e,
                other => TransportError::SubscribeFailed {
                    uuid: uuid.to_string(),
                    reason: other.to_string(),
                },
            })?;
        self.subscriptions.push(uuid.to_string());
        Ok(())
    }

    /// Stop notifications. Failures are logged and swallowed.
    pub async fn unsubscribe(&mut self, uuid: &str) {
        self.subscriptions.retain(|s| s != uuid);
        if let Err(e) = self.link.unsubscribe(uuid).await {
            debug!("Ignoring unsubscribe failure: {}", e);
        }
    }

    /// Release the connection. Never fails.
    pub async fn close(mut self) {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        teardown(self.link.as_ref(), subscriptions).await;
        self.closed = true;
        debug!("Disconnected from {}", self.address);
    }
}

impl<L: GattLink + 'static> Drop for TransportSession<L> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let link = self.link.clone();
        let subscriptions = std::mem::take(&mut self.subscriptions);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Session to {} dropped while open, tearing down", self.address);
                handle.spawn(async move {
                    teardown(link.as_ref(), subscriptions).await;
                });
            }
            Err(_) => warn!(
                "Session to {} dropped outside a runtime, connection left to the host stack",
                self.address
            ),
        }
    }
}

async fn teardown<L: GattLink>(link: &L, subscriptions: Vec<String>) {
    for uuid in subscriptions {
        if let Err(e) = link.unsubscribe(&uuid).await {
            debug!("Ignoring unsubscribe failure: {}", e);
        }
    }
    if let Err(e) = link.disconnect().await {
        debug!("Ignoring disconnect failure: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{PIPE_CHAR_UUID, WRITE_CHAR_UUID};
    use crate::infrastructure::bluetooth::simulator::{LinkOp, SimulatedTransport};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn noop_handler() -> NotifyHandler {
        Arc::new(|_: &[u8]| {})
    }

    #[tokio::test]
    async fn test_open_unreachable_device() {
        let transport = SimulatedTransport::new();
        transport.set_reachable(false);

        let err = TransportSession::open(&transport, ADDRESS).await.err().unwrap();
        assert!(matches!(err, TransportError::DeviceUnavailable { .. }));
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn test_close_unsubscribes_and_disconnects() {
        let transport = SimulatedTransport::new();
        let mut session = TransportSession::open(&transport, ADDRESS).await.unwrap();
        session.subscribe(PIPE_CHAR_UUID, noop_handler()).await.unwrap();
        assert_eq!(transport.open_links(), 1);

        session.close().await;

        let ops = transport.ops();
        assert_eq!(
            &ops[ops.len() - 2..],
            &[
                LinkOp::Unsubscribe(PIPE_CHAR_UUID.to_string()),
                LinkOp::Disconnect
            ]
        );
        assert_eq!(transport.open_links(), 0);
        assert_eq!(transport.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_uniform() {
        let transport = SimulatedTransport::new();
        transport.set_fail_writes(true);
        let session = TransportSession::open(&transport, ADDRESS).await.unwrap();

        let err = session
            .write_characteristic(WRITE_CHAR_UUID, b"x", true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::WriteFailed { .. }));

        session.close().await;
        assert_eq!(transport.open_links(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_swallowed() {
        let transport = SimulatedTransport::new();
        let mut session = TransportSession::open(&transport, ADDRESS).await.unwrap();
        session.subscribe(PIPE_CHAR_UUID, noop_handler()).await.unwrap();
        transport.set_fail_cleanup(true);

        session.unsubscribe(PIPE_CHAR_UUID).await;
        session.close().await;

        assert!(transport.ops().contains(&LinkOp::Disconnect));
    }

    #[tokio::test]
    async fn test_drop_without_close_tears_down() {
        let transport = SimulatedTransport::new();
        {
            let mut session = TransportSession::open(&transport, ADDRESS).await.unwrap();
            session.subscribe(PIPE_CHAR_UUID, noop_handler()).await.unwrap();
        }

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(transport.open_links(), 0);
        assert_eq!(transport.active_subscriptions(), 0);
    }
}
