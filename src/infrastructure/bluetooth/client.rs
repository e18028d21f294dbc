//! Pebble Feel Command Client
//!
//! Enable, set-mode and register reads. Every operation opens its own
//! [`TransportSession`] and closes it before returning.

use crate::domain::coordinator::StateSource;
use crate::domain::models::{DeviceState, Mode};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, register};
use crate::infrastructure::bluetooth::transport::{
    GattTransport, NotifyHandler, TransportError, TransportSession,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

/// Configuration for command client behavior
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bluetooth address of the device
    pub address: String,
    /// Characteristic for enable and mode commands
    pub write_char_uuid: String,
    /// Characteristic for read requests and their notifications
    pub pipe_char_uuid: String,
    /// Wait between the enable write and the mode write
    pub enable_settle: Duration,
    /// Wait between subscribing and sending a read request
    pub subscribe_settle: Duration,
    /// Default wait for a read reply
    pub read_timeout: Duration,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            write_char_uuid: protocol::WRITE_CHAR_UUID.to_string(),
            pipe_char_uuid: protocol::PIPE_CHAR_UUID.to_string(),
            enable_settle: Duration::from_millis(protocol::ENABLE_SETTLE_MS),
            subscribe_settle: Duration::from_millis(protocol::SUBSCRIBE_SETTLE_MS),
            read_timeout: Duration::from_millis(protocol::READ_TIMEOUT_MS),
        }
    }

    /// Build from stored settings. `None` when no device address is set.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let address = settings.address.clone()?;
        Some(Self {
            write_char_uuid: settings.ble_write_char_uuid.clone(),
            pipe_char_uuid: settings.ble_pipe_char_uuid.clone(),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            ..Self::new(address)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SetEnable,
    SetMode,
    Read(u8),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetEnable => f.write_str("set enable"),
            Self::SetMode => f.write_str("set mode"),
            Self::Read(address) => write!(f, "read {:#04X}", address),
        }
    }
}

/// A command could not be carried out
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {source}")]
pub struct CommandError {
    pub operation: Operation,
    #[source]
    pub source: TransportError,
}

impl CommandError {
    fn new(operation: Operation, source: TransportError) -> Self {
        Self { operation, source }
    }
}

/// Single-shot rendezvous between a read request and the notification that
/// answers it.
///
/// Each read takes a ticket before subscribing; the notify callback carries
/// that ticket, so a notification from an earlier, timed-out read can never
/// complete a later one.
#[derive(Default)]
struct ReplySlot {
    next_ticket: AtomicU64,
    pending: Mutex<Option<(u64, oneshot::Sender<Vec<u8>>)>>,
}

impl ReplySlot {
    fn ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    fn pending(&self) -> MutexGuard<'_, Option<(u64, oneshot::Sender<Vec<u8>>)>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn arm(&self, ticket: u64) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        *self.pending() = Some((ticket, tx));
        rx
    }

    /// Complete the armed wait. Returns false if nothing was waiting for
    /// this ticket.
    fn deliver(&self, ticket: u64, payload: &[u8]) -> bool {
        let mut pending = self.pending();
        match pending.take() {
            Some((armed, tx)) if armed == ticket => tx.send(payload.to_vec()).is_ok(),
            other => {
                *pending = other;
                false
            }
        }
    }

    fn disarm(&self) {
        self.pending().take();
    }
}

/// Client for one Pebble Feel device
pub struct CommandClient<T: GattTransport> {
    transport: T,
    config: ClientConfig,
    slot: Arc<ReplySlot>,
    read_lock: tokio::sync::Mutex<()>,
}

impl<T: GattTransport> CommandClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            slot: Arc::new(ReplySlot::default()),
            read_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn open(&self, operation: Operation) -> Result<TransportSession<T::Link>, CommandError> {
        TransportSession::open(&self.transport, &self.config.address)
            .await
            .map_err(|e| CommandError::new(operation, e))
    }

    /// Turn the device on or off
    pub async fn set_enable(&self, on: bool) -> Result<(), CommandError> {
        info!("Setting {} enable={}", self.config.address, on);
        let session = self.open(Operation::SetEnable).await?;

        let result = session
            .write_characteristic(
                &self.config.write_char_uuid,
                protocol::enable_command(on),
                true,
            )
            .await;

        session.close().await;
        result.map_err(|e| CommandError::new(Operation::SetEnable, e))
    }

    /// Switch the operating mode, optionally enabling the device first
    pub async fn set_mode(&self, mode: Mode, auto_enable: bool) -> Result<(), CommandError> {
        info!("Setting {} mode={}", self.config.address, mode);
        let session = self.open(Operation::SetMode).await?;

        let result = self.write_mode(&session, mode, auto_enable).await;

        session.close().await;
        result.map_err(|e| CommandError::new(Operation::SetMode, e))
    }

    async fn write_mode(
        &self,
        session: &TransportSession<T::Link>,
        mode: Mode,
        auto_enable: bool,
    ) -> Result<(), TransportError> {
        if auto_enable {
            session
                .write_characteristic(
                    &self.config.write_char_uuid,
                    protocol::enable_command(true),
                    true,
                )
                .await?;
            // The device drops mode writes that follow an enable too closely
            tokio::time::sleep(self.config.enable_settle).await;
        }

        session
            .write_characteristic(&self.config.write_char_uuid, protocol::mode_command(mode), true)
            .await
    }

    /// Read a register with the configured timeout
    pub async fn read_address(&self, address: u8) -> Result<Option<u16>, CommandError> {
        self.read_address_with_timeout(address, self.config.read_timeout)
            .await
    }

    /// Read a register.
    ///
    /// `Ok(None)` means no usable reply arrived: the wait timed out, the
    /// payload did not parse, or it answered a different register.
    /// Concurrent calls on the same client are serialized.
    pub async fn read_address_with_timeout(
        &self,
        address: u8,
        timeout: Duration,
    ) -> Result<Option<u16>, CommandError> {
        let _read_guard = self.read_lock.lock().await;
        let operation = Operation::Read(address);

        let mut session = self.open(operation).await?;
        let result = self.exchange(&mut session, address, timeout).await;

        self.slot.disarm();
        session.unsubscribe(&self.config.pipe_char_uuid).await;
        session.close().await;

        result.map_err(|e| CommandError::new(operation, e))
    }

    async fn exchange(
        &self,
        session: &mut TransportSession<T::Link>,
        address: u8,
        timeout: Duration,
    ) -> Result<Option<u16>, TransportError> {
        let ticket = self.slot.ticket();
        let slot = self.slot.clone();
        let handler: NotifyHandler = Arc::new(move |payload: &[u8]| {
            if !slot.deliver(ticket, payload) {
                trace!("Discarding unsolicited notification: {:?}", payload);
            }
        });

        session
            .subscribe(&self.config.pipe_char_uuid, handler)
            .await?;
        tokio::time::sleep(self.config.subscribe_settle).await;

        let reply = self.slot.arm(ticket);
        let frame = protocol::build_read_frame(address);
        debug!(
            "Requesting register {:#04X}: {}",
            address,
            String::from_utf8_lossy(&frame).trim_end()
        );
        session
            .write_characteristic(&self.config.pipe_char_uuid, &frame, true)
            .await?;

        let payload = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => {
                debug!("Reply slot for {:#04X} closed", address);
                return Ok(None);
            }
            Err(_) => {
                debug!("Timed out waiting for register {:#04X}", address);
                return Ok(None);
            }
        };

        trace!("Reply payload: {:?}", String::from_utf8_lossy(&payload));
        match protocol::parse_response(&payload) {
            Some(frame) if frame.address == address => Ok(Some(frame.value)),
            Some(frame) => {
                debug!(
                    "Reply for register {:#04X} while reading {:#04X}",
                    frame.address, address
                );
                Ok(None)
            }
            None => {
                debug!("Unparsable reply for register {:#04X}", address);
                Ok(None)
            }
        }
    }

    /// Read the enable flag and mode, one after the other.
    ///
    /// Registers that do not answer keep their default values.
    pub async fn read_state(&self) -> Result<DeviceState, CommandError> {
        let enabled = self.read_address(register::ENABLE).await?;
        let mode_value = self.read_address(register::MODE).await?;

        let mut state = DeviceState::default();
        if let Some(value) = enabled {
            state.enabled = value & 0x0001 == 1;
        }
        if let Some(value) = mode_value {
            state.mode_value = value;
        }
        debug!("Read state {:?}", state);
        Ok(state)
    }
}

impl<T: GattTransport> StateSource for CommandClient<T> {
    type Error = CommandError;

    async fn read_state(&self) -> Result<DeviceState, CommandError> {
        CommandClient::read_state(self).await
    }
}
