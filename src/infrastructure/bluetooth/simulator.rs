//! Simulated Pebble Feel device for testing and development
//!
//! Speaks the same ASCII-hex wire format as the real device: command blobs
//! written to the write characteristic change its registers, and read
//! requests written to the pipe characteristic are answered with a
//! notification on the pipe.

use crate::infrastructure::bluetooth::protocol::{self, register};
use crate::infrastructure::bluetooth::transport::{
    GattLink, GattTransport, NotifyHandler, TransportError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, trace};

/// A GATT operation observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Connect(String),
    Write {
        uuid: String,
        data: Vec<u8>,
        require_ack: bool,
    },
    Subscribe(String),
    Unsubscribe(String),
    Disconnect,
}

/// How the simulated device answers read requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyBehavior {
    /// Well-formed reply for the requested register
    Normal,
    /// No reply at all
    Silent,
    /// A payload that is not valid hex
    Garbage,
    /// Well-formed reply for a different register
    WrongAddress,
}

struct DeviceModel {
    enabled: bool,
    mode_value: u16,
    reachable: bool,
    fail_writes: bool,
    fail_cleanup: bool,
    reply: ReplyBehavior,
    reply_delay: Option<Duration>,
    silent_registers: HashSet<u8>,
    ops: Vec<LinkOp>,
    open_links: usize,
    max_open_links: usize,
    active_subscriptions: usize,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            enabled: false,
            mode_value: 0x0000,
            reachable: true,
            fail_writes: false,
            fail_cleanup: false,
            reply: ReplyBehavior::Normal,
            reply_delay: None,
            silent_registers: HashSet::new(),
            ops: Vec::new(),
            open_links: 0,
            max_open_links: 0,
            active_subscriptions: 0,
        }
    }
}

/// In-process stand-in for a Pebble Feel in radio range
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    model: Arc<Mutex<DeviceModel>>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self) -> MutexGuard<'_, DeviceModel> {
        lock(&self.model)
    }

    /// Set the register values directly
    pub fn set_registers(&self, enabled: bool, mode_value: u16) {
        let mut model = self.model();
        model.enabled = enabled;
        model.mode_value = mode_value;
    }

    /// Current `(enabled, mode_value)` registers
    pub fn registers(&self) -> (bool, u16) {
        let model = self.model();
        (model.enabled, model.mode_value)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.model().reachable = reachable;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.model().fail_writes = fail;
    }

    /// Make unsubscribe and disconnect report errors
    pub fn set_fail_cleanup(&self, fail: bool) {
        self.model().fail_cleanup = fail;
    }

    pub fn set_reply_behavior(&self, reply: ReplyBehavior) {
        self.model().reply = reply;
    }

    /// Deliver replies after `delay` instead of immediately
    pub fn set_reply_delay(&self, delay: Option<Duration>) {
        self.model().reply_delay = delay;
    }

    /// Never answer reads of this register
    pub fn set_unresponsive_register(&self, address: u8) {
        self.model().silent_registers.insert(address);
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.model().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.model().ops.clear();
    }

    /// Number of connect operations seen so far
    pub fn connect_count(&self) -> usize {
        self.model()
            .ops
            .iter()
            .filter(|op| matches!(op, LinkOp::Connect(_)))
            .count()
    }

    pub fn open_links(&self) -> usize {
        self.model().open_links
    }

    /// Highest number of simultaneously open links observed
    pub fn max_open_links(&self) -> usize {
        self.model().max_open_links
    }

    pub fn active_subscriptions(&self) -> usize {
        self.model().active_subscriptions
    }
}

impl GattTransport for SimulatedTransport {
    type Link = SimulatedLink;

    async fn connect(&self, address: &str) -> Result<SimulatedLink, TransportError> {
        let mut model = self.model();
        model.ops.push(LinkOp::Connect(address.to_string()));
        if !model.reachable {
            return Err(TransportError::DeviceUnavailable {
                address: address.to_string(),
                reason: "not in range".to_string(),
            });
        }

        model.open_links += 1;
        model.max_open_links = model.max_open_links.max(model.open_links);
        debug!("Simulated link opened to {}", address);

        Ok(SimulatedLink {
            model: self.model.clone(),
            handlers: Mutex::new(HashMap::new()),
            connected: Mutex::new(true),
        })
    }
}

pub struct SimulatedLink {
    model: Arc<Mutex<DeviceModel>>,
    handlers: Mutex<HashMap<String, NotifyHandler>>,
    connected: Mutex<bool>,
}

impl SimulatedLink {
    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    /// Apply a write to the device model and work out the reply, if any
    fn handle_write(&self, uuid: &str, data: &[u8]) -> Option<(Vec<u8>, Option<Duration>)> {
        let mut model = lock(&self.model);

        if uuid == protocol::WRITE_CHAR_UUID {
            if data == protocol::enable_command(true) {
                model.enabled = true;
            } else if data == protocol::enable_command(false) {
                model.enabled = false;
            } else if let Some(mode) = crate::domain::models::Mode::ALL
                .into_iter()
                .find(|mode| protocol::mode_command(*mode) == data)
            {
                model.mode_value = mode.value();
            } else {
                trace!("Simulator ignoring unknown command {:?}", data);
            }
            return None;
        }

        if uuid != protocol::PIPE_CHAR_UUID {
            return None;
        }

        let address = parse_read_request(data)?;
        if model.silent_registers.contains(&address) {
            return None;
        }

        let value = match address {
            register::ENABLE => model.enabled as u16,
            register::MODE => model.mode_value,
            _ => 0x0000,
        };

        let payload = match model.reply {
            ReplyBehavior::Normal => reply_frame(address, value),
            ReplyBehavior::Silent => return None,
            ReplyBehavior::Garbage => b"ZZ\r\n".to_vec(),
            ReplyBehavior::WrongAddress => reply_frame(address.wrapping_add(1), value),
        };
        Some((payload, model.reply_delay))
    }
}

impl GattLink for SimulatedLink {
    async fn write(&self, uuid: &str, data: &[u8], require_ack: bool) -> Result<(), TransportError> {
        {
            let mut model = lock(&self.model);
            model.ops.push(LinkOp::Write {
                uuid: uuid.to_string(),
                data: data.to_vec(),
                require_ack,
            });
            if model.fail_writes || !self.is_connected() {
                return Err(TransportError::WriteFailed {
                    uuid: uuid.to_string(),
                    reason: "simulated write failure".to_string(),
                });
            }
        }

        let Some((payload, delay)) = self.handle_write(uuid, data) else {
            return Ok(());
        };
        let Some(handler) = lock(&self.handlers).get(uuid).cloned() else {
            return Ok(());
        };

        match delay {
            None => (*handler)(&payload[..]),
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    (*handler)(&payload[..]);
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, uuid: &str, handler: NotifyHandler) -> Result<(), TransportError> {
        let mut model = lock(&self.model);
        model.ops.push(LinkOp::Subscribe(uuid.to_string()));
        if lock(&self.handlers)
            .insert(uuid.to_string(), handler)
            .is_none()
        {
            model.active_subscriptions += 1;
        }
        Ok(())
    }

    async fn unsubscribe(&self, uuid: &str) -> Result<(), TransportError> {
        let mut model = lock(&self.model);
        model.ops.push(LinkOp::Unsubscribe(uuid.to_string()));
        if lock(&self.handlers).remove(uuid).is_some() {
            model.active_subscriptions -= 1;
        }
        if model.fail_cleanup {
            return Err(TransportError::UnsubscribeFailed {
                uuid: uuid.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut model = lock(&self.model);
        model.ops.push(LinkOp::Disconnect);

        let mut connected = lock(&self.connected);
        if *connected {
            *connected = false;
            model.open_links -= 1;
            let dropped = lock(&self.handlers).drain().count();
            model.active_subscriptions -= dropped;
        }

        if model.fail_cleanup {
            return Err(TransportError::DisconnectFailed(
                "simulated failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register address of a well-formed read request
fn parse_read_request(data: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(data).ok()?.trim();
    let raw = hex::decode(text).ok()?;
    if raw.len() != protocol::FRAME_LEN
        || raw[0] != protocol::PREAMBLE
        || raw[1] != protocol::OPCODE_READ
        || raw[2] != protocol::SCOPE
    {
        return None;
    }

    let mut head = [0u8; 7];
    head.copy_from_slice(&raw[..7]);
    if protocol::checksum(&head) != raw[7] {
        trace!("Simulator dropping read request with bad checksum");
        return None;
    }
    Some(raw[3])
}

fn reply_frame(address: u8, value: u16) -> Vec<u8> {
    let [hi, lo] = value.to_be_bytes();
    let head = [
        protocol::PREAMBLE,
        protocol::OPCODE_READ_REPLY,
        protocol::SCOPE,
        address,
        hi,
        lo,
        0x00,
    ];
    let mut raw = head.to_vec();
    raw.push(protocol::checksum(&head));
    let mut wire = hex::encode_upper(raw).into_bytes();
    wire.extend_from_slice(protocol::TERMINATOR);
    wire
}
