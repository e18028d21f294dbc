//! Bluetooth Module
//!
//! Provides BLE communication with the Pebble Feel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     CommandClient                        │
//! │  (enable / set mode / register reads, one read at once)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────────┐
//! │ Protocol  │  │ Transport  │  │  Backends    │
//! │           │  │            │  │              │
//! │ - UUIDs   │  │ - Session  │  │ - WinRT      │
//! │ - Frames  │  │ - Traits   │  │ - Simulator  │
//! │ - Modes   │  │            │  │              │
//! └───────────┘  └────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Wire format, command blobs and frame codec
//! - [`transport`] - GATT traits and the per-operation session
//! - [`client`] - Command client
//! - `connection` - WinRT backend (Windows only)
//! - [`simulator`] - In-process simulated device

pub mod client;
#[cfg(windows)]
pub mod connection;
pub mod protocol;
pub mod simulator;
pub mod transport;

pub use client::{ClientConfig, CommandClient, CommandError};
#[cfg(windows)]
pub use connection::{ConnectionConfig, WinRtTransport};
pub use simulator::SimulatedTransport;
pub use transport::{GattLink, GattTransport, TransportError, TransportSession};
