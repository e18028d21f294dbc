//! Pebble Feel control core
//!
//! Talks to a Pebble Feel climate wearable over Bluetooth LE: switches it
//! on and off, selects its operating mode, and polls its state.

pub mod device;
pub mod domain;
pub mod infrastructure;

pub use device::DeviceContext;
pub use domain::models::{CachedState, DeviceEvent, DeviceState, Mode, StateOrigin};
