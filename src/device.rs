//! Per-device context
//!
//! Owns the command client and polling coordinator for one device and
//! exposes the three user controls: the enable switch, the mode select and
//! the polling switch.

use crate::domain::coordinator::{PollingCoordinator, UpdateFailed};
use crate::domain::models::{CachedState, DeviceEvent, Mode};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::client::{ClientConfig, CommandClient, CommandError};
use crate::infrastructure::bluetooth::transport::GattTransport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct DeviceContext<T: GattTransport> {
    client: Arc<CommandClient<T>>,
    coordinator: PollingCoordinator<CommandClient<T>>,
}

impl<T: GattTransport> DeviceContext<T> {
    pub fn new(
        client: CommandClient<T>,
        poll_interval: Duration,
        events: Option<mpsc::UnboundedSender<DeviceEvent>>,
    ) -> Self {
        let client = Arc::new(client);
        let mut coordinator = PollingCoordinator::new(client.clone(), poll_interval);
        if let Some(events) = events {
            coordinator = coordinator.with_events(events);
        }
        Self {
            client,
            coordinator,
        }
    }

    /// Build from stored settings
    pub fn from_settings(
        transport: T,
        settings: &Settings,
        events: Option<mpsc::UnboundedSender<DeviceEvent>>,
    ) -> anyhow::Result<Self> {
        let config = ClientConfig::from_settings(settings)
            .ok_or_else(|| anyhow::anyhow!("No device address configured"))?;
        let context = Self::new(
            CommandClient::new(transport, config),
            Duration::from_secs(settings.poll_interval_secs.max(1)),
            events,
        );
        context
            .coordinator
            .set_polling_enabled(settings.mode_polling);
        Ok(context)
    }

    pub fn client(&self) -> &CommandClient<T> {
        &self.client
    }

    pub fn coordinator(&self) -> &PollingCoordinator<CommandClient<T>> {
        &self.coordinator
    }

    pub fn address(&self) -> &str {
        &self.client.config().address
    }

    /// First refresh. Fails if the device cannot be read.
    pub async fn setup(&self) -> Result<CachedState, UpdateFailed> {
        info!("Setting up {}", self.address());
        self.coordinator.first_refresh().await
    }

    pub fn is_on(&self) -> bool {
        self.coordinator
            .state()
            .map(|state| state.enabled)
            .unwrap_or(false)
    }

    pub fn current_mode(&self) -> Option<Mode> {
        self.coordinator.state().and_then(|state| state.mode())
    }

    pub fn polling_enabled(&self) -> bool {
        self.coordinator.polling_enabled()
    }

    pub async fn turn_on(&self) -> Result<(), CommandError> {
        self.set_enable(true).await
    }

    pub async fn turn_off(&self) -> Result<(), CommandError> {
        self.set_enable(false).await
    }

    async fn set_enable(&self, on: bool) -> Result<(), CommandError> {
        self.client.set_enable(on).await?;
        self.coordinator.apply_tentative(|state| state.enabled = on);
        Ok(())
    }

    /// Switch mode (enabling the device first), show it right away, then
    /// read back the real state if polling is on.
    pub async fn select_mode(&self, mode: Mode) -> Result<(), CommandError> {
        self.client.set_mode(mode, true).await?;
        self.coordinator.apply_tentative(|state| {
            state.enabled = true;
            state.mode_value = mode.value();
        });

        if self.coordinator.polling_enabled() {
            if let Err(e) = self.coordinator.refresh().await {
                debug!("Refresh after mode change failed: {}", e);
            }
        }
        Ok(())
    }

    /// Turn polling on or off. Turning it on refreshes immediately.
    pub async fn set_polling(&self, enabled: bool) {
        self.coordinator.set_polling_enabled(enabled);
        if enabled {
            if let Err(e) = self.coordinator.refresh().await {
                debug!("Refresh after enabling polling failed: {}", e);
            }
        }
    }

    /// Run the poll loop until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        self.coordinator.run(shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceState, StateOrigin};
    use crate::infrastructure::bluetooth::simulator::SimulatedTransport;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn context(transport: &SimulatedTransport) -> DeviceContext<SimulatedTransport> {
        let client = CommandClient::new(transport.clone(), ClientConfig::new(ADDRESS));
        DeviceContext::new(client, Duration::from_secs(30), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_reads_state() {
        let transport = SimulatedTransport::new();
        transport.set_registers(true, Mode::CoolLow.value());
        let device = context(&transport);

        let cached = device.setup().await.unwrap();
        assert_eq!(cached.origin, StateOrigin::Confirmed);
        assert!(device.is_on());
        assert_eq!(device.current_mode(), Some(Mode::CoolLow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_fails_when_unreachable() {
        let transport = SimulatedTransport::new();
        transport.set_reachable(false);
        let device = context(&transport);

        assert!(device.setup().await.is_err());
        assert!(!device.is_on());
        assert_eq!(device.current_mode(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_on_updates_tentatively() {
        let transport = SimulatedTransport::new();
        let device = context(&transport);
        device.setup().await.unwrap();
        assert!(!device.is_on());

        device.turn_on().await.unwrap();
        assert!(device.is_on());
        assert_eq!(
            device.coordinator().data().unwrap().origin,
            StateOrigin::Tentative
        );
        assert_eq!(transport.registers().0, true);

        device.turn_off().await.unwrap();
        assert!(!device.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_mode_reconciles_with_device() {
        let transport = SimulatedTransport::new();
        let device = context(&transport);
        device.setup().await.unwrap();

        device.select_mode(Mode::HotMid).await.unwrap();

        let cached = device.coordinator().data().unwrap();
        assert_eq!(cached.origin, StateOrigin::Confirmed);
        assert_eq!(
            cached.state,
            DeviceState {
                enabled: true,
                mode_value: Mode::HotMid.value()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_mode_without_polling_stays_tentative() {
        let transport = SimulatedTransport::new();
        let device = context(&transport);
        device.setup().await.unwrap();
        device.set_polling(false).await;
        let connects = transport.connect_count();

        device.select_mode(Mode::CoolRapid).await.unwrap();

        // Only the command connection, no read-back
        assert_eq!(transport.connect_count(), connects + 1);
        let cached = device.coordinator().data().unwrap();
        assert_eq!(cached.origin, StateOrigin::Tentative);
        assert_eq!(device.current_mode(), Some(Mode::CoolRapid));
        assert!(device.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_gate_never_touches_transport() {
        let transport = SimulatedTransport::new();
        transport.set_registers(true, Mode::HotLow.value());
        let device = context(&transport);
        let before = device.setup().await.unwrap();

        device.set_polling(false).await;
        transport.clear_ops();
        for _ in 0..3 {
            assert_eq!(device.coordinator().refresh().await.unwrap(), before);
        }
        assert!(transport.ops().is_empty());

        device.set_polling(true).await;
        assert!(transport.connect_count() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_surfaces_error() {
        let transport = SimulatedTransport::new();
        let device = context(&transport);
        device.setup().await.unwrap();

        transport.set_reachable(false);
        assert!(device.select_mode(Mode::HotHigh).await.is_err());
        assert_eq!(device.current_mode(), None);
    }

    #[test]
    fn test_from_settings_requires_address() {
        let settings = Settings::default();
        assert!(DeviceContext::from_settings(SimulatedTransport::new(), &settings, None).is_err());

        let settings = Settings {
            address: Some(ADDRESS.to_string()),
            mode_polling: false,
            ..Settings::default()
        };
        let device = DeviceContext::from_settings(SimulatedTransport::new(), &settings, None).unwrap();
        assert_eq!(device.address(), ADDRESS);
        assert!(!device.polling_enabled());
    }
}
