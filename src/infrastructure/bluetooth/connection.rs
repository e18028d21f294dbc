//! BLE Connection Module
//!
//! WinRT implementation of [`GattTransport`]: device lookup by address,
//! connection establishment with retry, and GATT characteristic access.

use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    GattLink, GattTransport, NotifyHandler, TransportError,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattSession, GattValueChangedEventArgs,
    GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum connection attempts
    pub max_connect_attempts: u32,
    /// Delay between attempts in milliseconds
    pub connect_retry_delay_ms: u64,
    /// Service UUID to look for
    pub service_uuid: String,
    /// Characteristics resolved on connect
    pub characteristic_uuids: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connect_attempts: 3,
            connect_retry_delay_ms: 1000,
            service_uuid: protocol::SERVICE_UUID.to_string(),
            characteristic_uuids: vec![
                protocol::WRITE_CHAR_UUID.to_string(),
                protocol::PIPE_CHAR_UUID.to_string(),
            ],
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_connect_attempts: settings.connect_max_retries,
            connect_retry_delay_ms: settings.connect_retry_delay_ms,
            service_uuid: settings.ble_service_uuid.clone(),
            characteristic_uuids: vec![
                settings.ble_write_char_uuid.clone(),
                settings.ble_pipe_char_uuid.clone(),
            ],
        }
    }
}

/// Connects through the Windows Bluetooth LE stack
pub struct WinRtTransport {
    config: ConnectionConfig,
}

impl WinRtTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// One connection attempt
    async fn establish(&self, address: u64) -> Result<WinRtLink> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
        info!("Device resolved: {:?}", device.Name()?);

        // Keeps Windows from dropping the link between our GATT calls
        let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
        session.SetMaintainConnection(true)?;

        let service_uuid = protocol::parse_uuid(&self.config.service_uuid)?;
        let services_result = device
            .GetGattServicesForUuidWithCacheModeAsync(service_uuid, BluetoothCacheMode::Uncached)?
            .await?;
        if services_result.Status()? != GattCommunicationStatus::Success {
            anyhow::bail!(
                "Failed to get GATT services: {:?}",
                services_result.Status()?
            );
        }

        let services = services_result.Services()?;
        if services.Size()? == 0 {
            anyhow::bail!("Pebble Feel service not found");
        }
        let service = services.GetAt(0)?;

        let mut characteristics = HashMap::new();
        for uuid in &self.config.characteristic_uuids {
            let guid = protocol::parse_uuid(uuid)?;
            let result = service.GetCharacteristicsForUuidAsync(guid)?.await?;
            if result.Status()? != GattCommunicationStatus::Success {
                anyhow::bail!("Failed to get characteristic {}", uuid);
            }
            let found = result.Characteristics()?;
            if found.Size()? == 0 {
                anyhow::bail!("Characteristic {} not found", uuid);
            }
            debug!("Found characteristic {}", uuid);
            characteristics.insert(uuid.to_lowercase(), found.GetAt(0)?);
        }

        Ok(WinRtLink {
            device,
            session,
            service,
            characteristics,
            tokens: Mutex::new(HashMap::new()),
        })
    }
}

impl GattTransport for WinRtTransport {
    type Link = WinRtLink;

    async fn connect(&self, address: &str) -> Result<WinRtLink, TransportError> {
        let unavailable = |reason: String| TransportError::DeviceUnavailable {
            address: address.to_string(),
            reason,
        };
        let raw = protocol::parse_bluetooth_address(address)
            .ok_or_else(|| unavailable("invalid Bluetooth address".to_string()))?;

        let attempts = self.config.max_connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.establish(raw).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    warn!("Connection attempt {} to {} failed: {}", attempt, address, e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.connect_retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        Err(unavailable(last_error))
    }
}

/// A live WinRT GATT connection
pub struct WinRtLink {
    device: BluetoothLEDevice,
    session: GattSession,
    service: GattDeviceService,
    characteristics: HashMap<String, GattCharacteristic>,
    tokens: Mutex<HashMap<String, i64>>,
}

impl WinRtLink {
    fn characteristic(&self, uuid: &str) -> Result<&GattCharacteristic, String> {
        self.characteristics
            .get(&uuid.to_lowercase())
            .ok_or_else(|| format!("characteristic {} not resolved", uuid))
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl GattLink for WinRtLink {
    async fn write(&self, uuid: &str, data: &[u8], require_ack: bool) -> Result<(), TransportError> {
        let fail = |reason: String| TransportError::WriteFailed {
            uuid: uuid.to_string(),
            reason,
        };
        let characteristic = self.characteristic(uuid).map_err(fail)?;
        let option = if require_ack {
            GattWriteOption::WriteWithResponse
        } else {
            GattWriteOption::WriteWithoutResponse
        };

        let operation = {
            let writer = DataWriter::new().map_err(|e| fail(e.to_string()))?;
            writer.WriteBytes(data).map_err(|e| fail(e.to_string()))?;
            let buffer = writer.DetachBuffer().map_err(|e| fail(e.to_string()))?;
            characteristic
                .WriteValueWithOptionAsync(&buffer, option)
                .map_err(|e| fail(e.to_string()))?
        };

        let status = operation.await.map_err(|e| fail(e.to_string()))?;
        if status != GattCommunicationStatus::Success {
            return Err(fail(format!("status {:?}", status)));
        }
        Ok(())
    }

    async fn subscribe(&self, uuid: &str, handler: NotifyHandler) -> Result<(), TransportError> {
        let fail = |reason: String| TransportError::SubscribeFailed {
            uuid: uuid.to_string(),
            reason,
        };
        let characteristic = self.characteristic(uuid).map_err(fail)?;

        let token = {
            let value_handler = TypedEventHandler::new(
                move |_: windows::core::Ref<GattCharacteristic>,
                      args: windows::core::Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let value = args.CharacteristicValue()?;
                        let reader = DataReader::FromBuffer(&value)?;
                        let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                        reader.ReadBytes(&mut bytes)?;
                        (*handler)(&bytes[..]);
                    }
                    Ok(())
                },
            );
            characteristic
                .ValueChanged(&value_handler)
                .map_err(|e| fail(e.to_string()))?
        };
        self.tokens().insert(uuid.to_lowercase(), token);

        let operation = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(|e| fail(e.to_string()))?;
        let status = operation.await.map_err(|e| fail(e.to_string()))?;
        if status != GattCommunicationStatus::Success {
            let _ = characteristic.RemoveValueChanged(token);
            self.tokens().remove(&uuid.to_lowercase());
            return Err(fail(format!("status {:?}", status)));
        }

        debug!("Notifications enabled on {}", uuid);
        Ok(())
    }

    async fn unsubscribe(&self, uuid: &str) -> Result<(), TransportError> {
        let fail = |reason: String| TransportError::UnsubscribeFailed {
            uuid: uuid.to_string(),
            reason,
        };
        let characteristic = self.characteristic(uuid).map_err(fail)?;

        let token = self.tokens().remove(&uuid.to_lowercase());
        if let Some(token) = token {
            characteristic
                .RemoveValueChanged(token)
                .map_err(|e| fail(e.to_string()))?;
        }

        let operation = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            )
            .map_err(|e| fail(e.to_string()))?;
        let status = operation.await.map_err(|e| fail(e.to_string()))?;
        if status != GattCommunicationStatus::Success {
            return Err(fail(format!("status {:?}", status)));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let tokens: Vec<(String, i64)> = self.tokens().drain().collect();
        for (uuid, token) in tokens {
            if let Some(characteristic) = self.characteristics.get(&uuid) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }

        let _ = self.session.SetMaintainConnection(false);
        let results = [self.service.Close(), self.session.Close(), self.device.Close()];
        for result in results {
            result.map_err(|e| TransportError::DisconnectFailed(e.to_string()))?;
        }
        Ok(())
    }
}
