//! Command line surface
//!
//! Each invocation builds one [`DeviceContext`], runs a single command and
//! exits. `watch` keeps polling until Ctrl+C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pebble_feel::domain::models::{CachedState, DeviceEvent, Mode, StateOrigin};
use pebble_feel::domain::settings::{Settings, SettingsService};
use pebble_feel::infrastructure::bluetooth::{GattTransport, SimulatedTransport};
use pebble_feel::DeviceContext;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::warn;

/// Address used with `--simulate` when none is configured
const SIMULATED_ADDRESS: &str = "5F:EE:00:00:00:01";

/// Pebble Feel - control a climate wearable over Bluetooth LE
#[derive(Parser, Debug)]
#[command(name = "pebble-feel")]
#[command(about = "Control a Pebble Feel over Bluetooth LE", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Device address, overrides the configured one
    #[arg(short, long, global = true)]
    pub address: Option<String>,

    /// Talk to an in-process simulated device
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Log level, overrides the configured one
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read and print the device state
    Status,

    /// Turn the device on
    On,

    /// Turn the device off
    Off,

    /// Select an operating mode
    Mode {
        /// cool_low, cool_mid, cool_high, cool_rapid, hot_low, hot_mid or hot_high
        mode: Mode,

        /// Do not switch the device on first
        #[arg(long)]
        no_enable: bool,
    },

    /// Read one register, e.g. `read 0x90`
    Read {
        #[arg(value_parser = parse_register)]
        register: u8,
    },

    /// Poll and print state changes until Ctrl+C
    Watch {
        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Start with polling switched off
        #[arg(long)]
        no_polling: bool,
    },

    /// Settings management
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the current settings
    Show,

    /// Change stored settings
    Set {
        /// Device address, e.g. AA:BB:CC:DD:EE:FF
        #[arg(long)]
        device: Option<String>,

        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,

        /// Poll the device for state
        #[arg(long)]
        polling: Option<bool>,
    },
}

fn parse_register(s: &str) -> Result<u8, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid register '{}': {}", s, e))
}

pub async fn run(cli: Cli, mut settings: SettingsService) -> Result<()> {
    if let Command::Config(cmd) = &cli.command {
        return config(cmd, &mut settings);
    }

    let mut effective = settings.get().clone();
    if let Some(address) = &cli.address {
        effective.address = Some(address.trim().to_uppercase());
    }

    if cli.simulate {
        if effective.address.is_none() {
            effective.address = Some(SIMULATED_ADDRESS.to_string());
        }
        let transport = SimulatedTransport::new();
        transport.set_registers(false, Mode::CoolLow.value());
        return execute(transport, effective, &cli.command).await;
    }

    let transport = platform_transport(&effective)?;
    execute(transport, effective, &cli.command).await
}

#[cfg(windows)]
fn platform_transport(
    settings: &Settings,
) -> Result<pebble_feel::infrastructure::bluetooth::WinRtTransport> {
    use pebble_feel::infrastructure::bluetooth::{ConnectionConfig, WinRtTransport};
    Ok(WinRtTransport::new(ConnectionConfig::from_settings(settings)))
}

#[cfg(not(windows))]
fn platform_transport(_settings: &Settings) -> Result<SimulatedTransport> {
    anyhow::bail!("No Bluetooth backend on this platform, use --simulate")
}

async fn execute<T: GattTransport>(
    transport: T,
    mut settings: Settings,
    command: &Command,
) -> Result<()> {
    if settings.address.is_none() {
        anyhow::bail!("No device address configured. Run `pebble-feel config set --device <ADDRESS>` or pass --address");
    }

    match command {
        Command::Status => {
            let device = DeviceContext::from_settings(transport, &settings, None)?;
            let cached = device.setup().await?;
            print_state(&cached);
        },

        Command::On => {
            let device = DeviceContext::from_settings(transport, &settings, None)?;
            device.turn_on().await?;
            println!("on");
        },

        Command::Off => {
            let device = DeviceContext::from_settings(transport, &settings, None)?;
            device.turn_off().await?;
            println!("off");
        },

        Command::Mode { mode, no_enable } => {
            let device = DeviceContext::from_settings(transport, &settings, None)?;
            if *no_enable {
                device.client().set_mode(*mode, false).await?;
            } else {
                device.select_mode(*mode).await?;
            }
            println!("mode {}", mode);
        },

        Command::Read { register } => {
            let device = DeviceContext::from_settings(transport, &settings, None)?;
            match device.client().read_address(*register).await? {
                Some(value) => println!("0x{:02X} = 0x{:04X}", register, value),
                None => println!("0x{:02X}: no reply", register),
            }
        },

        Command::Watch {
            interval,
            no_polling,
        } => {
            if let Some(interval) = interval {
                settings.poll_interval_secs = *interval;
            }
            if *no_polling {
                settings.mode_polling = false;
            }
            watch(transport, &settings).await?;
        },

        // Handled in `run`
        Command::Config(_) => {},
    }

    Ok(())
}

async fn watch<T: GattTransport>(transport: T, settings: &Settings) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let device = DeviceContext::from_settings(transport, settings, Some(events_tx))?;

    if let Err(e) = device.setup().await {
        warn!("Device not ready yet, will keep polling: {}", e);
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let printer = async {
        while let Some(event) = events_rx.recv().await {
            match event {
                DeviceEvent::StateUpdated(cached) => print_state(&cached),
                DeviceEvent::UpdateFailed(reason) => println!("update failed: {}", reason),
                DeviceEvent::PollingChanged(enabled) => {
                    println!("polling {}", if enabled { "on" } else { "off" })
                },
            }
        }
    };

    tokio::select! {
        _ = device.run(shutdown) => {},
        _ = printer => {},
    }
    Ok(())
}

fn print_state(cached: &CachedState) {
    let mode = cached
        .state
        .mode()
        .map(|mode| mode.to_string())
        .unwrap_or_else(|| format!("unknown (0x{:04X})", cached.state.mode_value));
    let marker = match cached.origin {
        StateOrigin::Confirmed => "",
        StateOrigin::Tentative => " (unconfirmed)",
    };
    println!(
        "{} mode={}{}",
        if cached.state.enabled { "on" } else { "off" },
        mode,
        marker
    );
}

fn config(cmd: &ConfigCommand, settings: &mut SettingsService) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            println!("# {}", settings.path().display());
            let json = serde_json::to_string_pretty(settings.get())
                .context("Failed to serialize settings")?;
            println!("{}", json);
        },

        ConfigCommand::Set {
            device,
            interval,
            polling,
        } => {
            if let Some(address) = device {
                settings.set_address(address)?;
                println!("device = {}", address.trim().to_uppercase());
            }
            if let Some(interval) = interval {
                settings.set_poll_interval(*interval)?;
                println!("interval = {}s", interval);
            }
            if let Some(polling) = polling {
                settings.get_mut().mode_polling = *polling;
                settings.save()?;
                println!("polling = {}", polling);
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        assert_eq!(parse_register("0x90"), Ok(0x90));
        assert_eq!(parse_register("80"), Ok(0x80));
        assert!(parse_register("0x1FF").is_err());
        assert!(parse_register("zz").is_err());
    }

    #[test]
    fn test_cli_parses_mode() {
        let cli = Cli::try_parse_from(["pebble-feel", "--simulate", "mode", "hot_mid"]).unwrap();
        assert!(cli.simulate);
        match cli.command {
            Command::Mode { mode, no_enable } => {
                assert_eq!(mode, Mode::HotMid);
                assert!(!no_enable);
            },
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["pebble-feel", "mode", "lukewarm"]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_status() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsService::with_path(dir.path().join("settings.json"));
        let cli = Cli::try_parse_from(["pebble-feel", "--simulate", "status"]).unwrap();
        run(cli, settings).await.unwrap();
    }

    #[tokio::test]
    async fn test_config_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let cli = Cli::try_parse_from([
            "pebble-feel",
            "config",
            "set",
            "--device",
            "aa:bb:cc:dd:ee:ff",
            "--interval",
            "10",
        ])
        .unwrap();
        run(cli, SettingsService::with_path(path.clone()))
            .await
            .unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(reloaded.get().poll_interval_secs, 10);
    }
}
