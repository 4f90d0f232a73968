//! thermometer: run and inspect the BLE thermometer peripheral
//!
//! `run` serves the device over the in-process simulated transport with a
//! demo central that subscribes to temperature notifications. The other
//! commands print the wire and attribute formats without running anything.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use thermometer::ble::advertising::AdvertisementData;
use thermometer::ble::simulated::SimBleNetwork;
use thermometer::gatt::codec::{encode_reading, Reading};
use thermometer::services::{TEMPERATURE, UNIT};
use thermometer::{DeviceConfig, FixedSensor, ThermometerDevice, UnitPreference};

#[derive(Parser)]
#[command(name = "thermometer", version, about = "BLE thermometer peripheral")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the thermometer over the simulated transport until Ctrl-C
    Run {
        #[command(flatten)]
        device: DeviceArgs,

        /// Report this fixed temperature instead of reading the sensor file
        #[arg(long)]
        celsius: Option<f64>,

        /// Unit the demo central selects after subscribing
        #[arg(long, value_enum, ignore_case = true)]
        unit: Option<UnitArg>,
    },
    /// Print the 3-byte notification packet for a reading, as hex
    Encode {
        #[arg(long, allow_hyphen_values = true)]
        celsius: f64,

        #[arg(long, value_enum, ignore_case = true, default_value = "c")]
        unit: UnitArg,
    },
    /// Print the advertising payload, as hex
    Advertise {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Print the attribute table as JSON
    Services {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[derive(Args)]
struct DeviceArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the device name
    #[arg(long)]
    name: Option<String>,

    /// Override the notification interval
    #[arg(long)]
    interval_ms: Option<u64>,
}

impl DeviceArgs {
    fn load(&self) -> anyhow::Result<DeviceConfig> {
        let mut config = match &self.config {
            Some(path) => DeviceConfig::load(path)?,
            None => DeviceConfig::default(),
        };
        if let Some(name) = &self.name {
            config.device_name = name.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            config.notify_interval_ms = interval_ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum UnitArg {
    C,
    F,
}

impl From<UnitArg> for UnitPreference {
    fn from(unit: UnitArg) -> Self {
        match unit {
            UnitArg::C => UnitPreference::Celsius,
            UnitArg::F => UnitPreference::Fahrenheit,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Run {
            device,
            celsius,
            unit,
        } => run(device.load()?, celsius, unit.map(UnitPreference::from)).await,
        Command::Encode { celsius, unit } => {
            let packet = encode_reading(celsius, unit.into())?;
            println!("{}", hex::encode(packet));
            Ok(())
        }
        Command::Advertise { device } => {
            let device = ThermometerDevice::from_config(device.load()?)?;
            println!("{}", hex::encode(device.advertising_data()?));
            Ok(())
        }
        Command::Services { device } => {
            let device = ThermometerDevice::from_config(device.load()?)?;
            let summary = device.registry().summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

async fn run(
    config: DeviceConfig,
    celsius: Option<f64>,
    unit: Option<UnitPreference>,
) -> anyhow::Result<()> {
    let device = Arc::new(match celsius {
        Some(value) => ThermometerDevice::new(config, Arc::new(FixedSensor::new(value)))?,
        None => ThermometerDevice::from_config(config)?,
    });

    let network = SimBleNetwork::new();
    let mut peripheral = network.create_peripheral();
    peripheral.set_att_mtu(device.config().att_mtu);
    let peripheral = Arc::new(peripheral);
    let mut advertisements = network.advertisements();

    let serving = {
        let device = Arc::clone(&device);
        let peripheral = Arc::clone(&peripheral);
        tokio::spawn(async move {
            device
                .run(&*peripheral, async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("Failed to listen for Ctrl-C: {}", e);
                    }
                })
                .await
        })
    };

    peripheral.power_on();
    let adv = advertisements
        .recv()
        .await
        .context("peripheral never advertised")?;
    if let Some(decoded) = AdvertisementData::decode(&adv.data) {
        log::info!(
            "Demo central saw '{}' advertising {:?}",
            decoded.local_name,
            decoded.service_uuids
        );
    }

    let central = network.connect(&adv.source_address).await?;
    let mut notifications = central.subscribe(TEMPERATURE).await?;
    if let Some(unit) = unit {
        central.write(UNIT, &[unit.ascii()]).await?;
    }

    let printer = tokio::spawn(async move {
        while let Some(bytes) = notifications.recv().await {
            match Reading::from_bytes(&bytes) {
                Some(reading) => {
                    log::info!("Temperature {:.2} {}", reading.degrees(), reading.unit)
                }
                None => log::warn!("Malformed notification {}", hex::encode(&bytes)),
            }
        }
    });

    serving.await??;
    printer.await?;
    Ok(())
}
