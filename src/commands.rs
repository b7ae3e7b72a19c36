use crate::connection::SessionConfig;
use crate::registers::ControllerModel;
use std::net::IpAddr;

#[derive(clap::Parser)]
#[group(id = "commands::TargetArgs")]
pub struct TargetArgs {
    /// Device id the controller announces (see `discover`).
    #[arg(long, short = 'd')]
    device_id: String,

    /// Address of the controller on the local network.
    #[arg(long, short = 'i')]
    ip: IpAddr,

    /// Email identifier the controller accepts sessions for.
    #[arg(long, short = 'e')]
    email: String,

    #[arg(long, default_value_t = crate::tunnel::TUNNEL_PORT)]
    port: u16,

    /// Controller family whose register catalog describes the device.
    #[arg(long, value_enum, default_value_t = ControllerModel::Optima270)]
    model: ControllerModel,

    /// If a reply isn't received in this amount of time, consider the
    /// request failed.
    #[arg(long, default_value = "5s")]
    request_timeout: humantime::Duration,
}

impl TargetArgs {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.device_id.clone(), self.ip, self.email.clone());
        config.port = self.port;
        config.request_timeout = *self.request_timeout;
        config
    }
}

pub mod registers {
    use crate::output;
    use crate::registers::{Catalog, ControllerModel};

    /// Search and output the known registers of a controller family.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        #[arg(long, value_enum, default_value_t = ControllerModel::Optima270)]
        model: ControllerModel,
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce output")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct RegisterSchema {
        kind: &'static str,
        key: &'static str,
        name: &'static str,
        read_address: u32,
        write_address: Option<u32>,
        divider: i32,
        offset: i32,
        min: Option<i32>,
        max: Option<i32>,
        unit: &'static str,
        write_only: bool,
    }

    impl RegisterSchema {
        fn all(catalog: &'static Catalog) -> impl Iterator<Item = Self> {
            let datapoints = catalog.datapoints.iter().map(|reg| RegisterSchema {
                kind: "datapoint",
                key: reg.key,
                name: reg.name,
                read_address: reg.address,
                write_address: None,
                divider: reg.divider,
                offset: reg.offset,
                min: None,
                max: None,
                unit: reg.unit,
                write_only: false,
            });
            let setpoints = catalog.setpoints.iter().map(|reg| RegisterSchema {
                kind: "setpoint",
                key: reg.key,
                name: reg.name,
                read_address: u32::from(reg.read_address),
                write_address: Some(u32::from(reg.write_address)),
                divider: reg.divider,
                offset: reg.offset,
                min: Some(reg.min),
                max: Some(reg.max),
                unit: reg.unit,
                write_only: reg.write_only,
            });
            datapoints.chain(setpoints)
        }

        fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_uppercase();
            self.key.contains(&pattern)
                || self.name.to_uppercase().contains(&pattern)
                || self.read_address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let catalog = Catalog::for_model(args.model);
        let mut output = args.output.to_output()?;
        output.table_headers(vec![
            "Kind", "Key", "Name", "Read", "Write", "Div", "Off", "Min", "Max", "Unit",
        ])?;
        for register in RegisterSchema::all(catalog) {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        register.kind.to_string(),
                        register.key.to_string(),
                        register.name.to_string(),
                        register.read_address.to_string(),
                        register
                            .write_address
                            .map(|a| a.to_string())
                            .unwrap_or_default(),
                        register.divider.to_string(),
                        register.offset.to_string(),
                        register.min.map(|v| v.to_string()).unwrap_or_default(),
                        register.max.map(|v| v.to_string()).unwrap_or_default(),
                        register.unit.to_string(),
                    ]
                },
                || &register,
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod discover {
    use crate::{discovery, output, tunnel};
    use std::net::IpAddr;

    /// Find controllers on the local network.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,

        /// Probe one address instead of broadcasting; for routed segments
        /// where broadcast is filtered.
        #[arg(long)]
        ip: Option<IpAddr>,

        /// Only ask for one specific device id.
        #[arg(long, default_value = discovery::WILDCARD_DEVICE_ID)]
        device_id: String,

        #[arg(long, default_value_t = tunnel::TUNNEL_PORT)]
        port: u16,

        #[arg(long, default_value = "5s")]
        timeout: humantime::Duration,

        #[arg(long, default_value = "3")]
        retries: u32,

        #[arg(long, default_value = "1s")]
        retry_interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("discovery failed")]
        Discovery(#[from] discovery::Error),
        #[error("could not produce output")]
        Output(#[from] output::Error),
        #[error("no device answered the probe")]
        NoAnswer,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let config = discovery::Config {
            device_id: args.device_id.clone(),
            port: args.port,
            timeout: *args.timeout,
            retries: args.retries,
            retry_interval: *args.retry_interval,
        };
        let devices = match args.ip {
            Some(ip) => match discovery::probe(&config, ip).await? {
                Some(device) => vec![device],
                None => return Err(Error::NoAnswer),
            },
            None => discovery::discover(&config).await?,
        };
        let mut output = args.output.to_output()?;
        output.table_headers(vec!["Device", "Address", "Port"])?;
        for device in &devices {
            output.result(
                || {
                    vec![
                        device.device_id.clone(),
                        device.ip.to_string(),
                        device.port.to_string(),
                    ]
                },
                || device,
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod read {
    use super::TargetArgs;
    use crate::connection::Session;
    use crate::output;
    use crate::registers::{convert_datapoint_value, convert_setpoint_value, Catalog};

    /// Connect to a controller and read every register once.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        target: TargetArgs,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("talking to the controller failed")]
        Session(#[from] crate::connection::Error),
        #[error("could not produce output")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Readout {
        kind: &'static str,
        key: &'static str,
        name: &'static str,
        raw: i32,
        value: f32,
        unit: &'static str,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let catalog = Catalog::for_model(args.target.model);
        let (session, _events) = Session::connect(args.target.session_config()).await?;
        let datapoints = session
            .read_datapoints(catalog.datapoint_request_list())
            .await?;
        let setpoints = session
            .read_setpoints(catalog.setpoint_request_list())
            .await?;
        session.disconnect().await;

        let mut readouts = Vec::new();
        for (reg, raw) in catalog.datapoints.iter().zip(datapoints) {
            readouts.push(Readout {
                kind: "datapoint",
                key: reg.key,
                name: reg.name,
                raw: i32::from(raw),
                value: convert_datapoint_value(raw, reg),
                unit: reg.unit,
            });
        }
        for (reg, raw) in catalog.readable_setpoints().zip(setpoints) {
            readouts.push(Readout {
                kind: "setpoint",
                key: reg.key,
                name: reg.name,
                raw: i32::from(raw),
                value: convert_setpoint_value(raw, reg),
                unit: reg.unit,
            });
        }

        let mut output = args.output.to_output()?;
        output.table_headers(vec!["Kind", "Key", "Name", "Raw", "Value", "Unit"])?;
        for readout in &readouts {
            output.result(
                || {
                    vec![
                        readout.kind.to_string(),
                        readout.key.to_string(),
                        readout.name.to_string(),
                        readout.raw.to_string(),
                        readout.value.to_string(),
                        readout.unit.to_string(),
                    ]
                },
                || readout,
            )?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod set {
    use super::TargetArgs;
    use crate::device::{Device, DeviceConfig};

    /// Connect to a controller and write one setpoint by display name,
    /// e.g. `set temperatureSetpoint 22`.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        target: TargetArgs,
        name: String,
        value: f32,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("writing the setpoint failed")]
        Device(#[from] crate::device::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let config = DeviceConfig::new(args.target.session_config(), args.target.model);
        let (device, _events) = Device::connect(config).await?;
        let result = device.set_value(&args.name, args.value).await;
        device.disconnect().await;
        result?;
        Ok(())
    }
}

pub mod monitor {
    use super::TargetArgs;
    use crate::device::{DataChange, Device, DeviceConfig, DeviceEvent};
    use crate::tunnel::ModelInfo;
    use tracing::{info, warn};

    /// Connect to a controller and keep polling it, printing one JSON
    /// line per event. Reconnects on a fixed backoff until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        target: TargetArgs,

        #[arg(long, default_value = "30s")]
        poll_interval: humantime::Duration,

        /// How long to wait before reconnecting after the session drops.
        #[arg(long, default_value = "60s")]
        reconnect_backoff: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not serialize an event")]
        SerializeJson(#[from] serde_json::Error),
    }

    #[derive(serde::Serialize)]
    #[serde(tag = "event", rename_all = "snake_case")]
    enum Row<'a> {
        Connected,
        Disconnected,
        Model { info: &'a ModelInfo },
        Data { change: &'a DataChange },
        Polled,
        Error { message: String },
    }

    fn print(event: &DeviceEvent) -> Result<(), Error> {
        let row = match event {
            DeviceEvent::Connected => Row::Connected,
            DeviceEvent::Disconnected => Row::Disconnected,
            DeviceEvent::Model(info) => Row::Model { info },
            DeviceEvent::Data(change) => Row::Data { change },
            DeviceEvent::Polled => Row::Polled,
            DeviceEvent::Error(error) => Row::Error {
                message: error.to_string(),
            },
        };
        println!("{}", serde_json::to_string(&row)?);
        Ok(())
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        loop {
            let mut config = DeviceConfig::new(args.target.session_config(), args.target.model);
            config.poll_interval = *args.poll_interval;
            match Device::connect(config).await {
                Err(error) => warn!(message = "could not connect", %error),
                Ok((device, mut events)) => loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            device.disconnect().await;
                            return Ok(());
                        }
                        event = events.recv() => match event {
                            None => break,
                            Some(event) => {
                                print(&event)?;
                                if matches!(event, DeviceEvent::Disconnected) {
                                    break;
                                }
                            }
                        },
                    }
                },
            }
            info!(
                message = "waiting before reconnecting",
                backoff = %args.reconnect_backoff,
            );
            tokio::select! {
                _ = tokio::time::sleep(*args.reconnect_backoff) => {}
                _ = tokio::signal::ctrl_c() => return Ok(()),
            }
        }
    }
}
