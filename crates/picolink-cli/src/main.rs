//! `picolink` – serial ↔ MQTT bridge and web console for the Pico flash tool.
//!
//! Subcommands:
//!
//! * `bridge` – relay the device's serial console to the log topic and
//!   command-topic payloads back to the device.
//! * `web` – serve the operator console, fed from the log topic.
//! * `local` – both of the above in one process over an in-process bus.
//! * `ports` – list serial ports.
//! * `config` – print the effective configuration, or write the default file.
//!
//! Ctrl-C stops the pump, disconnects from the broker and closes the port.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use colored::Colorize;
use picolink_cockpit::{FacadeContext, FacadeServer, LogAggregator};
use picolink_hal::{SerialChannelManager, SystemSerialOpener};
use picolink_middleware::{BridgeHandle, BridgeRelay, BusClient, LocalBus, MqttBus};
use picolink_types::{BridgeError, CommandEncoder, DeviceProtocol};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};

#[derive(Debug, Parser)]
#[command(name = "picolink", version, about = "Pico serial console over MQTT")]
struct Cli {
    /// Config file (default: ~/.picolink/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay the device serial console to and from the broker.
    Bridge {
        #[command(flatten)]
        serial: SerialArgs,
    },
    /// Serve the web console.
    Web {
        #[command(flatten)]
        web: WebArgs,
    },
    /// Bridge and web console in one process, without a broker.
    Local {
        #[command(flatten)]
        serial: SerialArgs,
        #[command(flatten)]
        web: WebArgs,
    },
    /// List serial ports.
    Ports,
    /// Print the effective configuration.
    Config {
        /// Write the default configuration file.
        #[arg(long)]
        init: bool,
        /// With --init, overwrite an existing file.
        #[arg(long, requires = "init")]
        force: bool,
    },
}

#[derive(Debug, clap::Args)]
struct SerialArgs {
    /// Serial device, e.g. /dev/ttyACM0 or COM7.
    #[arg(long)]
    port: Option<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// Do not print device output on stdout.
    #[arg(long)]
    no_echo: bool,
}

#[derive(Debug, clap::Args)]
struct WebArgs {
    #[arg(long)]
    http_port: Option<u16>,
    /// Device menu revision: classic or revised.
    #[arg(long)]
    protocol: Option<DeviceProtocol>,
}

impl SerialArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(port) = &self.port {
            cfg.serial_port = port.clone();
        }
        if let Some(baud) = self.baud {
            cfg.baud_rate = baud;
        }
        if self.no_echo {
            cfg.echo_device_output = false;
        }
    }
}

impl WebArgs {
    fn apply(&self, cfg: &mut Config) {
        if let Some(port) = self.http_port {
            cfg.http_port = port;
        }
        if let Some(protocol) = self.protocol {
            cfg.protocol = protocol;
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("picolink");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "picolink exited with an error");
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let path = cli.config.unwrap_or_else(config::config_path);

    match cli.command {
        Command::Ports => list_ports(),
        Command::Config { init: true, force } => {
            config::init_at(&path, force)?;
            println!(
                "  {} Config written to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            Ok(())
        }
        Command::Config { init: false, .. } => {
            let cfg = config::load_effective(&path)?;
            println!("{} {}", "#".dimmed(), path.display().to_string().dimmed());
            print!("{}", cfg.to_redacted_toml()?);
            Ok(())
        }
        Command::Bridge { serial } => {
            let mut cfg = config::load_effective(&path)?;
            serial.apply(&mut cfg);
            cfg.validate()?;
            with_runtime(|stop| run_bridge(cfg, stop))
        }
        Command::Web { web } => {
            let mut cfg = config::load_effective(&path)?;
            web.apply(&mut cfg);
            cfg.validate()?;
            with_runtime(|stop| run_web(cfg, stop))
        }
        Command::Local { serial, web } => {
            let mut cfg = config::load_effective(&path)?;
            serial.apply(&mut cfg);
            web.apply(&mut cfg);
            cfg.validate()?;
            with_runtime(|stop| run_local(cfg, stop))
        }
    }
}

/// Shutdown signal raised by Ctrl-C.
#[derive(Clone)]
struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    fn install() -> Self {
        let signal = Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        };
        let handler_signal = signal.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!();
            eprintln!("{}", "Ctrl-C received – shutting down …".yellow().bold());
            handler_signal.flag.store(true, Ordering::SeqCst);
            handler_signal.notify.notify_one();
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
        signal
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

fn with_runtime<F, Fut>(body: F) -> Result<(), CliError>
where
    F: FnOnce(StopSignal) -> Fut,
    Fut: Future<Output = Result<(), CliError>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    let stop = StopSignal::install();
    runtime.block_on(body(stop))
}

fn start_relay(
    cfg: &Config,
    bus: Arc<dyn BusClient>,
    stop: &StopSignal,
) -> Result<(Arc<SerialChannelManager>, BridgeHandle), CliError> {
    let serial = Arc::new(
        SerialChannelManager::new(cfg.serial_settings(), SystemSerialOpener)
            .with_shutdown(stop.flag.clone()),
    );
    let relay = BridgeRelay::new(serial.clone(), bus, &cfg.command_topic, &cfg.log_topic)
        .with_echo(cfg.echo_device_output)
        .with_shutdown(stop.flag.clone());
    let handle = Arc::new(relay).start()?;
    Ok((serial, handle))
}

async fn stop_relay(serial: Arc<SerialChannelManager>, handle: BridgeHandle) {
    if tokio::task::spawn_blocking(move || handle.stop()).await.is_err() {
        warn!("device pump did not stop cleanly");
    }
    serial.close();
}

fn facade_server(cfg: &Config, bus: Arc<dyn BusClient>) -> Result<FacadeServer, CliError> {
    let aggregator = Arc::new(LogAggregator::new(cfg.log_capacity));
    aggregator.attach(bus.as_ref(), &cfg.log_topic)?;
    let ctx = FacadeContext::new(
        aggregator,
        bus,
        CommandEncoder::new(cfg.protocol),
        &cfg.command_topic,
    );
    info!(protocol = %ctx.encoder.protocol(), "command encoder ready");
    Ok(FacadeServer::new(Arc::new(ctx)).with_port(cfg.http_port))
}

async fn run_bridge(cfg: Config, stop: StopSignal) -> Result<(), CliError> {
    let bus = Arc::new(MqttBus::connect(cfg.mqtt_config("bridge"))?);
    let (serial, handle) = start_relay(&cfg, bus.clone(), &stop)?;

    stop.wait().await;

    stop_relay(serial, handle).await;
    bus.shutdown().await;
    info!("bridge stopped");
    Ok(())
}

async fn run_web(cfg: Config, stop: StopSignal) -> Result<(), CliError> {
    let bus = Arc::new(MqttBus::connect(cfg.mqtt_config("web"))?);
    let server = facade_server(&cfg, bus.clone())?;

    let outcome = tokio::select! {
        result = server.run() => result,
        () = stop.wait() => Ok(()),
    };

    bus.shutdown().await;
    outcome?;
    info!("web console stopped");
    Ok(())
}

async fn run_local(cfg: Config, stop: StopSignal) -> Result<(), CliError> {
    let bus: Arc<dyn BusClient> = Arc::new(LocalBus::default());
    let server = facade_server(&cfg, bus.clone())?;
    let (serial, handle) = start_relay(&cfg, bus.clone(), &stop)?;

    let outcome = tokio::select! {
        result = server.run() => result,
        () = stop.wait() => Ok(()),
    };

    stop.flag.store(true, Ordering::SeqCst);
    stop_relay(serial, handle).await;
    bus.shutdown().await;
    outcome?;
    info!("local console stopped");
    Ok(())
}

fn list_ports() -> Result<(), CliError> {
    let ports = picolink_hal::list_ports()?;
    if ports.is_empty() {
        println!("  {}", "No serial ports found.".yellow());
        return Ok(());
    }

    println!(
        "  {:<24} {:<10} {:<11} {}",
        "PORT".bold(),
        "TYPE".bold(),
        "VID:PID".bold(),
        "DESCRIPTION".bold()
    );
    for port in ports {
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
            _ => "-".to_string(),
        };
        let description = [port.manufacturer, port.product]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "  {:<24} {:<10} {:<11} {}",
            port.port_name.cyan(),
            port.port_type,
            ids,
            description.dimmed()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn bridge_flags_override_config() {
        let cli = Cli::try_parse_from([
            "picolink", "bridge", "--port", "COM7", "--baud", "9600", "--no-echo",
        ])
        .unwrap();
        let Command::Bridge { serial } = cli.command else {
            panic!("expected bridge subcommand");
        };
        let mut cfg = Config::default();
        serial.apply(&mut cfg);
        assert_eq!(cfg.serial_port, "COM7");
        assert_eq!(cfg.baud_rate, 9600);
        assert!(!cfg.echo_device_output);
    }

    #[test]
    fn web_flags_parse_protocol() {
        let cli = Cli::try_parse_from([
            "picolink", "--config", "/tmp/p.toml", "web", "--http-port", "8080", "--protocol",
            "revised",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));
        let Command::Web { web } = cli.command else {
            panic!("expected web subcommand");
        };
        let mut cfg = Config::default();
        web.apply(&mut cfg);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.protocol, DeviceProtocol::Revised);
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        assert!(Cli::try_parse_from(["picolink", "web", "--protocol", "v3"]).is_err());
    }

    #[test]
    fn force_requires_init() {
        assert!(Cli::try_parse_from(["picolink", "config", "--force"]).is_err());
        assert!(Cli::try_parse_from(["picolink", "config", "--init", "--force"]).is_ok());
    }

    #[test]
    fn unset_flags_leave_config_alone() {
        let cli = Cli::try_parse_from(["picolink", "local"]).unwrap();
        let Command::Local { serial, web } = cli.command else {
            panic!("expected local subcommand");
        };
        let mut cfg = Config::default();
        serial.apply(&mut cfg);
        web.apply(&mut cfg);
        assert_eq!(cfg, Config::default());
    }

    #[tokio::test]
    async fn facade_server_listens_on_configured_port() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = Config {
            http_port: 8123,
            ..Config::default()
        };
        let bus: Arc<dyn BusClient> = Arc::new(LocalBus::default());
        let server = facade_server(&cfg, bus)?;
        assert_eq!(server.port(), 8123);
        Ok(())
    }
}
