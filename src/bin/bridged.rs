//! Bridge daemon entry point.

use clap::Parser;
use dobot_bridge::adapter::ExternalAdapter;
use dobot_bridge::bridge::Bridge;
use dobot_bridge::config::{Config, TransportKind};
use dobot_bridge::plc::PlcDriver;
use dobot_bridge::robot::RobotDriver;
use dobot_bridge::safety::SafetySupervisor;
use dobot_bridge::telemetry::{ConsoleTelemetry, TelemetryPublisher};
use dobot_bridge::transport::Transport;
use std::sync::Arc;
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "config/bridge.yaml";

#[derive(Parser, Debug)]
#[command(name = "bridged", about = "Dobot Magician / S7-1200 bridge daemon")]
struct Args {
    /// Path to the bridge configuration YAML file.
    #[arg(long)]
    config: Option<String>,
}

impl Args {
    fn config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("BRIDGE_CONFIG_PATH").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }
}

fn build_transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    match config.robot.transport {
        TransportKind::Tcp => {
            let host = config
                .robot
                .host
                .clone()
                .ok_or_else(|| anyhow::anyhow!("robot.host is required for transport=tcp"))?;
            Ok(Arc::new(dobot_bridge::transport::TcpTransport::new(
                host,
                config.robot.port(),
            )))
        }
        #[cfg(feature = "serial")]
        TransportKind::Serial => {
            let path = config
                .robot
                .serial_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("robot.serialPath is required for transport=serial"))?;
            Ok(Arc::new(dobot_bridge::transport::SerialTransport::new(
                path,
                config.robot.baud(),
            )))
        }
        #[cfg(not(feature = "serial"))]
        TransportKind::Serial => {
            anyhow::bail!("built without the \"serial\" feature")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config_path = args.config_path();
    info!(path = %config_path, "loading bridge configuration");
    let config = Config::load_from_path(&config_path)?;

    let transport = build_transport(&config)?;
    let robot = Arc::new(RobotDriver::new(transport, config.robot.clone()));
    let plc = Arc::new(PlcDriver::new(config.plc.clone()));

    info!("connecting to robot");
    robot.connect().await?;
    info!("connecting to PLC");
    plc.connect().await?;

    let safety = SafetySupervisor::new(config.robot.envelope);
    let telemetry: Arc<dyn TelemetryPublisher> = Arc::new(ConsoleTelemetry::new());

    let (bridge, handle) = Bridge::new(
        robot.clone(),
        plc.clone(),
        safety,
        config.bridge.clone(),
        telemetry,
    );
    let bridge = Arc::new(bridge);

    let watchdog_plc = plc.clone();
    let watchdog_interval_ms = config.plc.watchdog_ms();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(watchdog_interval_ms));
        loop {
            ticker.tick().await;
            watchdog_plc.watchdog_tick().await;
        }
    });

    let bridge_task = tokio::spawn(bridge.clone().run());

    let adapter_safety = Arc::new(SafetySupervisor::new(config.robot.envelope));
    let _adapter = ExternalAdapter::new(handle.clone(), robot.clone(), adapter_safety, &config);

    info!("bridge ready, starting poll loop");
    handle.request_start().await;

    bridge_task.await?;
    Ok(())
}
