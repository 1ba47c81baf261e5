use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use smart_cattle_lib::model::{AppConfig, DeviceType};

#[derive(Parser)]
#[command(name = "smart-cattle")]
#[command(about = "SmartCattle AI backend: bovine validation, breed classification and weight estimation")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host to bind (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Compute device (cpu, wgpu)
    #[arg(long)]
    device: Option<DeviceType>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    smart_cattle_lib::init_logging();

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    if config.base_dir.is_none() {
        config.base_dir = AppConfig::directory_of(&config_path);
    }

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(device) = cli.device {
        config.set_device_type(device);
    }

    if cli.write_config {
        config
            .save(&config_path)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        log::info!("設定を保存しました: {}", config_path.display());
        return Ok(());
    }

    actix_web::rt::System::new().block_on(smart_cattle_lib::run(config))
}
