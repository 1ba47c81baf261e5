//! ローカルの画像ファイルに対してパイプラインを実行し、結果の JSON を表示する簡易バイナリ

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use smart_cattle_lib::model::{AppConfig, DeviceType, Settings};

#[derive(Parser)]
#[command(name = "predict_image")]
#[command(about = "Run the SmartCattle cascade on a local image")]
struct Cli {
    /// Path to the input image
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Path to the JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Breed confidence threshold (0-100), overrides the configured value
    #[arg(short, long)]
    threshold: Option<f64>,

    /// Only estimate the weight
    #[arg(long)]
    weight_only: bool,

    /// Compute device (cpu, wgpu)
    #[arg(long)]
    device: Option<DeviceType>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    smart_cattle_lib::init_logging();

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    if config.base_dir.is_none() {
        config.base_dir = AppConfig::directory_of(&config_path);
    }
    if let Some(device) = cli.device {
        config.set_device_type(device);
    }

    let image = std::fs::read(&cli.image)
        .with_context(|| format!("Failed to read image: {}", cli.image.display()))?;
    let pipeline = smart_cattle_lib::build_pipeline(&config);

    let output = if cli.weight_only {
        serde_json::to_string_pretty(&pipeline.predict_weight(&image)?)?
    } else {
        let settings = Settings {
            ai_threshold: cli.threshold.unwrap_or(config.settings.ai_threshold),
            ..config.settings.clone()
        };
        serde_json::to_string_pretty(&pipeline.run(&image, &settings)?)?
    };

    println!("{}", output);
    Ok(())
}
