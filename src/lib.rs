//! SmartCattle AI バックエンド
//!
//! 牛判定 → 品種分類 → 体重推定 の3段階の推論と、それを提供する HTTP サーバー。

pub mod error;
pub mod ml;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod types;

use std::io::Write;
use std::sync::Arc;

use crate::model::{AppConfig, ModelRegistry, SettingsStore};
use crate::pipeline::InferencePipeline;
use crate::server::AppState;

pub use error::{DecodeError, InferenceError, ModelLoadError, PipelineError, SettingsError};
pub use types::{Breed, DetectionStatus, PredictionResult, WeightOnlyResult};

/// ログ出力の初期化（`RUST_LOG` 未指定時は info）
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();
}

/// 設定に従ってモデルを読み込み、推論パイプラインを構築する
pub fn build_pipeline(config: &AppConfig) -> InferencePipeline {
    let builder = ml::builder_for(config.device_type);
    let registry = ModelRegistry::load_all(config, builder.as_ref());

    let status = registry.status();
    log::info!(
        "モデル読み込み完了: validator={}, breed={}, weight={}",
        status.validator,
        status.breed,
        status.weight
    );
    InferencePipeline::new(Arc::new(registry))
}

/// 実行時設定ストアを構築する（保存先があればそこから復元）
pub fn build_settings_store(config: &AppConfig) -> SettingsStore {
    match &config.settings_path {
        Some(path) => {
            let path = match &config.base_dir {
                Some(base) => base.join(path),
                None => path.into(),
            };
            SettingsStore::with_persistence(config.settings.clone(), path)
        }
        None => SettingsStore::new(config.settings.clone()),
    }
}

/// サーバーを起動する（モデルは起動時に一度だけ読み込む）
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    config.display();

    let pipeline = build_pipeline(&config);
    let settings = Arc::new(build_settings_store(&config));

    server::startup(&config.server, AppState::new(pipeline, settings)).await?;
    Ok(())
}
