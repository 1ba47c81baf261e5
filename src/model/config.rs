//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、モデルファイルのパス、サーバー設定などをJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::registry::ModelRole;
use crate::model::settings::Settings;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "wgpu" | "gpu" => Ok(DeviceType::Wgpu),
            other => Err(format!("unknown device '{}' (expected cpu or wgpu)", other)),
        }
    }
}

/// モデルファイルの設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPaths {
    /// 牛判定モデル（MobileNetV3-Small, ImageNet 1000クラス）
    pub validator: String,
    /// 品種分類モデル（EfficientNet-B0, timm, 2クラス）
    pub breed: String,
    /// 体重推定モデル（EfficientNet-B0, torchvision, 1出力）
    pub weight: String,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            validator: "mobilenet_v3_small.pth".to_string(),
            breed: "best_model_v2.pth".to_string(),
            weight: "cow_weight_b0_best.pth".to_string(),
        }
    }
}

impl ModelPaths {
    pub fn get(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Validator => &self.validator,
            ModelRole::BreedClassifier => &self.breed,
            ModelRole::WeightRegressor => &self.weight,
        }
    }
}

/// サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// モデル設定
    #[serde(default)]
    pub models: ModelPaths,
    /// サーバー設定
    #[serde(default)]
    pub server: ServerSettings,
    /// 実行時設定の保存先（None の場合はメモリ上のみ）
    #[serde(default)]
    pub settings_path: Option<String>,
    /// 実行時設定の初期値
    #[serde(default)]
    pub settings: Settings,
    /// 相対パスの基準ディレクトリ（設定ファイルの場所、保存しない）
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.base_dir = Self::directory_of(path);
        Ok(config)
    }

    /// 設定ファイルのあるディレクトリを絶対パスで返す
    ///
    /// `config.json` のような相対パスでも親ディレクトリを辿れるようにする。
    pub fn directory_of(path: &Path) -> Option<PathBuf> {
        std::path::absolute(path)
            .ok()?
            .parent()
            .map(Path::to_path_buf)
    }

    /// 指定パスから設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}",
                        path.display(),
                        e
                    );
                    log::warn!("デフォルト設定を使用します");
                    Self::default()
                }
            }
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// モデルファイルのパスを解決する
    ///
    /// 絶対パスはそのまま使用します。相対パスは設定ファイルのディレクトリ、
    /// その親ディレクトリの順に探し、見つからなければ最初の候補を返します。
    pub fn resolve_model_path(&self, role: ModelRole) -> PathBuf {
        let configured = Path::new(self.models.get(role));
        if configured.is_absolute() {
            return configured.to_path_buf();
        }

        let base = self
            .base_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let mut candidates = vec![base.join(configured)];
        if let Some(parent) = base.parent() {
            candidates.push(parent.join(configured));
        }

        candidates
            .iter()
            .find(|p| p.exists())
            .cloned()
            .unwrap_or_else(|| candidates[0].clone())
    }

    /// 計算デバイスを設定
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    /// 設定情報を表示
    pub fn display(&self) {
        log::info!("=== アプリケーション設定 ===");
        log::info!("計算デバイス: {}", self.device_type);
        for role in ModelRole::ALL {
            log::info!("{} model: {}", role, self.resolve_model_path(role).display());
        }
        log::info!("サーバー: {}:{}", self.server.host, self.server.port);
        match &self.settings_path {
            Some(path) => log::info!("実行時設定の保存先: {}", path),
            None => log::info!("実行時設定: メモリ上のみ"),
        }
    }
}
