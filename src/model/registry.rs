//! モデルレジストリ
//!
//! 3つのモデル（牛判定・品種分類・体重推定）を起動時に一度だけ読み込み、
//! それぞれを「利用可能」または「利用不可」の機能として保持します。
//! 読み込みに失敗してもプロセスは停止せず、他のモデルの提供を続けます。

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{InferenceError, ModelLoadError};
use crate::ml::PreprocessedTensor;
use crate::model::checkpoint::LoadMode;
use crate::model::config::AppConfig;
use crate::types::ModelStatus;

/// モデルの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelRole {
    Validator,
    BreedClassifier,
    WeightRegressor,
}

impl ModelRole {
    pub const ALL: [ModelRole; 3] = [
        ModelRole::Validator,
        ModelRole::BreedClassifier,
        ModelRole::WeightRegressor,
    ];

    /// 出力の要素数（ImageNet 1000クラス / 2品種 / 回帰1出力）
    pub fn output_size(self) -> usize {
        match self {
            ModelRole::Validator => 1000,
            ModelRole::BreedClassifier => 2,
            ModelRole::WeightRegressor => 1,
        }
    }

    /// チェックポイントの出所に応じた読み込みの厳密さ
    pub fn load_mode(self) -> LoadMode {
        match self {
            ModelRole::BreedClassifier => LoadMode::Lenient,
            ModelRole::Validator | ModelRole::WeightRegressor => LoadMode::Strict,
        }
    }

    /// エラーメッセージ用の表示名
    pub fn display_name(self) -> &'static str {
        match self {
            ModelRole::Validator => "Validator",
            ModelRole::BreedClassifier => "Breed",
            ModelRole::WeightRegressor => "Weight",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRole::Validator => write!(f, "validator"),
            ModelRole::BreedClassifier => write!(f, "breed classifier"),
            ModelRole::WeightRegressor => write!(f, "weight regressor"),
        }
    }
}

/// 読み込み済みモデルの推論インターフェース
///
/// 出力はバッチ1件分を平坦化した生の値（ロジットまたは回帰値）です。
/// 後処理（softmax・top-k）はバックエンドに依存しないよう `Vec<f32>` 上で行うため、
/// 出力はテンソルではなく平坦な値として受け渡します。
/// 複数リクエストから同時に呼ばれるため `Send + Sync` が必要です。
pub trait ImageModel: Send + Sync {
    fn forward(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError>;
}

/// 役割に応じたアーキテクチャを構築し、チェックポイントを読み込む
pub trait ModelBuilder {
    fn build(&self, role: ModelRole, path: &Path) -> Result<Arc<dyn ImageModel>, ModelLoadError>;
}

/// モデル機能（読み込み後は不変）
#[derive(Clone)]
pub enum Capability {
    Available(Arc<dyn ImageModel>),
    Unavailable { reason: String },
}

impl Capability {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Capability::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }

    pub fn model(&self) -> Option<&dyn ImageModel> {
        match self {
            Capability::Available(model) => Some(model.as_ref()),
            Capability::Unavailable { .. } => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Available(_) => write!(f, "Available"),
            Capability::Unavailable { reason } => write!(f, "Unavailable({})", reason),
        }
    }
}

/// モデルレジストリ
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    validator: Capability,
    breed: Capability,
    weight: Capability,
}

impl ModelRegistry {
    pub fn new(validator: Capability, breed: Capability, weight: Capability) -> Self {
        Self {
            validator,
            breed,
            weight,
        }
    }

    /// すべて利用不可のレジストリ
    pub fn unavailable(reason: &str) -> Self {
        Self::new(
            Capability::unavailable(reason),
            Capability::unavailable(reason),
            Capability::unavailable(reason),
        )
    }

    /// 設定に従って3つのモデルを読み込む（起動時に一度だけ呼ぶ）
    pub fn load_all(config: &AppConfig, builder: &dyn ModelBuilder) -> Self {
        let [validator, breed, weight] =
            ModelRole::ALL.map(|role| Self::load(role, &config.resolve_model_path(role), builder));
        Self::new(validator, breed, weight)
    }

    /// 1つのモデルを読み込む。失敗しても利用不可として返し、再試行はしない
    pub fn load(role: ModelRole, path: &Path, builder: &dyn ModelBuilder) -> Capability {
        log::info!("[{}] モデルを読み込んでいます: {}", role, path.display());

        let result = if path.exists() {
            builder.build(role, path)
        } else {
            Err(ModelLoadError::NotFound(path.to_path_buf()))
        };

        match result {
            Ok(model) => {
                log::info!("[{}] loaded successfully ({:?})", role, role.load_mode());
                Capability::Available(model)
            }
            Err(e) => {
                log::error!("[{}] 読み込みに失敗しました: {}", role, e);
                Capability::unavailable(e.to_string())
            }
        }
    }

    pub fn capability(&self, role: ModelRole) -> &Capability {
        match role {
            ModelRole::Validator => &self.validator,
            ModelRole::BreedClassifier => &self.breed,
            ModelRole::WeightRegressor => &self.weight,
        }
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            validator: self.validator.is_available(),
            breed: self.breed.is_available(),
            weight: self.weight.is_available(),
        }
    }
}
