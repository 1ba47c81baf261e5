//! 推論パイプライン
//!
//! 前処理 → 牛判定 → 品種分類 → 体重推定 を1リクエスト内で順に実行します。
//! どの段階も再試行せず、順伝播の失敗はリクエスト全体を失敗させます。

pub mod breed;
pub mod validator;
pub mod weight;

use std::sync::Arc;

use crate::error::{InferenceError, PipelineError};
use crate::ml::{preprocess, PreprocessedTensor};
use crate::model::{ImageModel, ModelRegistry, ModelRole, Settings};
use crate::types::{ModelStatus, PredictionResult, WeightOnlyResult};

/// 推論パイプライン（モデルは読み取り専用で共有）
#[derive(Debug, Clone)]
pub struct InferencePipeline {
    registry: Arc<ModelRegistry>,
}

impl InferencePipeline {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn status(&self) -> ModelStatus {
        self.registry.status()
    }

    /// 画像1枚を判定する
    ///
    /// `settings` はリクエスト開始時に取得したスナップショットを渡すこと。
    pub fn run(&self, image: &[u8], settings: &Settings) -> Result<PredictionResult, PipelineError> {
        let tensor = preprocess(image)?;

        let validation = validator::validate(self.registry.capability(ModelRole::Validator), &tensor)?;
        if !validation.is_bovine {
            return Ok(PredictionResult::non_cattle());
        }

        let mut result = PredictionResult::cattle();

        match self.registry.capability(ModelRole::BreedClassifier).model() {
            Some(model) => {
                let prediction = breed::classify(model, &tensor, settings.ai_threshold)?;
                result.apply_breed(&prediction);
            }
            None => log::debug!("品種分類モデルなし: breed/confidence を省略します"),
        }

        if result.is_cow {
            if let Some(model) = self.registry.capability(ModelRole::WeightRegressor).model() {
                result.apply_weight(weight::estimate(model, &tensor)?);
            }
        }

        Ok(result)
    }

    /// 体重のみを推定する（体重モデルが必須）
    pub fn predict_weight(&self, image: &[u8]) -> Result<WeightOnlyResult, PipelineError> {
        let model = self
            .registry
            .capability(ModelRole::WeightRegressor)
            .model()
            .ok_or(PipelineError::MissingCapability(ModelRole::WeightRegressor))?;

        let tensor = preprocess(image)?;
        Ok(weight::estimate(model, &tensor)?.into())
    }
}

/// 順伝播を行い、出力の要素数と有限性を検証する
pub(crate) fn forward_checked(
    model: &dyn ImageModel,
    role: ModelRole,
    tensor: &PreprocessedTensor,
) -> Result<Vec<f32>, InferenceError> {
    let output = model.forward(tensor)?;
    if output.len() != role.output_size() {
        return Err(InferenceError::OutputSize {
            role,
            expected: role.output_size(),
            actual: output.len(),
        });
    }
    if output.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::NonFinite(role));
    }
    Ok(output)
}
