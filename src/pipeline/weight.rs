//! 体重推定（正規化された回帰値を kg に戻す）

use crate::error::InferenceError;
use crate::ml::PreprocessedTensor;
use crate::model::{ImageModel, ModelRole};
use crate::pipeline::forward_checked;
use crate::types::{round_to, WeightPrediction};

/// 学習時の正規化に使った最大体重（kg）
pub const MAX_WEIGHT: f64 = 1000.0;

/// 正規化値を kg に変換し、小数1桁に丸める
pub fn scale_weight(normalized: f32) -> WeightPrediction {
    WeightPrediction {
        kilograms: round_to(f64::from(normalized) * MAX_WEIGHT, 1),
    }
}

pub fn estimate(
    model: &dyn ImageModel,
    tensor: &PreprocessedTensor,
) -> Result<WeightPrediction, InferenceError> {
    let output = forward_checked(model, ModelRole::WeightRegressor, tensor)?;
    let weight = scale_weight(output[0]);
    log::info!("AI Regression: Estimated Weight = {}kg", weight.kilograms);
    Ok(weight)
}
