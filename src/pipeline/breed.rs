//! 品種分類と確信度による判定
//!
//! 判定は上から順に評価します。
//! 1. 確信度が [`RELIABILITY_FLOOR`] 未満: 牛ではない可能性が高い（Unknown Asset Detected）
//! 2. 確信度が設定の閾値未満: 牛だが品種は確定しない（Unrecognized Breed）
//! 3. それ以外: 最大確率のクラスを品種とする
//!
//! 既定の閾値 75.0 は固定の下限 80.0 より小さいため、既定設定では 2 に到達しない。

use crate::error::InferenceError;
use crate::ml::{argmax, softmax, PreprocessedTensor};
use crate::model::{ImageModel, ModelRole};
use crate::pipeline::forward_checked;
use crate::types::{Breed, BreedPrediction, DetectionStatus};

/// 出力クラスの順序
pub const CLASS_NAMES: [Breed; 2] = [Breed::Gir, Breed::Kankrej];

/// これ未満の確信度は牛として扱わない（%）
pub const RELIABILITY_FLOOR: f64 = 80.0;

/// 確信度（0〜100）と閾値から判定する
pub fn decide(predicted: Breed, confidence: f64, threshold: f64) -> BreedPrediction {
    let (is_cow, status, breed) = if confidence < RELIABILITY_FLOOR {
        (false, DetectionStatus::UnknownAssetDetected, Breed::Undefined)
    } else if confidence < threshold {
        (true, DetectionStatus::UnrecognizedBreed, Breed::Undefined)
    } else {
        (true, DetectionStatus::CattleDetected, predicted)
    };

    BreedPrediction {
        is_cow,
        status,
        breed,
        confidence,
    }
}

pub fn classify(
    model: &dyn ImageModel,
    tensor: &PreprocessedTensor,
    threshold: f64,
) -> Result<BreedPrediction, InferenceError> {
    let logits = forward_checked(model, ModelRole::BreedClassifier, tensor)?;
    let probabilities = softmax(&logits);
    let (index, probability) = argmax(&probabilities).ok_or(InferenceError::OutputSize {
        role: ModelRole::BreedClassifier,
        expected: CLASS_NAMES.len(),
        actual: 0,
    })?;

    let predicted = CLASS_NAMES[index];
    let confidence = f64::from(probability) * 100.0;
    log::info!("AI Check: Class={}, Confidence={:.2}%", predicted, confidence);

    let prediction = decide(predicted, confidence, threshold);
    if prediction.status != DetectionStatus::CattleDetected {
        log::info!("AI Check: {} (threshold {:.1}%)", prediction.status, threshold);
    }
    Ok(prediction)
}
