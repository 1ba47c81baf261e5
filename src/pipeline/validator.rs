//! 牛判定（一次フィルタ）
//!
//! ImageNet の上位5クラスにウシ科のクラスが含まれるかで判定します。
//! モデルが利用できない場合は判定を行わず通過させます。

use crate::error::InferenceError;
use crate::ml::{softmax, top_k, PreprocessedTensor};
use crate::model::{Capability, ModelRole};
use crate::pipeline::forward_checked;
use crate::types::ValidationOutcome;

/// ウシ科のクラス（345: ox, 346: water buffalo, 347: bison）
pub const BOVINE_CLASS_INDICES: [usize; 3] = [345, 346, 347];

/// 判定に使う上位クラス数
pub const TOP_K: usize = 5;

pub fn validate(
    capability: &Capability,
    tensor: &PreprocessedTensor,
) -> Result<ValidationOutcome, InferenceError> {
    let model = match capability {
        Capability::Available(model) => model,
        Capability::Unavailable { reason } => {
            log::debug!("Validator: skipped ({})", reason);
            return Ok(ValidationOutcome {
                is_bovine: true,
                top_class: None,
            });
        }
    };

    let logits = forward_checked(model.as_ref(), ModelRole::Validator, tensor)?;
    let ranking = top_k(&softmax(&logits), TOP_K);
    let top_class = ranking.first().copied();

    let approved = ranking
        .iter()
        .find(|idx| BOVINE_CLASS_INDICES.contains(idx));
    match approved {
        Some(idx) => log::info!("Validator: Approved (Class {})", idx),
        None => log::info!("Validator: Rejected (Highest Class {:?})", top_class),
    }

    Ok(ValidationOutcome {
        is_bovine: approved.is_some(),
        top_class,
    })
}
