//! エラー型の定義
//!
//! 起動時のモデル読み込み、画像デコード、推論、設定更新の失敗をそれぞれ区別します。
//! いずれもリクエスト単位で閉じており、プロセスを停止させることはありません。

use std::path::PathBuf;

use thiserror::Error;

use crate::model::ModelRole;

/// モデル読み込みエラー（起動時のみ発生、致命的ではない）
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("checkpoint not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read checkpoint {}: {message}", path.display())]
    Unreadable { path: PathBuf, message: String },

    #[error("checkpoint {} does not match the {role} architecture: {message}", path.display())]
    Incompatible {
        path: PathBuf,
        role: ModelRole,
        message: String,
    },

    #[error("ML backend disabled")]
    BackendDisabled,
}

/// 画像デコードエラー（クライアント入力の不備）
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty image payload")]
    Empty,

    #[error("invalid image: {0}")]
    Image(#[from] image::ImageError),
}

/// 順伝播中のエラー
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("input tensor has {actual} values, expected {expected}")]
    InputShape { expected: usize, actual: usize },

    #[error("{role} produced {actual} outputs, expected {expected}")]
    OutputSize {
        role: ModelRole,
        expected: usize,
        actual: usize,
    },

    #[error("{0} produced a non-finite output")]
    NonFinite(ModelRole),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// パイプライン全体のエラー
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("{} model not loaded", .0.display_name())]
    MissingCapability(ModelRole),
}

impl PipelineError {
    /// クライアント側の入力に起因するエラーか
    pub fn is_client_error(&self) -> bool {
        matches!(self, PipelineError::Decode(_))
    }
}

/// 設定更新エラー
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings update must be a JSON object")]
    NotAnObject,

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to persist settings: {0}")]
    Persist(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_weight_message() {
        let err = PipelineError::MissingCapability(ModelRole::WeightRegressor);
        assert_eq!(err.to_string(), "Weight model not loaded");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_decode_is_client_error() {
        let err = PipelineError::from(DecodeError::Empty);
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "empty image payload");
    }
}
