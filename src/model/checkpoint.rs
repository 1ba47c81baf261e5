//! チェックポイントの正規化規則
//!
//! PyTorchのチェックポイントは次のいずれかの形式で保存されています。
//! - パラメータのマップそのもの
//! - `state_dict` フィールドを持つエンベロープ
//!
//! 分散学習（DataParallel）で保存されたキーには `module.` が付くため、照合前に取り除きます。
//! 読み込みの厳密さはモデルの役割ごとに異なります（[`LoadMode`]）。

use std::path::Path;

use crate::error::ModelLoadError;
use crate::model::ModelRole;

/// エンベロープ内のパラメータのキー
pub const STATE_DICT_KEY: &str = "state_dict";

/// 分散学習で付与されるキーの接頭辞
pub const DISTRIBUTED_PREFIX: &str = "module.";

/// BatchNormの学習ステップ数（推論側に対応するパラメータがない）
const UNTRACKED_BUFFER_SUFFIX: &str = "num_batches_tracked";

/// 読み込みの厳密さ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// 欠落・余剰キーがあれば失敗
    Strict,
    /// 欠落・余剰キーを許容してログに残す
    Lenient,
}

/// ネットワークとチェックポイントのキー照合結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReport {
    /// ネットワークにあるがチェックポイントにないキー
    pub missing: Vec<String>,
    /// チェックポイントにあるがネットワークにないキー
    pub unused: Vec<String>,
}

impl KeyReport {
    /// 厳密モードで問題となる余剰キー（BatchNormのカウンタは除く）
    fn significant_unused(&self) -> impl Iterator<Item = &String> {
        self.unused
            .iter()
            .filter(|k| !k.ends_with(UNTRACKED_BUFFER_SUFFIX))
    }

    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.significant_unused().next().is_none()
    }
}

/// 読み込みモードに従って照合結果を検証する
pub fn verify_keys(
    role: ModelRole,
    mode: LoadMode,
    report: &KeyReport,
    path: &Path,
) -> Result<(), ModelLoadError> {
    match mode {
        LoadMode::Strict if !report.is_exact() => {
            let unused: Vec<&String> = report.significant_unused().collect();
            Err(ModelLoadError::Incompatible {
                path: path.to_path_buf(),
                role,
                message: format!(
                    "missing keys: [{}], unexpected keys: [{}]",
                    preview(report.missing.iter()),
                    preview(unused.into_iter()),
                ),
            })
        }
        LoadMode::Strict => Ok(()),
        LoadMode::Lenient => {
            if !report.missing.is_empty() || !report.unused.is_empty() {
                log::warn!(
                    "[{}] 非厳密読み込み: 欠落 {} 件, 未使用 {} 件",
                    role,
                    report.missing.len(),
                    report.unused.len()
                );
                log::debug!("[{}] missing: {}", role, preview(report.missing.iter()));
                log::debug!("[{}] unused: {}", role, preview(report.unused.iter()));
            }
            Ok(())
        }
    }
}

fn preview<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    let keys: Vec<&String> = keys.collect();
    let shown: Vec<&str> = keys.iter().take(5).map(|k| k.as_str()).collect();
    if keys.len() > shown.len() {
        format!("{}, ... ({} total)", shown.join(", "), keys.len())
    } else {
        shown.join(", ")
    }
}

/// チェックポイントのキーをネットワークのパスに書き換える規則（正規表現）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRemap {
    pub pattern: String,
    pub replacement: String,
}

impl KeyRemap {
    /// `from` は先頭一致の正規表現。分散学習の接頭辞は自動的に許容される
    pub fn new(from: &str, to: impl Into<String>) -> Self {
        Self {
            pattern: format!(r"^(?:{})?{}", regex::escape(DISTRIBUTED_PREFIX), from),
            replacement: to.into(),
        }
    }

    /// 他の規則に該当しなかったキーから接頭辞だけを取り除く規則
    pub fn distributed_prefix() -> Self {
        Self {
            pattern: format!(r"^{}(.*)$", regex::escape(DISTRIBUTED_PREFIX)),
            replacement: "${1}".to_string(),
        }
    }
}
