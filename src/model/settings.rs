//! 実行時設定ストア
//!
//! 設定はリクエスト開始時にスナップショット（`Arc<Settings>`）として取得し、
//! 処理中に閾値が変わっても影響を受けないようにします。
//! 更新は既知のキーのみを部分的にマージし、未知のキーは無視します。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SettingsError;

/// 品種判定の既定の信頼度閾値（%）
pub const DEFAULT_AI_THRESHOLD: f64 = 75.0;

/// 実行時設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// 品種名を確定させるための確信度（0〜100）
    pub ai_threshold: f64,
    pub rfid_enabled: bool,
    pub cctv_enabled: bool,
    pub cctv_url: String,
    pub notification_email: String,
    pub language: String,
    pub units: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ai_threshold: DEFAULT_AI_THRESHOLD,
            rfid_enabled: true,
            cctv_enabled: false,
            cctv_url: "rtsp://192.168.1.55:554/live".to_string(),
            notification_email: "admin@smartcattle.ai".to_string(),
            language: "English".to_string(),
            units: "Metric (kg)".to_string(),
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<(), SettingsError> {
        if !self.ai_threshold.is_finite() || !(0.0..=100.0).contains(&self.ai_threshold) {
            return Err(SettingsError::InvalidValue {
                key: "ai_threshold".to_string(),
                message: format!("{} is outside 0-100", self.ai_threshold),
            });
        }
        Ok(())
    }
}

/// 設定ストア
#[derive(Debug)]
pub struct SettingsStore {
    current: RwLock<Arc<Settings>>,
    persist_path: Option<PathBuf>,
}

impl SettingsStore {
    /// メモリ上のみのストア
    pub fn new(initial: Settings) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            persist_path: None,
        }
    }

    /// ファイルに保存するストア。ファイルがあればその内容を初期値とする
    pub fn with_persistence(initial: Settings, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match load_settings(&path) {
            Ok(Some(saved)) => {
                log::info!("実行時設定を読み込みました: {}", path.display());
                saved
            }
            Ok(None) => initial,
            Err(e) => {
                log::warn!("実行時設定を読み込めません ({}): {}", path.display(), e);
                initial
            }
        };

        Self {
            current: RwLock::new(Arc::new(settings)),
            persist_path: Some(path),
        }
    }

    /// 現在の設定のスナップショット
    pub fn get(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 既知のキーだけをマージして新しいスナップショットを返す
    ///
    /// 既知のキーの型が合わない場合は更新全体を拒否し、ストアは変更しません。
    pub fn update(&self, patch: &Value) -> Result<Arc<Settings>, SettingsError> {
        let patch = patch.as_object().ok_or(SettingsError::NotAnObject)?;

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let merged = merge_known_keys(&guard, patch)?;
        merged.validate()?;

        let merged = Arc::new(merged);
        *guard = merged.clone();
        drop(guard);

        if let Some(path) = &self.persist_path {
            if let Err(e) = save_settings(path, &merged) {
                log::error!("{}", e);
            }
        }

        log::info!("設定を更新しました (ai_threshold = {})", merged.ai_threshold);
        Ok(merged)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

fn merge_known_keys(current: &Settings, patch: &Map<String, Value>) -> Result<Settings, SettingsError> {
    let base = match serde_json::to_value(current) {
        Ok(Value::Object(fields)) => fields,
        _ => return Err(SettingsError::NotAnObject),
    };

    let mut merged = base.clone();
    for (key, value) in patch {
        if !base.contains_key(key) {
            log::debug!("未知の設定キーを無視します: {}", key);
            continue;
        }

        // キー単位で型を検証し、不正なキー名を返す
        let mut candidate = base.clone();
        candidate.insert(key.clone(), value.clone());
        serde_json::from_value::<Settings>(Value::Object(candidate)).map_err(|e| {
            SettingsError::InvalidValue {
                key: key.clone(),
                message: e.to_string(),
            }
        })?;

        merged.insert(key.clone(), value.clone());
    }

    serde_json::from_value(Value::Object(merged)).map_err(|e| SettingsError::InvalidValue {
        key: "settings".to_string(),
        message: e.to_string(),
    })
}

fn load_settings(path: &Path) -> Result<Option<Settings>, SettingsError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| SettingsError::Persist(e.to_string()))?;
    let settings: Settings =
        serde_json::from_str(&content).map_err(|e| SettingsError::Persist(e.to_string()))?;
    settings.validate()?;
    Ok(Some(settings))
}

fn save_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let content =
        serde_json::to_string_pretty(settings).map_err(|e| SettingsError::Persist(e.to_string()))?;
    fs::write(path, content)
        .map_err(|e| SettingsError::Persist(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_merge_ignores_unknown_keys() {
        let store = SettingsStore::default();
        let updated = store
            .update(&json!({ "ai_threshold": 90, "bogus_key": 1 }))
            .unwrap();

        assert_eq!(updated.ai_threshold, 90.0);
        assert_eq!(updated.language, "English");

        let stored = serde_json::to_value(store.get().as_ref()).unwrap();
        assert!(stored.get("bogus_key").is_none());
        assert_eq!(stored["ai_threshold"], 90.0);
    }

    #[test]
    fn test_snapshot_is_immutable() {
        let store = SettingsStore::default();
        let before = store.get();
        store.update(&json!({ "ai_threshold": 95.5 })).unwrap();

        assert_eq!(before.ai_threshold, 75.0);
        assert_eq!(store.get().ai_threshold, 95.5);
    }

    #[test]
    fn test_wrong_type_rejects_whole_update() {
        let store = SettingsStore::default();
        let err = store
            .update(&json!({ "cctv_enabled": true, "ai_threshold": "high" }))
            .unwrap_err();

        match err {
            SettingsError::InvalidValue { key, .. } => assert_eq!(key, "ai_threshold"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!store.get().cctv_enabled);
    }

    #[test]
    fn test_threshold_range() {
        let store = SettingsStore::default();
        assert!(store.update(&json!({ "ai_threshold": 120 })).is_err());
        assert!(store.update(&json!({ "ai_threshold": -1 })).is_err());
        assert!(store.update(&json!({ "ai_threshold": 100 })).is_ok());
    }

    #[test]
    fn test_patch_must_be_object() {
        let store = SettingsStore::default();
        assert!(matches!(store.update(&json!([1, 2])), Err(SettingsError::NotAnObject)));
    }

    #[test]
    fn test_persistence_round_trip() {
        let path = std::env::temp_dir().join(format!("smart_cattle_settings_{}.json", std::process::id()));
        fs::remove_file(&path).ok();

        let store = SettingsStore::with_persistence(Settings::default(), &path);
        store.update(&json!({ "language": "Gujarati", "ai_threshold": 82.5 })).unwrap();

        let reloaded = SettingsStore::with_persistence(Settings::default(), &path);
        assert_eq!(reloaded.get().language, "Gujarati");
        assert_eq!(reloaded.get().ai_threshold, 82.5);

        fs::remove_file(path).ok();
    }
}
