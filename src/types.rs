use serde::{Deserialize, Serialize};

/// 重量の単位
pub const WEIGHT_UNIT: &str = "kg";

// 判定ステータス（フロントエンドに表示される文字列そのもの）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionStatus {
    #[serde(rename = "Cattle Detected")]
    CattleDetected,
    #[serde(rename = "Non-Cattle Detected")]
    NonCattleDetected,
    #[serde(rename = "Unknown Asset Detected")]
    UnknownAssetDetected,
    #[serde(rename = "Unrecognized Breed")]
    UnrecognizedBreed,
}

impl std::fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionStatus::CattleDetected => write!(f, "Cattle Detected"),
            DetectionStatus::NonCattleDetected => write!(f, "Non-Cattle Detected"),
            DetectionStatus::UnknownAssetDetected => write!(f, "Unknown Asset Detected"),
            DetectionStatus::UnrecognizedBreed => write!(f, "Unrecognized Breed"),
        }
    }
}

// 品種ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Breed {
    Gir,
    Kankrej,
    Undefined,
}

impl std::fmt::Display for Breed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Breed::Gir => write!(f, "Gir"),
            Breed::Kankrej => write!(f, "Kankrej"),
            Breed::Undefined => write!(f, "Undefined"),
        }
    }
}

/// 牛判定の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub is_bovine: bool,
    /// 最上位クラスのインデックス（診断用。ゲート無効時は None）
    pub top_class: Option<usize>,
}

/// 品種分類の結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreedPrediction {
    /// 分類後も牛とみなせるか
    pub is_cow: bool,
    pub status: DetectionStatus,
    pub breed: Breed,
    /// 0〜100 の確信度（丸め前）
    pub confidence: f64,
}

/// 推定体重（kg、小数1桁）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightPrediction {
    pub kilograms: f64,
}

/// `/predict` の応答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub is_cow: bool,
    pub status: DetectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breed: Option<Breed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl PredictionResult {
    /// 牛ではないと判定された場合の結果（体重は決して含まない）
    pub fn non_cattle() -> Self {
        Self {
            is_cow: false,
            status: DetectionStatus::NonCattleDetected,
            breed: Some(Breed::Undefined),
            confidence: Some(0.0),
            estimated_weight: None,
            unit: None,
        }
    }

    /// 牛判定を通過した直後の結果（品種分類・体重推定前）
    pub fn cattle() -> Self {
        Self {
            is_cow: true,
            status: DetectionStatus::CattleDetected,
            breed: None,
            confidence: None,
            estimated_weight: None,
            unit: None,
        }
    }

    pub fn apply_breed(&mut self, prediction: &BreedPrediction) {
        self.is_cow = prediction.is_cow;
        self.status = prediction.status;
        self.breed = Some(prediction.breed);
        self.confidence = Some(round_to(prediction.confidence, 2));
    }

    pub fn apply_weight(&mut self, weight: WeightPrediction) {
        if !self.is_cow {
            return;
        }
        self.estimated_weight = Some(weight.kilograms);
        self.unit = Some(WEIGHT_UNIT.to_string());
    }
}

/// `/predict_weight` の応答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightOnlyResult {
    pub estimated_weight: f64,
    pub unit: String,
}

impl From<WeightPrediction> for WeightOnlyResult {
    fn from(weight: WeightPrediction) -> Self {
        Self {
            estimated_weight: weight.kilograms,
            unit: WEIGHT_UNIT.to_string(),
        }
    }
}

/// 各モデルの読み込み状況
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub validator: bool,
    pub breed: bool,
    pub weight: bool,
}

/// 小数点以下 `digits` 桁に丸める
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}
