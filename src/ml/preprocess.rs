//! 入力画像の前処理
//!
//! 3つのモデルすべてが同じテンソル形状と正規化定数を共有します。

use image::imageops::FilterType;

use crate::error::{DecodeError, InferenceError};

/// 画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 224;

/// チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// ImageNetの平均
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNetの標準偏差
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 前処理済みテンソル [1, 3, 224, 224]（CHW順で平坦化）
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessedTensor {
    data: Vec<f32>,
}

impl PreprocessedTensor {
    /// 要素数
    pub const LEN: usize = CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

    /// 平坦化済みデータから生成（長さが合わなければエラー）
    pub fn from_vec(data: Vec<f32>) -> Result<Self, InferenceError> {
        if data.len() != Self::LEN {
            return Err(InferenceError::InputShape {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        Ok(Self { data })
    }

    pub fn shape(&self) -> [usize; 4] {
        [1, CHANNELS, IMAGE_SIZE, IMAGE_SIZE]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// 画像バイト列をデコードし、リサイズ・正規化する
///
/// 1. RGBに変換
/// 2. 224x224 にバイリニア補間でリサイズ
/// 3. [0, 1] に変換後、チャネルごとに平均・標準偏差で正規化
pub fn preprocess(bytes: &[u8]) -> Result<PreprocessedTensor, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let img = image::load_from_memory(bytes)?.to_rgb8();
    let resized = image::imageops::resize(
        &img,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        FilterType::Triangle,
    );

    let mut data = Vec::with_capacity(PreprocessedTensor::LEN);
    for channel in 0..CHANNELS {
        for y in 0..IMAGE_SIZE as u32 {
            for x in 0..IMAGE_SIZE as u32 {
                let pixel = resized.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - MEAN[channel]) / STD[channel]);
            }
        }
    }

    Ok(PreprocessedTensor { data })
}
