//! モデル出力の後処理（softmax・上位k件）

/// 数値的に安定な softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// 確率の高い順に上位 `k` 件のインデックスを返す（同値は小さいインデックス優先）
pub fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    indices.truncate(k);
    indices
}

/// 最大値のインデックスと値
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    top_k(values, 1).first().map(|&i| (i, values[i]))
}
