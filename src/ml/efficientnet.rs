//! EfficientNet-B0
//!
//! 品種分類（timm形式のチェックポイント）と体重推定（torchvision形式）で共用します。
//! 出力層のサイズだけが異なり、特徴抽出部の構造は同一です。

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};

use crate::ml::layers::{
    global_avg_pool, Activation, ConvNormAct, ConvSpec, Gate, SqueezeExcitation,
};
use crate::model::KeyRemap;

/// ステージ定義
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub expand_ratio: usize,
    pub kernel: usize,
    pub stride: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub repeats: usize,
}

const fn stage(
    expand_ratio: usize,
    kernel: usize,
    stride: usize,
    in_channels: usize,
    out_channels: usize,
    repeats: usize,
) -> StageSpec {
    StageSpec {
        expand_ratio,
        kernel,
        stride,
        in_channels,
        out_channels,
        repeats,
    }
}

/// B0 の7ステージ（幅・深さ係数 1.0）
pub const B0_STAGES: [StageSpec; 7] = [
    stage(1, 3, 1, 32, 16, 1),
    stage(6, 3, 2, 16, 24, 2),
    stage(6, 5, 2, 24, 40, 2),
    stage(6, 3, 2, 40, 80, 3),
    stage(6, 5, 1, 80, 112, 3),
    stage(6, 5, 2, 112, 192, 4),
    stage(6, 3, 1, 192, 320, 1),
];

const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;

/// モデル設定
#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    /// 出力数（分類クラス数または回帰出力数）
    pub num_outputs: usize,
    /// BatchNorm の epsilon
    #[config(default = 1e-5)]
    pub norm_epsilon: f64,
    /// 分類層直前のドロップアウト率（推論時は無効）
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl EfficientNetConfig {
    /// B0 の標準設定
    pub fn b0(num_outputs: usize) -> Self {
        Self::new(num_outputs)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        let eps = self.norm_epsilon;
        let stages = B0_STAGES
            .iter()
            .map(|spec| {
                (0..spec.repeats)
                    .map(|i| {
                        let (in_channels, stride) = if i == 0 {
                            (spec.in_channels, spec.stride)
                        } else {
                            (spec.out_channels, 1)
                        };
                        MbConv::new(*spec, in_channels, stride, eps, device)
                    })
                    .collect()
            })
            .collect();

        let last_channels = B0_STAGES[B0_STAGES.len() - 1].out_channels;
        EfficientNet {
            stem: ConvNormAct::new(ConvSpec::new(3, STEM_CHANNELS, 3, 2), eps, Activation::Silu, device),
            stages,
            head: ConvNormAct::new(
                ConvSpec::pointwise(last_channels, HEAD_CHANNELS),
                eps,
                Activation::Silu,
                device,
            ),
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: LinearConfig::new(HEAD_CHANNELS, self.num_outputs).init(device),
        }
    }

    /// torchvision `efficientnet_b0` の state_dict キーを変換する規則
    ///
    /// `features.{s+1}.{i}.block.{p}` の `p` は拡張層の有無でずれる。
    pub fn torchvision_key_remaps() -> Vec<KeyRemap> {
        let mut rules = vec![
            KeyRemap::new(r"features\.0\.0\.", "stem.conv."),
            KeyRemap::new(r"features\.0\.1\.", "stem.norm."),
        ];

        for (s, spec) in B0_STAGES.iter().enumerate() {
            let layers: &[&str] = if spec.expand_ratio == 1 {
                &["depthwise", "se", "project"]
            } else {
                &["expand", "depthwise", "se", "project"]
            };
            for (position, layer) in layers.iter().enumerate() {
                let from = format!(r"features\.{}\.(\d+)\.block\.{}\.", s + 1, position);
                if *layer == "se" {
                    rules.push(KeyRemap::new(&from, format!("stages.{}.${{1}}.se.", s)));
                } else {
                    rules.push(KeyRemap::new(
                        &format!(r"{}0\.", from),
                        format!("stages.{}.${{1}}.{}.conv.", s, layer),
                    ));
                    rules.push(KeyRemap::new(
                        &format!(r"{}1\.", from),
                        format!("stages.{}.${{1}}.{}.norm.", s, layer),
                    ));
                }
            }
        }

        let head = B0_STAGES.len() + 1;
        rules.push(KeyRemap::new(&format!(r"features\.{}\.0\.", head), "head.conv."));
        rules.push(KeyRemap::new(&format!(r"features\.{}\.1\.", head), "head.norm."));
        rules.push(KeyRemap::new(r"classifier\.1\.", "classifier."));
        rules.push(KeyRemap::distributed_prefix());
        rules
    }

    /// timm `efficientnet_b0` の state_dict キーを変換する規則
    pub fn timm_key_remaps() -> Vec<KeyRemap> {
        let mut rules = vec![
            KeyRemap::new(r"conv_stem\.", "stem.conv."),
            KeyRemap::new(r"bn1\.", "stem.norm."),
            KeyRemap::new(r"conv_head\.", "head.conv."),
            KeyRemap::new(r"bn2\.", "head.norm."),
            // 先頭ステージは拡張層なし (DepthwiseSeparableConv)
            KeyRemap::new(r"blocks\.0\.(\d+)\.conv_dw\.", "stages.0.${1}.depthwise.conv."),
            KeyRemap::new(r"blocks\.0\.(\d+)\.bn1\.", "stages.0.${1}.depthwise.norm."),
            KeyRemap::new(r"blocks\.0\.(\d+)\.conv_pw\.", "stages.0.${1}.project.conv."),
            KeyRemap::new(r"blocks\.0\.(\d+)\.bn2\.", "stages.0.${1}.project.norm."),
        ];

        let inverted = [
            ("conv_pw", "expand.conv"),
            ("bn1", "expand.norm"),
            ("conv_dw", "depthwise.conv"),
            ("bn2", "depthwise.norm"),
            ("conv_pwl", "project.conv"),
            ("bn3", "project.norm"),
        ];
        for (from, to) in inverted {
            rules.push(KeyRemap::new(
                &format!(r"blocks\.([1-9])\.(\d+)\.{}\.", from),
                format!("stages.${{1}}.${{2}}.{}.", to),
            ));
        }

        rules.push(KeyRemap::new(
            r"blocks\.(\d+)\.(\d+)\.se\.conv_reduce\.",
            "stages.${1}.${2}.se.fc1.",
        ));
        rules.push(KeyRemap::new(
            r"blocks\.(\d+)\.(\d+)\.se\.conv_expand\.",
            "stages.${1}.${2}.se.fc2.",
        ));
        rules.push(KeyRemap::distributed_prefix());
        rules
    }
}

/// MBConv ブロック（拡張 → depthwise → SE → 射影）
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    pub expand: Option<ConvNormAct<B>>,
    pub depthwise: ConvNormAct<B>,
    pub se: SqueezeExcitation<B>,
    pub project: ConvNormAct<B>,
    residual: Ignored<bool>,
}

impl<B: Backend> MbConv<B> {
    fn new(spec: StageSpec, in_channels: usize, stride: usize, eps: f64, device: &B::Device) -> Self {
        let hidden = in_channels * spec.expand_ratio;
        let expand = (spec.expand_ratio != 1).then(|| {
            ConvNormAct::new(ConvSpec::pointwise(in_channels, hidden), eps, Activation::Silu, device)
        });
        let squeeze = (in_channels / 4).max(1);

        Self {
            expand,
            depthwise: ConvNormAct::new(
                ConvSpec::depthwise(hidden, spec.kernel, stride),
                eps,
                Activation::Silu,
                device,
            ),
            se: SqueezeExcitation::new(hidden, squeeze, Activation::Silu, Gate::Sigmoid, device),
            project: ConvNormAct::new(
                ConvSpec::pointwise(hidden, spec.out_channels),
                eps,
                Activation::Identity,
                device,
            ),
            residual: Ignored(stride == 1 && in_channels == spec.out_channels),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = expand.forward(x);
        }
        let x = self.depthwise.forward(x);
        let x = self.se.forward(x);
        let x = self.project.forward(x);

        if *self.residual {
            x + input
        } else {
            x
        }
    }
}

/// EfficientNet-B0 本体
///
/// # アーキテクチャ
/// - stem: Conv 3x3 stride 2 (3 -> 32) + BN + SiLU
/// - 7ステージ・16個の MBConv
/// - head: Conv 1x1 (320 -> 1280) + BN + SiLU
/// - 全体平均プーリング -> Dropout -> Linear (1280 -> num_outputs)
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    pub stem: ConvNormAct<B>,
    pub stages: Vec<Vec<MbConv<B>>>,
    pub head: ConvNormAct<B>,
    dropout: Dropout,
    pub classifier: Linear<B>,
}

impl<B: Backend> EfficientNet<B> {
    /// 順伝播 [batch, 3, H, W] -> [batch, num_outputs]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in self.stages.iter().flatten() {
            x = block.forward(x);
        }
        let x = self.head.forward(x);
        let x = self.dropout.forward(global_avg_pool(x));
        self.classifier.forward(x)
    }
}
