//! MobileNetV3-Small（ImageNet 1000クラス）
//!
//! 牛判定の一次フィルタとして使用します。チェックポイントは torchvision 形式。

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

/// 反転残差ブロックの定義
#[derive(Debug, Clone, Copy)]
pub struct BlockSpec {
    pub in_channels: usize,
    pub kernel: usize,
    pub expanded: usize,
    pub out_channels: usize,
    pub use_se: bool,
    pub activation: Activation,
    pub stride: usize,
}

const fn block(
    in_channels: usize,
    kernel: usize,
    expanded: usize,
    out_channels: usize,
    use_se: bool,
    activation: Activation,
    stride: usize,
) -> BlockSpec {
    BlockSpec {
        in_channels,
        kernel,
        expanded,
        out_channels,
        use_se,
        activation,
        stride,
    }
}

const RE: Activation = Activation::Relu;
const HS: Activation = Activation::Hardswish;

pub const SMALL_BLOCKS: [BlockSpec; 11] = [
    block(16, 3, 16, 16, true, RE, 2),
    block(16, 3, 72, 24, false, RE, 2),
    block(24, 3, 88, 24, false, RE, 1),
    block(24, 5, 96, 40, true, HS, 2),
    block(40, 5, 240, 40, true, HS, 1),
    block(40, 5, 240, 40, true, HS, 1),
    block(40, 5, 120, 48, true, HS, 1),
    block(48, 5, 144, 48, true, HS, 1),
    block(48, 5, 288, 96, true, HS, 2),
    block(96, 5, 576, 96, true, HS, 1),
    block(96, 5, 576, 96, true, HS, 1),
];

const STEM_CHANNELS: usize = 16;
const HIDDEN_FEATURES: usize = 1024;

/// `value` を `divisor` の倍数に丸める（10%以上は小さくしない）
pub fn make_divisible(value: usize, divisor: usize) -> usize {
    let rounded = ((value + divisor / 2) / divisor * divisor).max(divisor);
    if rounded * 10 < value * 9 {
        rounded + divisor
    } else {
        rounded
    }
}

/// モデル設定
#[derive(Config, Debug)]
pub struct MobileNetV3Config {
    pub num_classes: usize,
    #[config(default = 1e-3)]
    pub norm_epsilon: f64,
    #[config(default = 0.2)]
    pub dropout: f64,
}

impl MobileNetV3Config {
    /// Small 構成（torchvision の既定と同じ BatchNorm epsilon）
    pub fn small(num_classes: usize) -> Self {
        Self::new(num_classes)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV3<B> {
        let eps = self.norm_epsilon;
        let last_block = SMALL_BLOCKS[SMALL_BLOCKS.len() - 1].out_channels;
        let head_channels = last_block * 6;

        MobileNetV3 {
            stem: ConvNormAct::new(ConvSpec::new(3, STEM_CHANNELS, 3, 2), eps, Activation::Hardswish, device),
            blocks: SMALL_BLOCKS
                .iter()
                .map(|spec| InvertedResidual::new(*spec, eps, device))
                .collect(),
            head: ConvNormAct::new(
                ConvSpec::pointwise(last_block, head_channels),
                eps,
                Activation::Hardswish,
                device,
            ),
            hidden: LinearConfig::new(head_channels, HIDDEN_FEATURES).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier: LinearConfig::new(HIDDEN_FEATURES, self.num_classes).init(device),
        }
    }

    /// torchvision `mobilenet_v3_small` の state_dict キーを変換する規則
    pub fn torchvision_key_remaps() -> Vec<KeyRemap> {
        let mut rules = vec![
            KeyRemap::new(r"features\.0\.0\.", "stem.conv."),
            KeyRemap::new(r"features\.0\.1\.", "stem.norm."),
        ];

        for (i, spec) in SMALL_BLOCKS.iter().enumerate() {
            let mut layers = Vec::with_capacity(4);
            if spec.expanded != spec.in_channels {
                layers.push("expand");
            }
            layers.push("depthwise");
            if spec.use_se {
                layers.push("se");
            }
            layers.push("project");

            for (position, layer) in layers.into_iter().enumerate() {
                let from = format!(r"features\.{}\.block\.{}\.", i + 1, position);
                if layer == "se" {
                    rules.push(KeyRemap::new(&from, format!("blocks.{}.se.", i)));
                } else {
                    rules.push(KeyRemap::new(&format!(r"{}0\.", from), format!("blocks.{}.{}.conv.", i, layer)));
                    rules.push(KeyRemap::new(&format!(r"{}1\.", from), format!("blocks.{}.{}.norm.", i, layer)));
                }
            }
        }

        let head = SMALL_BLOCKS.len() + 1;
        rules.push(KeyRemap::new(&format!(r"features\.{}\.0\.", head), "head.conv."));
        rules.push(KeyRemap::new(&format!(r"features\.{}\.1\.", head), "head.norm."));
        rules.push(KeyRemap::new(r"classifier\.0\.", "hidden."));
        rules.push(KeyRemap::new(r"classifier\.3\.", "classifier."));
        rules.push(KeyRemap::distributed_prefix());
        rules
    }
}

/// 反転残差ブロック
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvNormAct<B>>,
    pub depthwise: ConvNormAct<B>,
    pub se: Option<SqueezeExcitation<B>>,
    pub project: ConvNormAct<B>,
    residual: Ignored<bool>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(spec: BlockSpec, eps: f64, device: &B::Device) -> Self {
        let expand = (spec.expanded != spec.in_channels).then(|| {
            ConvNormAct::new(
                ConvSpec::pointwise(spec.in_channels, spec.expanded),
                eps,
                spec.activation,
                device,
            )
        });
        let se = spec.use_se.then(|| {
            SqueezeExcitation::new(
                spec.expanded,
                make_divisible(spec.expanded / 4, 8),
                Activation::Relu,
                Gate::HardSigmoid,
                device,
            )
        });

        Self {
            expand,
            depthwise: ConvNormAct::new(
                ConvSpec::depthwise(spec.expanded, spec.kernel, spec.stride),
                eps,
                spec.activation,
                device,
            ),
            se,
            project: ConvNormAct::new(
                ConvSpec::pointwise(spec.expanded, spec.out_channels),
                eps,
                Activation::Identity,
                device,
            ),
            residual: Ignored(spec.stride == 1 && spec.in_channels == spec.out_channels),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = expand.forward(x);
        }
        x = self.depthwise.forward(x);
        if let Some(se) = &self.se {
            x = se.forward(x);
        }
        let x = self.project.forward(x);

        if *self.residual {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV3-Small 本体
#[derive(Module, Debug)]
pub struct MobileNetV3<B: Backend> {
    pub stem: ConvNormAct<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub head: ConvNormAct<B>,
    pub hidden: Linear<B>,
    dropout: Dropout,
    pub classifier: Linear<B>,
}

impl<B: Backend> MobileNetV3<B> {
    /// 順伝播 [batch, 3, H, W] -> [batch, num_classes]（ロジット）
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = global_avg_pool(self.head.forward(x));
        let x = Activation::Hardswish.forward(self.hidden.forward(x));
        self.classifier.forward(self.dropout.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::checkpoint::tests::apply_remaps;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(4, 8), 8);
        assert_eq!(make_divisible(18, 8), 24);
        assert_eq!(make_divisible(24, 8), 24);
        assert_eq!(make_divisible(60, 8), 64);
        assert_eq!(make_divisible(144, 8), 144);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = MobileNetV3Config::small(10).init::<TestBackend>(&device);
        let output = model.forward(Tensor::zeros([2, 3, 64, 64], &device));
        assert_eq!(output.dims(), [2, 10]);
    }

    #[test]
    fn test_block_layout() {
        let device = Default::default();
        let model = MobileNetV3Config::small(1000).init::<TestBackend>(&device);
        assert_eq!(model.blocks.len(), 11);
        assert!(model.blocks[0].expand.is_none());
        assert!(model.blocks[1].se.is_none());
        assert!(model.blocks[3].se.is_some());
    }

    #[test]
    fn test_torchvision_remaps() {
        let rules = MobileNetV3Config::torchvision_key_remaps();
        let cases = [
            ("features.0.0.weight", "stem.conv.weight"),
            ("features.1.block.0.0.weight", "blocks.0.depthwise.conv.weight"),
            ("features.1.block.1.fc1.weight", "blocks.0.se.fc1.weight"),
            ("features.1.block.2.1.bias", "blocks.0.project.norm.bias"),
            ("features.2.block.0.0.weight", "blocks.1.expand.conv.weight"),
            ("features.2.block.2.1.running_mean", "blocks.1.project.norm.running_mean"),
            ("features.4.block.2.fc2.bias", "blocks.3.se.fc2.bias"),
            ("module.features.11.block.3.0.weight", "blocks.10.project.conv.weight"),
            ("features.12.0.weight", "head.conv.weight"),
            ("features.12.1.running_var", "head.norm.running_var"),
            ("classifier.0.weight", "hidden.weight"),
            ("classifier.3.bias", "classifier.bias"),
        ];
        for (from, to) in cases {
            assert_eq!(apply_remaps(&rules, from), to, "{}", from);
        }
    }
}
