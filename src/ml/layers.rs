//! EfficientNet / MobileNetV3 で共通に使う層

use burn::{
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{activation, backend::Backend, Tensor},
};

/// 活性化関数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Silu,
    Hardswish,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Identity => x,
            Activation::Relu => activation::relu(x),
            Activation::Silu => activation::silu(x),
            Activation::Hardswish => x.clone() * hard_sigmoid(x),
        }
    }
}

/// SEブロックのゲート
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Sigmoid,
    HardSigmoid,
}

impl Gate {
    pub fn forward<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Gate::Sigmoid => activation::sigmoid(x),
            Gate::HardSigmoid => hard_sigmoid(x),
        }
    }
}

/// relu6(x + 3) / 6
pub fn hard_sigmoid<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.add_scalar(3.0).clamp(0.0, 6.0).div_scalar(6.0)
}

/// 空間方向の平均 [b, c, h, w] -> [b, c]
pub fn global_avg_pool<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch_size, channels, _, _] = x.dims();
    x.mean_dim(3).mean_dim(2).reshape([batch_size, channels])
}

/// 畳み込みの形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub groups: usize,
}

impl ConvSpec {
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            groups: 1,
        }
    }

    /// 1x1 畳み込み
    pub fn pointwise(in_channels: usize, out_channels: usize) -> Self {
        Self::new(in_channels, out_channels, 1, 1)
    }

    /// チャネルごとの畳み込み
    pub fn depthwise(channels: usize, kernel: usize, stride: usize) -> Self {
        Self {
            groups: channels,
            ..Self::new(channels, channels, kernel, stride)
        }
    }
}

/// Conv2d（バイアスなし） + BatchNorm + 活性化
#[derive(Module, Debug)]
pub struct ConvNormAct<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B>,
    activation: Ignored<Activation>,
}

impl<B: Backend> ConvNormAct<B> {
    pub fn new(spec: ConvSpec, epsilon: f64, activation: Activation, device: &B::Device) -> Self {
        let padding = (spec.kernel - 1) / 2;
        Self {
            conv: Conv2dConfig::new([spec.in_channels, spec.out_channels], [spec.kernel, spec.kernel])
                .with_stride([spec.stride, spec.stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(spec.groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(spec.out_channels)
                .with_epsilon(epsilon)
                .init(device),
            activation: Ignored(activation),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

/// Squeeze-and-Excitation
///
/// チェックポイント上の名前は torchvision に合わせて `fc1` / `fc2`。
#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pub fc1: Conv2d<B>,
    pub fc2: Conv2d<B>,
    activation: Ignored<Activation>,
    gate: Ignored<Gate>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn new(
        channels: usize,
        squeeze_channels: usize,
        activation: Activation,
        gate: Gate,
        device: &B::Device,
    ) -> Self {
        Self {
            fc1: Conv2dConfig::new([channels, squeeze_channels], [1, 1]).init(device),
            fc2: Conv2dConfig::new([squeeze_channels, channels], [1, 1]).init(device),
            activation: Ignored(activation),
            gate: Ignored(gate),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = x.clone().mean_dim(3).mean_dim(2);
        let scale = self.activation.forward(self.fc1.forward(scale));
        let scale = self.gate.forward(self.fc2.forward(scale));
        x * scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_hard_sigmoid_bounds() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-10.0, 0.0, 10.0], &device);
        let y = hard_sigmoid(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(y, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_conv_norm_act_shape() {
        let device = Default::default();
        let layer = ConvNormAct::<TestBackend>::new(ConvSpec::new(3, 8, 3, 2), 1e-5, Activation::Silu, &device);
        let output = layer.forward(Tensor::zeros([1, 3, 32, 32], &device));
        assert_eq!(output.dims(), [1, 8, 16, 16]);
    }

    #[test]
    fn test_squeeze_excitation_keeps_shape() {
        let device = Default::default();
        let se = SqueezeExcitation::<TestBackend>::new(16, 4, Activation::Relu, Gate::HardSigmoid, &device);
        let output = se.forward(Tensor::ones([2, 16, 7, 7], &device));
        assert_eq!(output.dims(), [2, 16, 7, 7]);
    }

    #[test]
    fn test_global_avg_pool() {
        let device = Default::default();
        let pooled = global_avg_pool(Tensor::<TestBackend, 4>::ones([2, 5, 4, 4], &device));
        assert_eq!(pooled.dims(), [2, 5]);
    }
}
