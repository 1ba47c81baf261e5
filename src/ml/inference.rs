//! モデル推論機能
//!
//! PyTorchのチェックポイントを Burn のネットワークに読み込み、
//! 役割ごとの [`ImageModel`] として提供します。

#[cfg(feature = "ml")]
use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "ml")]
use std::sync::{Mutex, PoisonError};

#[cfg(feature = "ml")]
use burn::tensor::{backend::Backend, Tensor};
#[cfg(feature = "ml")]
use burn_store::{ModuleSnapshot, PytorchStore};

#[cfg(feature = "ml")]
use crate::error::InferenceError;
use crate::error::ModelLoadError;
#[cfg(feature = "ml")]
use crate::ml::efficientnet::{EfficientNet, EfficientNetConfig};
#[cfg(feature = "ml")]
use crate::ml::mobilenet::{MobileNetV3, MobileNetV3Config};
#[cfg(feature = "ml")]
use crate::ml::PreprocessedTensor;
#[cfg(feature = "ml")]
use crate::model::checkpoint::{verify_keys, KeyRemap, KeyReport, STATE_DICT_KEY};
use crate::model::{DeviceType, ImageModel, ModelBuilder, ModelRole};

/// 画像バッチからロジット（または回帰値）を返すネットワーク
#[cfg(feature = "ml")]
pub trait Network<B: Backend>: burn::module::Module<B> + Send + 'static {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[cfg(feature = "ml")]
impl<B: Backend> Network<B> for EfficientNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        EfficientNet::forward(self, images)
    }
}

#[cfg(feature = "ml")]
impl<B: Backend> Network<B> for MobileNetV3<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        MobileNetV3::forward(self, images)
    }
}

/// 読み込み済みネットワーク
///
/// バックエンドのテンソルはスレッド間で共有できないため、順伝播は1件ずつ直列化します。
/// 順伝播はネットワークを変更しないので、途中で panic したリクエストがあってもロックは回復して使い続けます。
#[cfg(feature = "ml")]
pub struct BurnModel<B: Backend, N> {
    network: Mutex<N>,
    device: B::Device,
    role: ModelRole,
}

#[cfg(feature = "ml")]
impl<B: Backend, N: Network<B>> BurnModel<B, N> {
    pub fn new(network: N, device: B::Device, role: ModelRole) -> Self {
        Self {
            network: Mutex::new(network),
            device,
            role,
        }
    }
}

#[cfg(feature = "ml")]
impl<B: Backend, N: Network<B>> ImageModel for BurnModel<B, N> {
    fn forward(&self, input: &PreprocessedTensor) -> Result<Vec<f32>, InferenceError> {
        // Tensorに変換 [1, 3, 224, 224]
        let tensor = Tensor::<B, 1>::from_floats(input.as_slice(), &self.device).reshape(input.shape());

        let output = {
            let network = self.network.lock().unwrap_or_else(PoisonError::into_inner);
            network.forward(tensor)
        };
        log::trace!("[{}] 出力形状: {:?}", self.role, output.dims());

        output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| InferenceError::Backend(format!("{:?}", e)))
    }
}

/// 役割ごとにネットワークを構築してチェックポイントを読み込むビルダー
#[cfg(feature = "ml")]
pub struct BurnModelBuilder<B: Backend> {
    device: B::Device,
}

#[cfg(feature = "ml")]
impl<B: Backend> BurnModelBuilder<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    fn finish<N: Network<B>>(
        &self,
        network: N,
        role: ModelRole,
        path: &Path,
        remaps: &[KeyRemap],
    ) -> Result<Arc<dyn ImageModel>, ModelLoadError> {
        let network = load_checkpoint(network, role, path, remaps)?;
        Ok(Arc::new(BurnModel::<B, N>::new(network, self.device.clone(), role)))
    }
}

#[cfg(feature = "ml")]
impl<B: Backend> ModelBuilder for BurnModelBuilder<B> {
    fn build(&self, role: ModelRole, path: &Path) -> Result<Arc<dyn ImageModel>, ModelLoadError> {
        match role {
            ModelRole::Validator => {
                let network = MobileNetV3Config::small(role.output_size()).init::<B>(&self.device);
                self.finish(network, role, path, &MobileNetV3Config::torchvision_key_remaps())
            }
            ModelRole::BreedClassifier => {
                let network = EfficientNetConfig::b0(role.output_size()).init::<B>(&self.device);
                self.finish(network, role, path, &EfficientNetConfig::timm_key_remaps())
            }
            ModelRole::WeightRegressor => {
                let network = EfficientNetConfig::b0(role.output_size()).init::<B>(&self.device);
                self.finish(network, role, path, &EfficientNetConfig::torchvision_key_remaps())
            }
        }
    }
}

/// チェックポイントを読み込む
///
/// まず `state_dict` エンベロープとして読み、1件も適用できなければ生のマップとして読み直します。
/// 照合の厳密さは [`verify_keys`] が役割ごとに判定します。
#[cfg(feature = "ml")]
fn load_checkpoint<B: Backend, N: Network<B>>(
    mut network: N,
    role: ModelRole,
    path: &Path,
    remaps: &[KeyRemap],
) -> Result<N, ModelLoadError> {
    let report = match apply_checkpoint(&mut network, path, remaps, Some(STATE_DICT_KEY)) {
        Ok(report) => report,
        Err(enveloped) => {
            log::debug!("[{}] state_dict エンベロープとして読めません: {}", role, enveloped);
            apply_checkpoint(&mut network, path, remaps, None).map_err(|message| {
                ModelLoadError::Unreadable {
                    path: path.to_path_buf(),
                    message,
                }
            })?
        }
    };

    verify_keys(role, role.load_mode(), &report, path)?;
    Ok(network)
}

#[cfg(feature = "ml")]
fn apply_checkpoint<B: Backend, N: Network<B>>(
    network: &mut N,
    path: &Path,
    remaps: &[KeyRemap],
    top_level_key: Option<&str>,
) -> Result<KeyReport, String> {
    let mut store = PytorchStore::from_file(path).allow_partial(true);
    if let Some(key) = top_level_key {
        store = store.with_top_level_key(key);
    }
    for remap in remaps {
        store = store.with_key_remapping(&remap.pattern, &remap.replacement);
    }

    let result = network.load_from(&mut store).map_err(|e| format!("{:?}", e))?;
    if result.applied.is_empty() {
        return Err("no tensors matched the network".to_string());
    }

    Ok(KeyReport {
        missing: result.missing,
        unused: result.unused,
    })
}

/// 計算デバイスに応じたビルダーを返す
#[cfg(feature = "ml")]
pub fn builder_for(device_type: DeviceType) -> Box<dyn ModelBuilder> {
    use burn_ndarray::{NdArray, NdArrayDevice};

    match device_type {
        DeviceType::Cpu => Box::new(BurnModelBuilder::<NdArray>::new(NdArrayDevice::default())),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use burn_wgpu::{Wgpu, WgpuDevice};
            Box::new(BurnModelBuilder::<Wgpu>::new(WgpuDevice::default()))
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            log::warn!("wgpu フィーチャーが無効のため CPU (NdArray) で実行します");
            Box::new(BurnModelBuilder::<NdArray>::new(NdArrayDevice::default()))
        }
    }
}

/// ML 機能なしでビルドした場合のビルダー（すべて利用不可になる）
#[cfg(not(feature = "ml"))]
pub struct DisabledBuilder;

#[cfg(not(feature = "ml"))]
impl ModelBuilder for DisabledBuilder {
    fn build(&self, _role: ModelRole, _path: &std::path::Path) -> Result<Arc<dyn ImageModel>, ModelLoadError> {
        Err(ModelLoadError::BackendDisabled)
    }
}

#[cfg(not(feature = "ml"))]
pub fn builder_for(_device_type: DeviceType) -> Box<dyn ModelBuilder> {
    log::warn!("ml フィーチャーが無効です。推論モデルは読み込まれません");
    Box::new(DisabledBuilder)
}

#[cfg(all(test, feature = "ml"))]
mod tests {
    use super::*;
    use crate::ml::layers::global_avg_pool;
    use burn::module::Module;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;
    use std::path::PathBuf;

    /// 平均プーリング + 全結合1層だけの小さなネットワーク
    #[derive(Module, Debug)]
    struct PooledHead<B: Backend> {
        fc: Linear<B>,
    }

    impl<B: Backend> PooledHead<B> {
        fn new(device: &B::Device) -> Self {
            Self {
                fc: LinearConfig::new(3, 2).init(device),
            }
        }
    }

    impl<B: Backend> Network<B> for PooledHead<B> {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            self.fc.forward(global_avg_pool(images))
        }
    }

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    fn zero_input() -> PreprocessedTensor {
        PreprocessedTensor::from_vec(vec![0.0; PreprocessedTensor::LEN]).unwrap()
    }

    fn load(name: &str, role: ModelRole) -> Result<PooledHead<NdArray>, ModelLoadError> {
        let network = PooledHead::<NdArray>::new(&Default::default());
        load_checkpoint(network, role, &fixture(name), &[KeyRemap::distributed_prefix()])
    }

    fn bias(network: &PooledHead<NdArray>) -> Vec<f32> {
        let bias = network.fc.bias.as_ref().unwrap().val();
        bias.into_data().to_vec::<f32>().unwrap()
    }

    fn weight(network: &PooledHead<NdArray>) -> Vec<f32> {
        network.fc.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{:?} != {:?}", actual, expected);
        }
    }

    // チェックポイントの重みは PyTorch の [出力, 入力] = [[0.0, 0.1, 0.2], [0.3, 0.4, 0.5]]。
    // Burn の Linear は [入力, 出力] で保持する
    const EXPECTED_WEIGHT: [f32; 6] = [0.0, 0.3, 0.1, 0.4, 0.2, 0.5];

    #[test]
    fn test_burn_model_output_length() {
        let device = Default::default();
        let network = EfficientNetConfig::b0(2).init::<NdArray>(&device);
        let model = BurnModel::<NdArray, _>::new(network, device, ModelRole::BreedClassifier);

        let output = model.forward(&zero_input()).unwrap();
        assert_eq!(output.len(), 2);
        assert!(output.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_forward_after_panic_in_another_request() {
        let device = Default::default();
        let model = Arc::new(BurnModel::<NdArray, _>::new(
            PooledHead::new(&device),
            device,
            ModelRole::WeightRegressor,
        ));

        let holder = Arc::clone(&model);
        let panicked = std::thread::spawn(move || {
            let _network = holder.network.lock().unwrap();
            panic!("device lost during forward");
        })
        .join();
        assert!(panicked.is_err());
        assert!(model.network.is_poisoned());

        for _ in 0..3 {
            let output = model.forward(&zero_input()).unwrap();
            assert_eq!(output.len(), 2);
        }
    }

    #[test]
    fn test_load_state_dict_envelope_with_distributed_prefix() {
        // {"state_dict": {"module.fc.weight", "module.fc.bias"}}
        let network = load("envelope_module_prefix.pth", ModelRole::WeightRegressor).unwrap();
        assert_close(&bias(&network), &[1.0, 2.0]);
        assert_close(&weight(&network), &EXPECTED_WEIGHT);
    }

    #[test]
    fn test_load_raw_mapping() {
        // {"fc.weight", "fc.bias"}
        let network = load("raw_state_dict.pth", ModelRole::WeightRegressor).unwrap();
        assert_close(&weight(&network), &EXPECTED_WEIGHT);
        assert_close(&bias(&network), &[1.0, 2.0]);
    }

    #[test]
    fn test_strict_role_rejects_unexpected_key() {
        // {"fc.weight", "fc.bias", "other.bias"}
        let err = load("extra_key.pth", ModelRole::WeightRegressor).unwrap_err();
        match err {
            ModelLoadError::Incompatible { role, message, .. } => {
                assert_eq!(role, ModelRole::WeightRegressor);
                assert!(message.contains("other.bias"), "{}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_lenient_role_accepts_unexpected_key() {
        let network = load("extra_key.pth", ModelRole::BreedClassifier).unwrap();
        assert_close(&bias(&network), &[1.0, 2.0]);
    }

    #[test]
    fn test_unreadable_checkpoint() {
        let path = std::env::temp_dir().join(format!("smart_cattle_garbage_{}.pth", std::process::id()));
        std::fs::write(&path, b"definitely not a pickle").unwrap();

        let builder = BurnModelBuilder::<NdArray>::new(Default::default());
        let err = builder.build(ModelRole::WeightRegressor, &path).err().unwrap();
        assert!(matches!(err, ModelLoadError::Unreadable { .. }));

        std::fs::remove_file(path).ok();
    }
}
