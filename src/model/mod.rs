pub mod checkpoint;
pub mod config;
pub mod registry;
pub mod settings;

pub use checkpoint::{KeyRemap, KeyReport, LoadMode};
pub use config::{AppConfig, DeviceType, ModelPaths, ServerSettings};
pub use registry::{Capability, ImageModel, ModelBuilder, ModelRegistry, ModelRole};
pub use settings::{Settings, SettingsStore};
