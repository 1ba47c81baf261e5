pub mod inference;
pub mod postprocess;
pub mod preprocess;

#[cfg(feature = "ml")]
pub mod efficientnet;
#[cfg(feature = "ml")]
pub mod layers;
#[cfg(feature = "ml")]
pub mod mobilenet;

pub use inference::builder_for;
#[cfg(feature = "ml")]
pub use inference::{BurnModel, BurnModelBuilder};
pub use postprocess::{argmax, softmax, top_k};
pub use preprocess::{preprocess, PreprocessedTensor, IMAGE_SIZE};
