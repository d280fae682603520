//! VL-T5 encoder-decoder implementation.
//!
//! A T5-style text-to-text transformer whose encoder can additionally ingest
//! visual region features: each region's appearance vector and its box
//! geometry (coordinates plus derived area) are projected to the model width
//! and appended to the text token sequence before the shared encoder layers.
//!
//! Key characteristics:
//! - Relative position biases bucketed Mesh-TensorFlow style, computed once
//!   per stack and shared across layers; visual tokens get a zero bias.
//! - Externally threaded per-layer KV-cache for incremental decoding, with
//!   batch-axis reordering support for beam search.
//! - Greedy/sampling and beam-search generation drivers with repetition
//!   penalty, n-gram banning, bad-word masking and length constraints.
//! - Mesh-TensorFlow style parameter initialization and import of foreign
//!   checkpoints using slash-separated parameter names.
//!
//! References:
//! - [T5 Paper](https://arxiv.org/abs/1910.10683)
//! - [VL-T5 Paper](https://arxiv.org/abs/2102.02779)

pub mod attention;
pub mod beam_search;
pub mod config;
pub mod generation;
pub mod init;
pub mod layers;
pub mod model;
pub mod stack;
pub mod visual;
pub mod weights;

// Re-export commonly used types for convenience
pub use attention::{relative_position_bucket, AttentionOutput, VlT5Attention};
pub use config::Config;
pub use generation::GenerationConfig;
pub use init::ParamRole;
pub use model::{VlT5EncoderModel, VlT5ForConditionalGeneration};
pub use stack::{DecoderKvCache, LayerKvCache, StackOutput, VlT5Stack};
pub use visual::{VisualFeatures, VlT5JointEncoder, VlT5VisualEmbedding};
pub use weights::{expected_parameter_names, CheckpointWeights};
