use candle_nn::Activation;
use serde::Deserialize;

fn default_relative_attention_max_distance() -> usize {
    128
}

fn default_initializer_factor() -> f64 {
    1.0
}

fn default_feed_forward_proj() -> Activation {
    Activation::Relu
}

fn default_is_decoder() -> bool {
    false
}

fn default_use_cache() -> bool {
    true
}

fn default_feat_dim() -> usize {
    2048
}

fn default_pos_dim() -> usize {
    4
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    pub num_heads: usize,
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_relative_attention_max_distance")]
    pub relative_attention_max_distance: usize,
    pub dropout_rate: f64,
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_initializer_factor")]
    pub initializer_factor: f64,
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: Activation,
    #[serde(default = "default_is_decoder")]
    pub is_decoder: bool,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,
    // Visual stream.
    #[serde(default = "default_feat_dim")]
    pub feat_dim: usize,
    #[serde(default = "default_pos_dim")]
    pub pos_dim: usize,
    #[serde(default = "default_true")]
    pub use_vis_layer_norm: bool,
    #[serde(default = "default_true")]
    pub individual_vis_layer_norm: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vocab_size: 32128,
            d_model: 512,
            d_kv: 64,
            d_ff: 2048,
            num_layers: 6,
            num_decoder_layers: None,
            num_heads: 8,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            dropout_rate: 0.1,
            layer_norm_epsilon: 1e-6,
            initializer_factor: 1.0,
            feed_forward_proj: Activation::Relu,
            is_decoder: false,
            use_cache: true,
            pad_token_id: Some(0),
            eos_token_id: Some(1),
            bos_token_id: None,
            decoder_start_token_id: Some(0),
            feat_dim: 2048,
            pos_dim: 4,
            use_vis_layer_norm: true,
            individual_vis_layer_norm: true,
        }
    }
}

impl Config {
    /// The feed-forward block is gated when the checkpoint was trained with
    /// the v1.1 gated-gelu projection.
    pub fn is_gated_act(&self) -> bool {
        self.feed_forward_proj == Activation::NewGelu
    }
}
