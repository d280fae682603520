//! Import of foreign checkpoints using the original slash-separated naming
//! scheme (`encoder/block_0/layer_0/SelfAttention/q/kernel`) onto this
//! crate's module tree. 2-D `kernel` matrices are stored transposed by the
//! training framework and are transposed back here; embedding tables are
//! kept as-is. Optimizer state is skipped, and entries that match no known
//! parameter are collected and reported rather than failing the import.

use std::collections::{HashMap, HashSet};

use candle::{DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

use super::config::Config;

const OPTIMIZER_ENTRIES: [&str; 4] = [
    "adam_v",
    "adam_m",
    "AdamWeightDecayOptimizer",
    "global_step",
];

fn is_optimizer_entry(name: &str) -> bool {
    name.split('/')
        .any(|seg| OPTIMIZER_ENTRIES.iter().any(|e| seg.starts_with(e)) || seg.contains("_slot_"))
}

/// Rewrites one source name to this crate's dot-separated parameter path.
/// Returns the path and whether the tensor needs transposition.
fn canonical_name(source: &str) -> (String, bool) {
    let mut transpose = false;
    let mut parts = Vec::new();
    for seg in source.split('/') {
        // Numeric suffixes index layers: `block_0` -> `block.0`. Projection
        // names like `wi_0` keep their underscore.
        if let Some((prefix, idx)) = seg.rsplit_once('_') {
            if matches!(prefix, "block" | "layer") && idx.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(idx) = idx.parse::<usize>() {
                    parts.push(prefix.to_string());
                    parts.push(idx.to_string());
                    continue;
                }
            }
        }
        match seg {
            "kernel" => {
                transpose = true;
                parts.push("weight".to_string())
            }
            "scale" | "embedding" => parts.push("weight".to_string()),
            seg => parts.push(seg.to_string()),
        }
    }
    (parts.join("."), transpose)
}

fn visual_embedding_names(cfg: &Config, names: &mut Vec<String>) {
    let base = "encoder.visual_embedding";
    names.push(format!("{base}.feat_embedding.linear.weight"));
    names.push(format!("{base}.absolute_vis_pos_embedding.linear.weight"));
    if cfg.use_vis_layer_norm {
        if cfg.individual_vis_layer_norm {
            names.push(format!("{base}.feat_embedding.layer_norm.weight"));
            names.push(format!("{base}.absolute_vis_pos_embedding.layer_norm.weight"));
        } else {
            names.push(format!("{base}.layer_norm.weight"));
        }
    }
}

/// Every parameter path the model loaders will request for this
/// configuration.
pub fn expected_parameter_names(cfg: &Config) -> Vec<String> {
    let mut names = vec!["shared.weight".to_string(), "lm_head.weight".to_string()];
    let ff_projections: &[&str] = if cfg.is_gated_act() {
        &["wi_0", "wi_1", "wo"]
    } else {
        &["wi", "wo"]
    };
    for i in 0..cfg.num_layers {
        let base = format!("encoder.block.{i}.layer");
        for p in ["q", "k", "v", "o"] {
            names.push(format!("{base}.0.SelfAttention.{p}.weight"));
        }
        if i == 0 {
            names.push(format!("{base}.0.SelfAttention.relative_attention_bias.weight"));
        }
        names.push(format!("{base}.0.layer_norm.weight"));
        for p in ff_projections {
            names.push(format!("{base}.1.DenseReluDense.{p}.weight"));
        }
        names.push(format!("{base}.1.layer_norm.weight"));
    }
    names.push("encoder.final_layer_norm.weight".to_string());
    visual_embedding_names(cfg, &mut names);
    for i in 0..cfg.num_decoder_layers.unwrap_or(cfg.num_layers) {
        let base = format!("decoder.block.{i}.layer");
        for p in ["q", "k", "v", "o"] {
            names.push(format!("{base}.0.SelfAttention.{p}.weight"));
            names.push(format!("{base}.1.EncDecAttention.{p}.weight"));
        }
        if i == 0 {
            names.push(format!("{base}.0.SelfAttention.relative_attention_bias.weight"));
            names.push(format!("{base}.1.EncDecAttention.relative_attention_bias.weight"));
        }
        names.push(format!("{base}.0.layer_norm.weight"));
        names.push(format!("{base}.1.layer_norm.weight"));
        for p in ff_projections {
            names.push(format!("{base}.2.DenseReluDense.{p}.weight"));
        }
        names.push(format!("{base}.2.layer_norm.weight"));
    }
    names.push("decoder.final_layer_norm.weight".to_string());
    names
}

/// A reconciled checkpoint: renamed, transposed tensors ready to back a
/// `VarBuilder`, plus the bookkeeping of what was skipped, unknown or absent.
pub struct CheckpointWeights {
    tensors: HashMap<String, Tensor>,
    /// Optimizer-state entries dropped up front.
    pub skipped: Vec<String>,
    /// Source entries that match no parameter of the module tree.
    pub unmatched: Vec<String>,
    /// Expected parameters the dump never supplied.
    pub missing: Vec<String>,
}

impl CheckpointWeights {
    pub fn from_safetensors<P: AsRef<std::path::Path>>(
        path: P,
        cfg: &Config,
        device: &Device,
    ) -> Result<Self> {
        let tensors = candle::safetensors::load(path, device)?;
        Self::from_tensors(tensors, cfg)
    }

    pub fn from_tensors(source: HashMap<String, Tensor>, cfg: &Config) -> Result<Self> {
        let expected: HashSet<String> = expected_parameter_names(cfg).into_iter().collect();
        let mut tensors = HashMap::new();
        let mut skipped = Vec::new();
        let mut unmatched = Vec::new();
        for (name, tensor) in source.into_iter() {
            if is_optimizer_entry(&name) {
                skipped.push(name);
                continue;
            }
            let (canonical, transpose) = canonical_name(&name);
            if !expected.contains(&canonical) {
                tracing::warn!(source = %name, "checkpoint entry matches no model parameter");
                unmatched.push(name);
                continue;
            }
            let tensor = if transpose && tensor.rank() == 2 {
                tensor.t()?.contiguous()?
            } else {
                tensor
            };
            tensors.insert(canonical, tensor);
        }
        let mut missing: Vec<String> = expected
            .iter()
            .filter(|name| !tensors.contains_key(*name))
            .cloned()
            .collect();
        skipped.sort();
        unmatched.sort();
        missing.sort();
        if !unmatched.is_empty() {
            tracing::warn!(count = unmatched.len(), "checkpoint entries not consumed: {unmatched:?}");
        }
        if !missing.is_empty() {
            tracing::warn!(count = missing.len(), "model parameters absent from the checkpoint: {missing:?}");
        }
        tracing::info!(
            loaded = tensors.len(),
            skipped = skipped.len(),
            unmatched = unmatched.len(),
            missing = missing.len(),
            "checkpoint reconciled"
        );
        Ok(Self {
            tensors,
            skipped,
            unmatched,
            missing,
        })
    }

    /// A `VarBuilder` over the reconciled tensors. Loading a model from it
    /// fails on the first parameter listed in `missing`, and on any shape
    /// disagreement between the dump and the configuration.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), dtype, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_canonicalized() {
        let (name, transpose) = canonical_name("encoder/block_0/layer_0/SelfAttention/q/kernel");
        assert_eq!(name, "encoder.block.0.layer.0.SelfAttention.q.weight");
        assert!(transpose);

        let (name, transpose) = canonical_name("shared/embedding");
        assert_eq!(name, "shared.weight");
        assert!(!transpose);

        let (name, transpose) = canonical_name("decoder/final_layer_norm/scale");
        assert_eq!(name, "decoder.final_layer_norm.weight");
        assert!(!transpose);

        // Layer indices can carry leading zeros.
        let (name, _) = canonical_name("decoder/block_011/layer_2/DenseReluDense/wi/kernel");
        assert_eq!(name, "decoder.block.11.layer.2.DenseReluDense.wi.weight");
    }

    #[test]
    fn optimizer_entries_are_detected() {
        assert!(is_optimizer_entry("encoder/block_0/q/adam_v"));
        assert!(is_optimizer_entry("encoder/block_0/q/kernel_slot_vc"));
        assert!(is_optimizer_entry("global_step"));
        assert!(!is_optimizer_entry("encoder/block_0/q/kernel"));
    }

    #[test]
    fn expected_names_cover_the_bias_owning_layers() {
        let cfg = Config {
            num_layers: 2,
            ..Default::default()
        };
        let names = expected_parameter_names(&cfg);
        let with_bias: Vec<_> = names
            .iter()
            .filter(|n| n.contains("relative_attention_bias"))
            .collect();
        assert_eq!(
            with_bias,
            [
                "encoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
                "decoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
                "decoder.block.0.layer.1.EncDecAttention.relative_attention_bias.weight",
            ]
        );
    }
}
