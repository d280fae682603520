use std::collections::HashSet;

use candle::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::config::Config;
use super::init::{self, ParamRole};
use crate::models::with_tracing::{Embedding, Linear};

/// Maps a signed query-to-key offset to a bucket index in `[0, num_buckets)`.
///
/// Half of the available buckets (per direction in the bidirectional case)
/// hold exact offsets, the other half grow logarithmically up to
/// `max_distance`; every offset at or past `max_distance` lands in the last
/// bucket, which lets the model generalize to sequences longer than it was
/// trained on.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> u32 {
    let mut num_buckets = num_buckets;
    let mut ret = 0u32;
    // Distance from the attended-to position back to the attending one.
    let mut n = -relative_position;
    if bidirectional {
        num_buckets /= 2;
        if n < 0 {
            ret += num_buckets as u32;
        }
        n = n.abs();
    } else {
        n = n.max(0);
    }
    let n = n as usize;
    let max_exact = num_buckets / 2;
    let val = if n < max_exact {
        n as u32
    } else {
        let log_ratio = (n as f64 / max_exact as f64).ln()
            / (max_distance as f64 / max_exact as f64).ln();
        let val = max_exact + (log_ratio * (num_buckets - max_exact) as f64) as usize;
        val.min(num_buckets - 1) as u32
    };
    ret + val
}

/// Everything a single attention pass can produce. The cache entry is only
/// populated by cache-enabled decoder modules, the weights only on request,
/// and the position bias only by the module owning the bucket table.
#[derive(Debug)]
pub struct AttentionOutput {
    pub hidden_states: Tensor,
    pub present_key_value: Option<(Tensor, Tensor)>,
    pub weights: Option<Tensor>,
    pub position_bias: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct VlT5Attention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    relative_attention_bias: Option<Embedding>,
    relative_attention_num_buckets: usize,
    relative_attention_max_distance: usize,
    pruned_heads: HashSet<usize>,
    n_heads: usize,
    d_kv: usize,
    inner_dim: usize,
    is_decoder: bool,
    span: tracing::Span,
}

impl VlT5Attention {
    pub(crate) fn load(
        has_relative_attention_bias: bool,
        decoder: bool,
        vb: VarBuilder,
        cfg: &Config,
    ) -> Result<Self> {
        let inner_dim = cfg.num_heads * cfg.d_kv;
        let q = init::linear(cfg.d_model, inner_dim, ParamRole::AttentionQuery, cfg, vb.pp("q"))?;
        let k = init::linear(cfg.d_model, inner_dim, ParamRole::AttentionKey, cfg, vb.pp("k"))?;
        let v = init::linear(cfg.d_model, inner_dim, ParamRole::AttentionValue, cfg, vb.pp("v"))?;
        let o = init::linear(inner_dim, cfg.d_model, ParamRole::AttentionOutput, cfg, vb.pp("o"))?;
        let relative_attention_bias = if has_relative_attention_bias {
            let emb = init::embedding(
                cfg.relative_attention_num_buckets,
                cfg.num_heads,
                ParamRole::RelativeAttentionBias,
                cfg,
                vb.pp("relative_attention_bias"),
            )?;
            Some(emb)
        } else {
            None
        };
        Ok(Self {
            q,
            k,
            v,
            o,
            relative_attention_bias,
            relative_attention_num_buckets: cfg.relative_attention_num_buckets,
            relative_attention_max_distance: cfg.relative_attention_max_distance,
            pruned_heads: HashSet::new(),
            n_heads: cfg.num_heads,
            d_kv: cfg.d_kv,
            inner_dim,
            is_decoder: decoder,
            span: tracing::span!(tracing::Level::TRACE, "attention"),
        })
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn pruned_heads(&self) -> &HashSet<usize> {
        &self.pruned_heads
    }

    /// Computes the binned relative position bias, shape `(1, n_heads, q_len, k_len)`.
    pub fn compute_bias(
        &self,
        q_len: usize,
        k_len: usize,
        device: &candle::Device,
    ) -> Result<Tensor> {
        let relative_attention_bias = match &self.relative_attention_bias {
            Some(emb) => emb,
            None => candle::bail!("no position bias provided and no bucket table to compute one"),
        };
        let num_buckets = self.relative_attention_num_buckets;
        let max_distance = self.relative_attention_max_distance;
        let buckets: Vec<u32> = (0..q_len)
            .flat_map(|i| {
                (0..k_len).map(move |j| {
                    relative_position_bucket(
                        j as i64 - i as i64,
                        !self.is_decoder,
                        num_buckets,
                        max_distance,
                    )
                })
            })
            .collect();
        let rp_bucket = Tensor::from_vec(buckets, (q_len, k_len), device)?;
        let values = relative_attention_bias.forward(&rp_bucket)?;
        values.permute((2, 0, 1))?.unsqueeze(0)
    }

    /// Self-attention when `key_value_states` is none, attention over the
    /// source sequence otherwise. `mask` is additive and only consulted while
    /// computing a fresh position bias; a supplied bias is expected to carry
    /// the mask already.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        key_value_states: Option<&Tensor>,
        position_bias: Option<&Tensor>,
        past_key_value: Option<&(Tensor, Tensor)>,
        head_mask: Option<&Tensor>,
        query_length: Option<usize>,
        use_cache: bool,
        output_attentions: bool,
    ) -> Result<AttentionOutput> {
        let _enter = self.span.enter();
        let (b_sz, q_len, _) = xs.dims3()?;
        if past_key_value.is_some() && !self.is_decoder {
            candle::bail!("only a decoder attention module can consume cached key/value states")
        }
        let real_q_len = match past_key_value {
            None => q_len,
            Some((past_k, _)) => match query_length {
                Some(q) => q,
                None => q_len + past_k.dim(2)?,
            },
        };
        let shape = |x: Tensor| -> Result<Tensor> {
            x.reshape((b_sz, (), self.n_heads, self.d_kv))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = shape(self.q.forward(xs)?)?;
        let (k, v) = match (key_value_states, past_key_value) {
            (None, None) => (shape(self.k.forward(xs)?)?, shape(self.v.forward(xs)?)?),
            (None, Some((past_k, past_v))) => {
                // Incremental self-attention, the newest positions extend the cache.
                let k = shape(self.k.forward(xs)?)?;
                let v = shape(self.v.forward(xs)?)?;
                let k = Tensor::cat(&[past_k, &k], 2)?.contiguous()?;
                let v = Tensor::cat(&[past_v, &v], 2)?.contiguous()?;
                (k, v)
            }
            (Some(kv), None) => (shape(self.k.forward(kv)?)?, shape(self.v.forward(kv)?)?),
            // The source sequence is fixed across decoding steps.
            (Some(_), Some((past_k, past_v))) => (past_k.clone(), past_v.clone()),
        };
        let present_key_value = if self.is_decoder && use_cache {
            Some((k.clone(), v.clone()))
        } else {
            None
        };
        let k_len = k.dim(2)?;
        // No 1/sqrt(d) scaling: the Mesh TensorFlow initialization of q accounts for it.
        let scores = q.matmul(&k.t()?)?;
        let position_bias = match position_bias {
            Some(position_bias) => position_bias.clone(),
            None => {
                let mut position_bias = self.compute_bias(real_q_len, k_len, xs.device())?;
                if past_key_value.is_some() {
                    // Only the newest query rows matter once the cache is active.
                    position_bias = position_bias.narrow(2, real_q_len - q_len, q_len)?;
                }
                if let Some(mask) = mask {
                    position_bias = position_bias.broadcast_add(mask)?;
                }
                position_bias
            }
        };
        let scores = scores.broadcast_add(&position_bias)?;
        // Softmax in f32 whatever the ambient precision.
        let dtype = scores.dtype();
        let weights = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(dtype)?;
        let weights = match head_mask {
            Some(head_mask) => {
                weights.broadcast_mul(&head_mask.reshape((1, self.n_heads, 1, 1))?)?
            }
            None => weights,
        };
        let context = weights.matmul(&v)?;
        let context = context
            .transpose(1, 2)?
            .reshape((b_sz, q_len, self.inner_dim))?;
        let hidden_states = self.o.forward(&context)?;
        Ok(AttentionOutput {
            hidden_states,
            present_key_value,
            weights: output_attentions.then_some(weights),
            position_bias: self
                .relative_attention_bias
                .is_some()
                .then_some(position_bias),
        })
    }

    /// Permanently removes the given heads from the projection matrices.
    /// Indices refer to the original head layout, so pruning the same index
    /// twice is a no-op.
    pub fn prune_heads(&mut self, heads: &[usize]) -> Result<()> {
        let original_heads = self.n_heads + self.pruned_heads.len();
        let mut heads: Vec<usize> = heads
            .iter()
            .copied()
            .filter(|h| !self.pruned_heads.contains(h))
            .collect();
        heads.sort_unstable();
        heads.dedup();
        if heads.is_empty() {
            return Ok(());
        }
        for &h in heads.iter() {
            if h >= original_heads {
                candle::bail!(
                    "cannot prune head {h}, the module was built with {original_heads} heads"
                )
            }
        }
        // Current row position of an original head index, accounting for
        // earlier prunes.
        let current_pos =
            |h: usize| h - self.pruned_heads.iter().filter(|&&p| p < h).count();
        let pruned_now: HashSet<usize> = heads.iter().map(|&h| current_pos(h)).collect();
        let kept_heads = self.n_heads - heads.len();
        let kept_positions: Vec<u32> = (0..self.n_heads)
            .filter(|h| !pruned_now.contains(h))
            .map(|h| h as u32)
            .collect();
        let mut kept_rows = Vec::with_capacity(kept_heads * self.d_kv);
        for &head in kept_positions.iter() {
            let head = head as usize;
            kept_rows.extend((head * self.d_kv..(head + 1) * self.d_kv).map(|i| i as u32));
        }
        let device = self.q.weight().device().clone();
        let index = Tensor::from_vec(kept_rows, kept_heads * self.d_kv, &device)?;
        self.q = Linear::from_weights(self.q.weight().index_select(&index, 0)?, None);
        self.k = Linear::from_weights(self.k.weight().index_select(&index, 0)?, None);
        self.v = Linear::from_weights(self.v.weight().index_select(&index, 0)?, None);
        self.o = Linear::from_weights(self.o.weight().index_select(&index, 1)?, None);
        if let Some(emb) = &self.relative_attention_bias {
            // The bucket table is per-head as well.
            let head_index = Tensor::from_vec(kept_positions, kept_heads, &device)?;
            let table = emb.embeddings().index_select(&head_index, 1)?;
            self.relative_attention_bias = Some(Embedding::from_weights(table)?);
        }
        self.n_heads = kept_heads;
        self.inner_dim = kept_heads * self.d_kv;
        self.pruned_heads.extend(heads);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_attention(has_bias: bool, decoder: bool) -> Result<VlT5Attention> {
        let cfg = Config {
            vocab_size: 10,
            d_model: 8,
            d_kv: 4,
            d_ff: 16,
            num_layers: 2,
            num_heads: 2,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        VlT5Attention::load(has_bias, decoder, vb.pp("attn"), &cfg)
    }

    fn sample_input() -> Result<Tensor> {
        let xs = Tensor::arange(0f32, 24., &Device::Cpu)?.reshape((1, 3, 8))?;
        xs * 0.1
    }

    #[test]
    fn missing_bias_without_a_table_is_an_error() -> Result<()> {
        let attn = tiny_attention(false, false)?;
        let xs = sample_input()?;
        let res = attn.forward(&xs, None, None, None, None, None, None, false, false);
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn only_the_table_owner_reports_a_bias() -> Result<()> {
        let owner = tiny_attention(true, false)?;
        let xs = sample_input()?;
        let out = owner.forward(&xs, None, None, None, None, None, None, false, false)?;
        let bias = out.position_bias.unwrap();
        assert_eq!(bias.dims(), [1, 2, 3, 3]);

        let follower = tiny_attention(false, false)?;
        let out = follower.forward(&xs, None, None, Some(&bias), None, None, None, false, false)?;
        assert!(out.position_bias.is_none());
        Ok(())
    }

    #[test]
    fn head_mask_silences_heads() -> Result<()> {
        let attn = tiny_attention(true, false)?;
        let xs = sample_input()?;
        let plain = attn
            .forward(&xs, None, None, None, None, None, None, false, false)?
            .hidden_states;
        let head_mask = Tensor::new(&[1f32, 0.], &Device::Cpu)?;
        let masked = attn
            .forward(&xs, None, None, None, None, Some(&head_mask), None, false, false)?
            .hidden_states;
        let diff = (plain - masked)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 1e-6, "masking a head changed nothing");
        Ok(())
    }

    #[test]
    fn pruning_is_idempotent_per_head_index() -> Result<()> {
        let mut attn = tiny_attention(true, false)?;
        let xs = sample_input()?;
        attn.prune_heads(&[1])?;
        assert_eq!(attn.n_heads(), 1);
        let once = attn
            .forward(&xs, None, None, None, None, None, None, false, false)?
            .hidden_states
            .flatten_all()?
            .to_vec1::<f32>()?;
        attn.prune_heads(&[1])?;
        assert_eq!(attn.n_heads(), 1);
        assert!(attn.pruned_heads().contains(&1));
        let twice = attn
            .forward(&xs, None, None, None, None, None, None, false, false)?
            .hidden_states
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn pruning_an_out_of_range_head_is_an_error() -> Result<()> {
        let mut attn = tiny_attention(true, false)?;
        assert!(attn.prune_heads(&[5]).is_err());
        Ok(())
    }

    #[test]
    fn cache_is_rejected_outside_a_decoder() -> Result<()> {
        let attn = tiny_attention(true, false)?;
        let xs = sample_input()?;
        let past = (
            Tensor::zeros((1, 2, 2, 4), DType::F32, &Device::Cpu)?,
            Tensor::zeros((1, 2, 2, 4), DType::F32, &Device::Cpu)?,
        );
        let res = attn.forward(&xs, None, None, None, Some(&past), None, None, true, false);
        assert!(res.is_err());
        Ok(())
    }
}

#[cfg(test)]
mod bucket_tests {
    use super::relative_position_bucket;

    #[test]
    fn buckets_stay_in_range() {
        for bidirectional in [true, false] {
            for rel in -300i64..=300 {
                let b = relative_position_bucket(rel, bidirectional, 32, 128);
                assert!(b < 32, "bucket {b} out of range for offset {rel}");
            }
        }
    }

    #[test]
    fn buckets_are_monotonic_in_distance() {
        // Growing distance into the past never decreases the bucket index.
        for bidirectional in [true, false] {
            let mut last = 0;
            for dist in 0i64..300 {
                let b = relative_position_bucket(-dist, bidirectional, 32, 128);
                assert!(b >= last, "bucket shrank at distance {dist}");
                last = b;
            }
        }
    }

    #[test]
    fn bidirectional_buckets_distinguish_directions() {
        for dist in 1i64..200 {
            let past = relative_position_bucket(-dist, true, 32, 128);
            let future = relative_position_bucket(dist, true, 32, 128);
            assert_ne!(past, future, "same bucket for +/-{dist}");
        }
    }

    #[test]
    fn unidirectional_future_offsets_collapse_to_zero() {
        for dist in 1i64..50 {
            assert_eq!(relative_position_bucket(dist, false, 32, 128), 0);
        }
    }

    #[test]
    fn exact_region_maps_one_to_one() {
        // Unidirectional, 32 buckets: offsets below 16 map to themselves.
        for dist in 0i64..16 {
            assert_eq!(relative_position_bucket(-dist, false, 32, 128), dist as u32);
        }
        // The boundary value takes the logarithmic branch, which starts at
        // max_exact as well.
        assert_eq!(relative_position_bucket(-16, false, 32, 128), 16);
        assert!(relative_position_bucket(-17, false, 32, 128) >= 16);
    }

    #[test]
    fn distances_past_max_collapse_to_last_bucket() {
        let at_max = relative_position_bucket(-128, false, 32, 128);
        let beyond = relative_position_bucket(-4096, false, 32, 128);
        assert_eq!(at_max, 31);
        assert_eq!(beyond, 31);
    }
}
