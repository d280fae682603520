use std::sync::Arc;

use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::config::Config;
use super::layers::{Dropout, VlT5Block, VlT5LayerNorm};
use crate::models::with_tracing::Embedding;

/// Additive value for masked-out attention positions; large enough that the
/// softmax underflows to an exact zero in f32.
pub(crate) const MASK_VALUE: f64 = -1e9;

/// Cached key/value pair of one layer. Both attention streams grow (self) or
/// are pinned (cross) independently; either both are populated or neither is.
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    pub self_attn: Option<(Tensor, Tensor)>,
    pub cross_attn: Option<(Tensor, Tensor)>,
}

/// Key/value cache for a whole decoder stack, owned by the caller and
/// threaded through every cached forward pass. A generation loop keeps one of
/// these per call; beam search additionally reorders its batch rows whenever
/// beams are re-ranked.
#[derive(Debug, Clone)]
pub struct DecoderKvCache {
    layers: Vec<LayerKvCache>,
}

impl DecoderKvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerKvCache::default(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.self_attn.is_none())
    }

    /// Number of already-cached positions.
    pub fn seq_len(&self) -> Result<usize> {
        match self.layers.first().and_then(|l| l.self_attn.as_ref()) {
            None => Ok(0),
            Some((k, _)) => k.dim(2),
        }
    }

    pub fn reset(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn = None;
            layer.cross_attn = None;
        }
    }

    pub(crate) fn layer_mut(&mut self, i: usize) -> &mut LayerKvCache {
        &mut self.layers[i]
    }

    /// Re-indexes every cached tensor along the batch axis. After a beam
    /// search re-ranking, row `i` of the cache must descend from the beam the
    /// `i`-th hypothesis was continued from.
    pub fn reorder(&mut self, index: &Tensor) -> Result<()> {
        for layer in self.layers.iter_mut() {
            if let Some((k, v)) = &layer.self_attn {
                layer.self_attn = Some((k.index_select(index, 0)?, v.index_select(index, 0)?));
            }
            if let Some((k, v)) = &layer.cross_attn {
                layer.cross_attn = Some((k.index_select(index, 0)?, v.index_select(index, 0)?));
            }
        }
        Ok(())
    }
}

pub struct StackOutput {
    pub hidden_states: Tensor,
    /// Per-layer self-attention weights, on request.
    pub attentions: Option<Vec<Tensor>>,
}

/// Converts a `(batch, k_len)` visibility mask (1 = attend, 0 = ignore) into
/// an additive `(batch, 1, 1, k_len)` mask.
pub(crate) fn invert_attention_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (b_sz, k_len) = mask.dims2()?;
    let mask = mask.to_dtype(DType::F32)?;
    let additive = mask.affine(-MASK_VALUE, MASK_VALUE)?;
    additive.reshape((b_sz, 1, 1, k_len))?.to_dtype(dtype)
}

/// Builds the `(batch, 1, q_len, k_len)` additive mask for decoder
/// self-attention: a position attends to every non-padded position that is
/// not strictly in its future.
pub(crate) fn causal_attention_mask(mask: &Tensor, q_len: usize, dtype: DType) -> Result<Tensor> {
    let (b_sz, k_len) = mask.dims2()?;
    let past_len = k_len - q_len;
    let causal: Vec<f32> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| f32::from(u8::from(j <= past_len + i))))
        .collect();
    let causal = Tensor::from_vec(causal, (q_len, k_len), mask.device())?
        .reshape((1, 1, q_len, k_len))?;
    let mask = mask.to_dtype(DType::F32)?.reshape((b_sz, 1, 1, k_len))?;
    let visible = causal.broadcast_mul(&mask)?;
    visible.affine(-MASK_VALUE, MASK_VALUE)?.to_dtype(dtype)
}

#[derive(Debug, Clone)]
pub struct VlT5Stack {
    block: Vec<VlT5Block>,
    shared: Arc<Embedding>,
    final_layer_norm: VlT5LayerNorm,
    dropout: Dropout,
    is_decoder: bool,
    span: tracing::Span,
}

impl VlT5Stack {
    pub(crate) fn load(
        decoder: bool,
        vb: VarBuilder,
        shared: &Arc<Embedding>,
        cfg: &Config,
    ) -> Result<Self> {
        let block = (0..cfg.num_layers)
            .map(|i| VlT5Block::load(i == 0, decoder, vb.pp(format!("block.{i}")), cfg))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm =
            VlT5LayerNorm::load(cfg.d_model, vb.pp("final_layer_norm"), cfg)?;
        Ok(Self {
            block,
            shared: shared.clone(),
            final_layer_norm,
            dropout: Dropout::new(cfg.dropout_rate),
            is_decoder: decoder,
            span: tracing::span!(tracing::Level::TRACE, "stack"),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.block.len()
    }

    pub fn is_decoder(&self) -> bool {
        self.is_decoder
    }

    /// Prunes heads of the self-attention module of the given layer.
    pub fn prune_heads(&mut self, layer: usize, heads: &[usize]) -> Result<()> {
        match self.block.get_mut(layer) {
            Some(block) => block.self_attention_mut().prune_heads(heads),
            None => candle::bail!(
                "cannot prune heads of layer {layer}, the stack has {} layers",
                self.block.len()
            ),
        }
    }

    /// Self-attention position bias of this stack, from the bucket table the
    /// first layer owns. Computed once per forward pass and shared by every
    /// layer.
    pub(crate) fn position_bias(
        &self,
        q_len: usize,
        k_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        self.block[0].self_attention().compute_bias(q_len, k_len, device)
    }

    fn cross_position_bias(&self, q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
        match self.block[0].cross_attention() {
            Some(attn) => attn.compute_bias(q_len, k_len, device),
            None => candle::bail!("cross-attention position bias requested on an encoder stack"),
        }
    }

    pub(crate) fn embed_input(
        &self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
    ) -> Result<Tensor> {
        match (input_ids, inputs_embeds) {
            (Some(_), Some(_)) => {
                candle::bail!("input_ids and inputs_embeds cannot both be supplied")
            }
            (Some(ids), None) => self.shared.forward(ids),
            (None, Some(embeds)) => Ok(embeds.clone()),
            (None, None) => candle::bail!("one of input_ids or inputs_embeds has to be supplied"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        input_ids: Option<&Tensor>,
        inputs_embeds: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        cache: Option<&mut DecoderKvCache>,
        output_attentions: bool,
    ) -> Result<StackOutput> {
        let input_embeds = self.embed_input(input_ids, inputs_embeds)?;
        let (b_sz, seq_len, _) = input_embeds.dims3()?;
        let device = input_embeds.device().clone();
        let dtype = input_embeds.dtype();

        if cache.is_some() && !self.is_decoder {
            candle::bail!("kv caching can only be used on a decoder stack")
        }
        let past_len = match &cache {
            Some(c) => c.seq_len()?,
            None => 0,
        };
        if past_len > 0 && seq_len != 1 {
            candle::bail!(
                "expected a single new token when decoding with a non-empty cache, got {seq_len}"
            )
        }
        let mask_len = past_len + seq_len;

        let attention_mask = match attention_mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones((b_sz, mask_len), DType::F32, &device)?,
        };
        if attention_mask.dims() != [b_sz, mask_len] {
            candle::bail!(
                "attention mask shape {:?} does not match (batch, past+new) = ({b_sz}, {mask_len})",
                attention_mask.dims()
            )
        }
        let extended_mask = if self.is_decoder && seq_len > 1 {
            causal_attention_mask(&attention_mask, seq_len, dtype)?
        } else {
            invert_attention_mask(&attention_mask, dtype)?
        };

        // The bias is computed once here and handed to every layer; the mask
        // is folded in at the same time so layers never re-add it.
        let mut position_bias = self.position_bias(mask_len, mask_len, &device)?;
        if past_len > 0 {
            position_bias = position_bias.narrow(2, past_len, seq_len)?;
        }
        let position_bias = position_bias.broadcast_add(&extended_mask)?;

        let encoder_decoder_position_bias = match (self.is_decoder, encoder_hidden_states) {
            (true, Some(enc)) => {
                let enc_len = enc.dim(1)?;
                let enc_mask = match encoder_attention_mask {
                    Some(mask) => invert_attention_mask(mask, dtype)?,
                    None => Tensor::zeros((b_sz, 1, 1, enc_len), dtype, &device)?,
                };
                let mut bias = self.cross_position_bias(mask_len, enc_len, &device)?;
                if past_len > 0 {
                    bias = bias.narrow(2, past_len, seq_len)?;
                }
                Some(bias.broadcast_add(&enc_mask)?)
            }
            _ => None,
        };

        self.run_blocks(
            input_embeds,
            &position_bias,
            encoder_hidden_states,
            encoder_decoder_position_bias.as_ref(),
            cache,
            output_attentions,
        )
    }

    /// Runs the layer loop over already-embedded inputs with a fully built
    /// position bias (mask included).
    pub(crate) fn run_blocks(
        &self,
        hidden_states: Tensor,
        position_bias: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        encoder_decoder_position_bias: Option<&Tensor>,
        mut cache: Option<&mut DecoderKvCache>,
        output_attentions: bool,
    ) -> Result<StackOutput> {
        let _enter = self.span.enter();
        if let Some(c) = &cache {
            if c.num_layers() != self.block.len() {
                candle::bail!(
                    "cache built for {} layers used with a {}-layer stack",
                    c.num_layers(),
                    self.block.len()
                )
            }
        }
        let mut all_attentions = if output_attentions { Some(Vec::new()) } else { None };
        let mut hidden_states = self.dropout.forward(&hidden_states)?;
        for (i, block) in self.block.iter().enumerate() {
            let layer_cache = cache.as_deref_mut().map(|c| c.layer_mut(i));
            let out = block.forward(
                &hidden_states,
                Some(position_bias),
                encoder_hidden_states,
                encoder_decoder_position_bias,
                layer_cache,
                output_attentions,
            )?;
            hidden_states = out.hidden_states;
            if let (Some(all), Some(weights)) = (all_attentions.as_mut(), out.self_attn_weights) {
                all.push(weights)
            }
        }
        let hidden_states = self.final_layer_norm.forward(&hidden_states)?;
        let hidden_states = self.dropout.forward(&hidden_states)?;
        Ok(StackOutput {
            hidden_states,
            attentions: all_attentions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vlt5::config::Config;
    use crate::models::vlt5::init::{self, ParamRole};
    use candle::IndexOp;
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_cfg(decoder: bool) -> Config {
        Config {
            vocab_size: 10,
            d_model: 8,
            d_kv: 4,
            d_ff: 16,
            num_layers: 2,
            num_heads: 2,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            is_decoder: decoder,
            pad_token_id: Some(9),
            eos_token_id: Some(9),
            decoder_start_token_id: Some(0),
            ..Default::default()
        }
    }

    fn tiny_stack(decoder: bool) -> Result<VlT5Stack> {
        let cfg = tiny_cfg(decoder);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let shared = Arc::new(init::embedding(
            cfg.vocab_size,
            cfg.d_model,
            ParamRole::SharedEmbedding,
            &cfg,
            vb.pp("shared"),
        )?);
        VlT5Stack::load(decoder, vb.pp("stack"), &shared, &cfg)
    }

    #[test]
    fn causal_mask_zeroes_future_attention_weights() -> Result<()> {
        let stack = tiny_stack(true)?;
        let ids = Tensor::new(&[[3u32, 1, 4, 1]], &Device::Cpu)?;
        let out = stack.forward(Some(&ids), None, None, None, None, None, true)?;
        let attentions = out.attentions.unwrap();
        assert_eq!(attentions.len(), 2);
        for weights in attentions.iter() {
            assert_eq!(weights.dims(), [1, 2, 4, 4]);
            for head in 0..2 {
                for i in 0..4 {
                    for j in (i + 1)..4 {
                        let w = weights.i((0, head, i, j))?.to_scalar::<f32>()?;
                        assert_eq!(w, 0.0, "position {i} attends to future position {j}");
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn incremental_decoding_matches_the_full_pass() -> Result<()> {
        let stack = tiny_stack(true)?;
        let tokens = [3u32, 1, 4, 1];
        let ids = Tensor::new(&[tokens], &Device::Cpu)?;
        let full = stack
            .forward(Some(&ids), None, None, None, None, None, false)?
            .hidden_states;
        let full_last = full.narrow(1, 3, 1)?.flatten_all()?.to_vec1::<f32>()?;

        let mut cache = DecoderKvCache::new(stack.num_layers());
        let mut last = Vec::new();
        for &t in tokens.iter() {
            let step = Tensor::new(&[[t]], &Device::Cpu)?;
            let out = stack.forward(Some(&step), None, None, None, None, Some(&mut cache), false)?;
            last = out.hidden_states.flatten_all()?.to_vec1::<f32>()?;
        }
        assert_eq!(cache.seq_len()?, 4);
        assert_eq!(full_last.len(), last.len());
        for (a, b) in full_last.iter().zip(last.iter()) {
            assert!((a - b).abs() < 1e-5, "cached {b} vs full {a}");
        }
        Ok(())
    }

    #[test]
    fn caching_on_an_encoder_stack_is_rejected() -> Result<()> {
        let stack = tiny_stack(false)?;
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu)?;
        let mut cache = DecoderKvCache::new(stack.num_layers());
        let res = stack.forward(Some(&ids), None, None, None, None, Some(&mut cache), false);
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn multi_token_input_with_nonempty_cache_is_rejected() -> Result<()> {
        let stack = tiny_stack(true)?;
        let mut cache = DecoderKvCache::new(stack.num_layers());
        let step = Tensor::new(&[[1u32]], &Device::Cpu)?;
        stack.forward(Some(&step), None, None, None, None, Some(&mut cache), false)?;
        let two = Tensor::new(&[[1u32, 2]], &Device::Cpu)?;
        let res = stack.forward(Some(&two), None, None, None, None, Some(&mut cache), false);
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn token_ids_and_embeddings_are_mutually_exclusive() -> Result<()> {
        let stack = tiny_stack(false)?;
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu)?;
        let embeds = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu)?;
        assert!(stack
            .forward(Some(&ids), Some(&embeds), None, None, None, None, false)
            .is_err());
        assert!(stack.forward(None, None, None, None, None, None, false).is_err());
        Ok(())
    }

    #[test]
    fn cached_self_state_without_cross_state_is_rejected() -> Result<()> {
        let stack = tiny_stack(true)?;
        let step = Tensor::new(&[[1u32]], &Device::Cpu)?;
        // Populate the self-attention entries only.
        let mut cache = DecoderKvCache::new(stack.num_layers());
        stack.forward(Some(&step), None, None, None, None, Some(&mut cache), false)?;
        // Cross-attention now expects its cached pair alongside.
        let enc = Tensor::zeros((1, 3, 8), DType::F32, &Device::Cpu)?;
        let res = stack.forward(Some(&step), None, None, Some(&enc), None, Some(&mut cache), false);
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn reorder_follows_the_given_batch_permutation() -> Result<()> {
        let mut cache = DecoderKvCache::new(1);
        let k = Tensor::new(&[[[[1f32], [2.]]], [[[3.], [4.]]]], &Device::Cpu)?;
        let v = (&k * 10.)?;
        cache.layer_mut(0).self_attn = Some((k, v));
        let index = Tensor::new(&[1u32, 0], &Device::Cpu)?;
        cache.reorder(&index)?;
        let (k, v) = cache.layer_mut(0).self_attn.clone().unwrap();
        assert_eq!(k.flatten_all()?.to_vec1::<f32>()?, [3., 4., 1., 2.]);
        assert_eq!(v.flatten_all()?.to_vec1::<f32>()?, [30., 40., 10., 20.]);
        Ok(())
    }
}
