use std::collections::HashMap;
use std::sync::Arc;

use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::config::Config;
use super::init::{self, ParamRole};
use super::stack::{DecoderKvCache, VlT5Stack};
use super::visual::{VisualFeatures, VlT5JointEncoder};
use crate::models::with_tracing::{Embedding, Linear};

fn load_shared_embedding(vb: &VarBuilder, cfg: &Config) -> Result<Arc<Embedding>> {
    let shared = init::embedding(
        cfg.vocab_size,
        cfg.d_model,
        ParamRole::SharedEmbedding,
        cfg,
        vb.pp("shared"),
    )?;
    Ok(Arc::new(shared))
}

/// Encoder-only wrapper, e.g. for producing joint text/region representations.
#[derive(Debug, Clone)]
pub struct VlT5EncoderModel {
    encoder: VlT5JointEncoder,
    device: Device,
}

impl VlT5EncoderModel {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let shared = load_shared_embedding(&vb, cfg)?;
        let mut encoder_cfg = cfg.clone();
        encoder_cfg.is_decoder = false;
        encoder_cfg.use_cache = false;
        let encoder = VlT5JointEncoder::load(vb.pp("encoder"), &shared, &encoder_cfg)?;
        Ok(Self {
            encoder,
            device: vb.device().clone(),
        })
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        visual: Option<&VisualFeatures>,
    ) -> Result<Tensor> {
        let out = self
            .encoder
            .forward(Some(input_ids), None, attention_mask, visual, false)?;
        Ok(out.hidden_states)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Full encoder-decoder with a language modeling head.
#[derive(Debug, Clone)]
pub struct VlT5ForConditionalGeneration {
    encoder: VlT5JointEncoder,
    decoder: VlT5Stack,
    lm_head: Linear,
    d_model: usize,
    config: Config,
    device: Device,
}

impl VlT5ForConditionalGeneration {
    pub fn load(vb: VarBuilder, cfg: &Config) -> Result<Self> {
        let shared = load_shared_embedding(&vb, cfg)?;

        let mut encoder_cfg = cfg.clone();
        encoder_cfg.is_decoder = false;
        encoder_cfg.use_cache = false;
        let encoder = VlT5JointEncoder::load(vb.pp("encoder"), &shared, &encoder_cfg)?;

        let mut decoder_cfg = cfg.clone();
        decoder_cfg.is_decoder = true;
        decoder_cfg.num_layers = cfg.num_decoder_layers.unwrap_or(cfg.num_layers);
        let decoder = VlT5Stack::load(true, vb.pp("decoder"), &shared, &decoder_cfg)?;

        let lm_head = init::linear(
            cfg.d_model,
            cfg.vocab_size,
            ParamRole::LmHead,
            cfg,
            vb.pp("lm_head"),
        )?;

        Ok(Self {
            encoder,
            decoder,
            lm_head,
            d_model: cfg.d_model,
            config: cfg.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh, empty cache sized for the decoder stack.
    pub fn new_cache(&self) -> DecoderKvCache {
        DecoderKvCache::new(self.decoder.num_layers())
    }

    /// Encodes text tokens, and region features when supplied, into
    /// `(batch, text+visual, d_model)` hidden states.
    pub fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        visual: Option<&VisualFeatures>,
    ) -> Result<Tensor> {
        let out = self
            .encoder
            .forward(Some(input_ids), None, attention_mask, visual, false)?;
        Ok(out.hidden_states)
    }

    /// Runs the decoder over `decoder_input_ids` and projects to vocabulary
    /// logits `(batch, seq, vocab)`. With a non-empty `cache` only the newest
    /// token may be fed in.
    pub fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: Option<&Tensor>,
        cache: Option<&mut DecoderKvCache>,
    ) -> Result<Tensor> {
        let out = self.decoder.forward(
            Some(decoder_input_ids),
            None,
            None,
            Some(encoder_hidden_states),
            encoder_attention_mask,
            cache,
            false,
        )?;
        // Rescale before projecting on the vocabulary, per the Mesh
        // TensorFlow formulation.
        let sequence_output = (out.hidden_states * (self.d_model as f64).powf(-0.5))?;
        self.lm_head.forward(&sequence_output)
    }

    /// Extends the text attention mask with all-ones entries covering the
    /// visual tokens appended by the joint encoder.
    pub(crate) fn joint_attention_mask(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_len: usize,
    ) -> Result<Tensor> {
        let (b_sz, text_len) = input_ids.dims2()?;
        let text_mask = match attention_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => Tensor::ones((b_sz, text_len), DType::F32, input_ids.device())?,
        };
        if encoder_len == text_len {
            return Ok(text_mask);
        }
        let vis_mask = Tensor::ones(
            (b_sz, encoder_len - text_len),
            DType::F32,
            input_ids.device(),
        )?;
        Tensor::cat(&[&text_mask, &vis_mask], 1)
    }

    /// Full teacher-forced pass, returning `(batch, seq, vocab)` logits.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        visual: Option<&VisualFeatures>,
        decoder_input_ids: &Tensor,
    ) -> Result<Tensor> {
        let encoder_hidden_states = self.encode(input_ids, attention_mask, visual)?;
        let encoder_attention_mask =
            self.joint_attention_mask(input_ids, attention_mask, encoder_hidden_states.dim(1)?)?;
        self.decode(
            decoder_input_ids,
            &encoder_hidden_states,
            Some(&encoder_attention_mask),
            None,
        )
    }

    /// Cross-entropy loss on `labels`, with the decoder inputs derived by
    /// shifting the labels right. Positions holding the pad token are ignored.
    pub fn loss(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        visual: Option<&VisualFeatures>,
        labels: &Tensor,
    ) -> Result<Tensor> {
        let decoder_input_ids = self.shift_right(labels)?;
        let logits = self.forward(input_ids, attention_mask, visual, &decoder_input_ids)?;
        let pad_token_id = match self.config.pad_token_id {
            Some(id) => id,
            None => candle::bail!("pad_token_id has to be defined to compute the loss"),
        };
        let (b_sz, seq_len, vocab_size) = logits.dims3()?;
        let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        let log_probs = log_probs.reshape((b_sz * seq_len, vocab_size))?;
        let labels = labels.reshape((b_sz * seq_len,))?;
        let picked = log_probs.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?;
        let mask = labels.ne(pad_token_id)?.to_dtype(DType::F32)?;
        let count = mask.sum_all()?.to_scalar::<f32>()?;
        if count == 0. {
            candle::bail!("every label position holds the pad token, nothing to score")
        }
        let loss = ((picked * mask)?.sum_all()? / count as f64)?.neg()?;
        Ok(loss)
    }

    /// Builds decoder inputs for teacher forcing: the decoder start token
    /// followed by the labels without their last position.
    pub fn shift_right(&self, labels: &Tensor) -> Result<Tensor> {
        let decoder_start_token_id = match self.config.decoder_start_token_id {
            Some(id) => id,
            None => candle::bail!(
                "decoder_start_token_id has to be defined to shift labels right"
            ),
        };
        if self.config.pad_token_id.is_none() {
            candle::bail!("pad_token_id has to be defined to shift labels right")
        }
        let (b_sz, seq_len) = labels.dims2()?;
        let start = Tensor::full(decoder_start_token_id, (b_sz, 1), labels.device())?;
        Tensor::cat(&[&start, &labels.narrow(1, 0, seq_len - 1)?], 1)
    }

    /// Prunes encoder self-attention heads, `layer index -> head indices`.
    pub fn prune_heads(&mut self, heads_to_prune: &HashMap<usize, Vec<usize>>) -> Result<()> {
        for (layer, heads) in heads_to_prune.iter() {
            self.encoder.prune_heads(*layer, heads)?;
        }
        Ok(())
    }
}
