use candle::{DType, Device, Result, Tensor};

use super::config::Config;
use super::model::VlT5ForConditionalGeneration;
use super::stack::DecoderKvCache;
use super::visual::VisualFeatures;
use crate::generation::{LogitsProcessor, Sampling};
use crate::utils;

/// Decoding hyperparameters, validated once before the loop starts. Token id
/// fields override the model configuration when set.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_length: usize,
    pub min_length: usize,
    pub do_sample: bool,
    pub early_stopping: bool,
    pub num_beams: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub bad_words_ids: Vec<Vec<u32>>,
    pub length_penalty: f64,
    pub num_return_sequences: usize,
    pub decoder_start_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
    pub pad_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub use_cache: bool,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            min_length: 0,
            do_sample: false,
            early_stopping: false,
            num_beams: 1,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            bad_words_ids: vec![],
            length_penalty: 1.0,
            num_return_sequences: 1,
            decoder_start_token_id: None,
            bos_token_id: None,
            pad_token_id: None,
            eos_token_id: None,
            use_cache: true,
            seed: 299792458,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            candle::bail!("max_length should be a strictly positive integer")
        }
        if self.num_beams == 0 {
            candle::bail!("num_beams should be a strictly positive integer")
        }
        if self.temperature <= 0. {
            candle::bail!("temperature should be strictly positive")
        }
        if !(0. ..=1.).contains(&self.top_p) {
            candle::bail!("top_p should be between 0 and 1")
        }
        if self.repetition_penalty < 1. {
            candle::bail!("repetition_penalty should be >= 1")
        }
        if self.length_penalty <= 0. {
            candle::bail!("length_penalty should be strictly positive")
        }
        if self.num_return_sequences == 0 {
            candle::bail!("num_return_sequences should be a strictly positive integer")
        }
        if self.bad_words_ids.iter().any(|w| w.is_empty()) {
            candle::bail!("bad_words_ids should be a list of non-empty token id lists")
        }
        if self.num_beams == 1 && !self.do_sample && self.num_return_sequences > 1 {
            candle::bail!(
                "greedy decoding always returns the same sequence, \
                 use sampling or beam search for num_return_sequences > 1"
            )
        }
        if self.num_beams > 1 && self.num_return_sequences > self.num_beams {
            candle::bail!("beam search cannot return more sequences than it has beams")
        }
        Ok(())
    }

    pub(crate) fn sampling(&self, vocab_size: usize) -> Sampling {
        if !self.do_sample {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        let k = (self.top_k > 0 && self.top_k < vocab_size).then_some(self.top_k);
        let p = (self.top_p > 0. && self.top_p < 1.).then_some(self.top_p);
        match (k, p) {
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (None, None) => Sampling::All { temperature },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SpecialTokens {
    pub start: u32,
    pub eos: Option<u32>,
    pub pad: u32,
}

fn resolve_special_tokens(gen_cfg: &GenerationConfig, cfg: &Config) -> Result<SpecialTokens> {
    let bos = gen_cfg.bos_token_id.or(cfg.bos_token_id);
    let eos = gen_cfg.eos_token_id.or(cfg.eos_token_id);
    let start = match gen_cfg
        .decoder_start_token_id
        .or(cfg.decoder_start_token_id)
        .or(bos)
    {
        Some(id) => id,
        None => candle::bail!(
            "decoder_start_token_id or bos_token_id has to be defined for encoder-decoder generation"
        ),
    };
    let pad = match gen_cfg.pad_token_id.or(cfg.pad_token_id) {
        Some(id) => id,
        None => match eos {
            Some(eos) => {
                tracing::warn!("setting pad_token_id to {eos} (eos_token_id) as it is not defined");
                eos
            }
            None => {
                candle::bail!("pad_token_id or eos_token_id has to be defined to pad generations")
            }
        },
    };
    Ok(SpecialTokens { start, eos, pad })
}

/// Repeats each batch row `times` times, keeping rows of one batch item
/// contiguous.
fn expand_rows(enc: &Tensor, mask: &Tensor, times: usize) -> Result<(Tensor, Tensor)> {
    let b_sz = enc.dim(0)?;
    let index: Vec<u32> = (0..b_sz as u32)
        .flat_map(|i| std::iter::repeat(i).take(times))
        .collect();
    let index = Tensor::from_vec(index, b_sz * times, enc.device())?;
    Ok((enc.index_select(&index, 0)?, mask.index_select(&index, 0)?))
}

/// In-place logit transforms shared by the greedy and beam drivers.
pub(crate) fn apply_row_transforms(
    logits: &mut [f32],
    context: &[u32],
    cur_len: usize,
    eos: Option<u32>,
    cfg: &GenerationConfig,
) {
    if cfg.repetition_penalty != 1.0 {
        utils::apply_repeat_penalty(logits, cfg.repetition_penalty, context)
    }
    if cfg.no_repeat_ngram_size > 0 {
        utils::ban_repeated_ngrams(logits, cfg.no_repeat_ngram_size, context)
    }
    if !cfg.bad_words_ids.is_empty() {
        utils::ban_bad_words(logits, &cfg.bad_words_ids, context)
    }
    if let Some(eos) = eos {
        if cur_len < cfg.min_length {
            utils::ban_token(logits, eos)
        }
    }
}

impl VlT5ForConditionalGeneration {
    /// Generates token id sequences for a batch of inputs. The encoder runs
    /// once; every subsequent step feeds the newest token back through the
    /// decoder, carrying the key/value cache. Returns
    /// `(batch * num_return_sequences, len)` ids padded with the pad token.
    pub fn generate(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        visual: Option<&VisualFeatures>,
        gen_cfg: &GenerationConfig,
    ) -> Result<Tensor> {
        gen_cfg.validate()?;
        let tokens = resolve_special_tokens(gen_cfg, self.config())?;
        let (b_sz, _) = input_ids.dims2()?;
        let encoder_output = self.encode(input_ids, attention_mask, visual)?;
        let encoder_mask =
            self.joint_attention_mask(input_ids, attention_mask, encoder_output.dim(1)?)?;
        if gen_cfg.num_beams > 1 {
            let (enc, mask) = expand_rows(&encoder_output, &encoder_mask, gen_cfg.num_beams)?;
            self.generate_beam_search(&enc, &mask, b_sz, &tokens, gen_cfg)
        } else {
            let mult = if gen_cfg.do_sample { gen_cfg.num_return_sequences } else { 1 };
            let (enc, mask) = if mult > 1 {
                expand_rows(&encoder_output, &encoder_mask, mult)?
            } else {
                (encoder_output, encoder_mask)
            };
            self.generate_greedy(&enc, &mask, &tokens, gen_cfg)
        }
    }

    /// Next-step decoder input: the full prefix on the first (or uncached)
    /// call, only the newest token once the cache is populated.
    pub(crate) fn decoder_input(
        &self,
        sequences: &[Vec<u32>],
        cache: Option<&DecoderKvCache>,
    ) -> Result<Tensor> {
        let rows = sequences.len();
        let take_last = cache.map_or(false, |c| !c.is_empty());
        if take_last {
            let last: Vec<u32> = sequences.iter().map(|s| *s.last().unwrap()).collect();
            Tensor::from_vec(last, (rows, 1), self.device())
        } else {
            let len = sequences[0].len();
            let flat: Vec<u32> = sequences.concat();
            Tensor::from_vec(flat, (rows, len), self.device())
        }
    }

    fn generate_greedy(
        &self,
        encoder_output: &Tensor,
        encoder_mask: &Tensor,
        tokens: &SpecialTokens,
        gen_cfg: &GenerationConfig,
    ) -> Result<Tensor> {
        let rows = encoder_output.dim(0)?;
        let vocab_size = self.config().vocab_size;
        let mut processor =
            LogitsProcessor::from_sampling(gen_cfg.seed, gen_cfg.sampling(vocab_size));
        let mut cache = if gen_cfg.use_cache {
            Some(self.new_cache())
        } else {
            None
        };
        let mut sequences: Vec<Vec<u32>> = vec![vec![tokens.start]; rows];
        let mut finished = vec![false; rows];
        let mut cur_len = 1usize;
        while cur_len < gen_cfg.max_length {
            let input = self.decoder_input(&sequences, cache.as_ref())?;
            let logits = self.decode(&input, encoder_output, Some(encoder_mask), cache.as_mut())?;
            let last = logits.narrow(1, logits.dim(1)? - 1, 1)?.squeeze(1)?;
            let logits_rows: Vec<Vec<f32>> = last.to_dtype(DType::F32)?.to_vec2()?;
            for (r, mut row) in logits_rows.into_iter().enumerate() {
                if finished[r] {
                    // Finished sequences keep emitting padding.
                    sequences[r].push(tokens.pad);
                    continue;
                }
                apply_row_transforms(&mut row, &sequences[r], cur_len, tokens.eos, gen_cfg);
                let row = Tensor::from_vec(row, vocab_size, &Device::Cpu)?;
                let next = processor.sample(&row)?;
                sequences[r].push(next);
                if tokens.eos == Some(next) {
                    finished[r] = true
                }
            }
            cur_len += 1;
            if finished.iter().all(|&f| f) {
                break;
            }
        }
        let len = cur_len;
        let flat: Vec<u32> = sequences.concat();
        Tensor::from_vec(flat, (rows, len), self.device())
    }
}
