use candle::{DType, Result, Tensor};
use rand::{distributions::Distribution, SeedableRng};

use super::generation::{GenerationConfig, SpecialTokens};
use super::model::VlT5ForConditionalGeneration;
use crate::utils;

/// Bounded best-list of finished hypotheses for one batch item. Scores are
/// cumulative log-probabilities normalized by `len^length_penalty`.
pub(crate) struct BeamHypotheses {
    beams: Vec<(f64, Vec<u32>)>,
    num_beams: usize,
    length_penalty: f64,
    early_stopping: bool,
    worst_score: f64,
}

impl BeamHypotheses {
    pub(crate) fn new(num_beams: usize, length_penalty: f64, early_stopping: bool) -> Self {
        Self {
            beams: Vec::with_capacity(num_beams + 1),
            num_beams,
            length_penalty,
            early_stopping,
            worst_score: 1e9,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.beams.len()
    }

    pub(crate) fn add(&mut self, hyp: Vec<u32>, sum_logprobs: f64) {
        let score = sum_logprobs / (hyp.len() as f64).powf(self.length_penalty);
        if self.beams.len() < self.num_beams || score > self.worst_score {
            self.beams.push((score, hyp));
            if self.beams.len() > self.num_beams {
                let worst = self
                    .beams
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.0.total_cmp(&b.0))
                    .map(|(i, _)| i)
                    .unwrap();
                self.beams.swap_remove(worst);
            }
            self.worst_score = self
                .beams
                .iter()
                .map(|(s, _)| *s)
                .fold(f64::INFINITY, f64::min);
        }
    }

    /// Whether generation for this batch item can stop. Without early
    /// stopping, it only stops once no open beam could still beat the worst
    /// finished hypothesis.
    pub(crate) fn is_done(&self, best_sum_logprobs: f64, cur_len: usize) -> bool {
        if self.beams.len() < self.num_beams {
            false
        } else if self.early_stopping {
            true
        } else {
            self.worst_score >= best_sum_logprobs / (cur_len as f64).powf(self.length_penalty)
        }
    }

    /// The `n` best hypotheses, best first.
    pub(crate) fn take_best(&mut self, n: usize) -> Vec<Vec<u32>> {
        self.beams.sort_by(|a, b| b.0.total_cmp(&a.0));
        self.beams.iter().take(n).map(|(_, s)| s.clone()).collect()
    }
}

fn log_softmax_row(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    let lse = max + sum.ln();
    for x in row.iter_mut() {
        *x -= lse
    }
}

/// Deterministic candidate selection: the top `2 * num_beams` (beam, token)
/// pairs of one batch item by combined score, best first.
fn top_candidates(
    scores: &[Vec<f32>],
    beam_scores: &[f64],
    batch_idx: usize,
    num_beams: usize,
    vocab_size: usize,
) -> Vec<(f64, usize, u32)> {
    let take = 2 * num_beams;
    let mut candidates: Vec<(f64, usize, u32)> = Vec::with_capacity(num_beams * take);
    for beam in 0..num_beams {
        let row = batch_idx * num_beams + beam;
        let mut idx: Vec<usize> = (0..vocab_size).collect();
        if vocab_size > take {
            idx.select_nth_unstable_by(take, |&a, &b| scores[row][b].total_cmp(&scores[row][a]));
            idx.truncate(take);
        }
        for &t in idx.iter() {
            candidates.push((beam_scores[row] + scores[row][t] as f64, beam, t as u32));
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
    candidates.truncate(take);
    candidates
}

/// Stochastic candidate selection: `2 * num_beams` draws without replacement
/// from the temperature/top-k/top-p filtered distribution over all
/// (beam, token) pairs of one batch item.
fn sample_candidates(
    scores: &[Vec<f32>],
    beam_scores: &[f64],
    batch_idx: usize,
    num_beams: usize,
    vocab_size: usize,
    cfg: &GenerationConfig,
    rng: &mut rand::rngs::StdRng,
) -> Result<Vec<(f64, usize, u32)>> {
    let take = 2 * num_beams;
    let mut combined: Vec<f64> = Vec::with_capacity(num_beams * vocab_size);
    for beam in 0..num_beams {
        let row = batch_idx * num_beams + beam;
        for t in 0..vocab_size {
            combined.push(beam_scores[row] + scores[row][t] as f64)
        }
    }
    let max = combined.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut probs: Vec<f64> = combined.iter().map(|&s| (s - max).exp()).collect();
    if cfg.top_k > 0 && cfg.top_k < probs.len() {
        let mut idx: Vec<usize> = (0..probs.len()).collect();
        idx.select_nth_unstable_by(cfg.top_k, |&a, &b| probs[b].total_cmp(&probs[a]));
        for &i in &idx[cfg.top_k..] {
            probs[i] = 0.
        }
    }
    if cfg.top_p > 0. && cfg.top_p < 1. {
        let mut idx: Vec<usize> = (0..probs.len()).collect();
        idx.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
        let total: f64 = probs.iter().sum();
        let mut cumsum = 0.;
        for &i in idx.iter() {
            if cumsum >= cfg.top_p * total {
                probs[i] = 0.
            } else {
                cumsum += probs[i]
            }
        }
    }
    let mut candidates = Vec::with_capacity(take);
    for _ in 0..take {
        let distr = rand::distributions::WeightedIndex::new(&probs).map_err(candle::Error::wrap)?;
        let pick = distr.sample(rng);
        probs[pick] = 0.;
        candidates.push((combined[pick], pick / vocab_size, (pick % vocab_size) as u32));
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
    Ok(candidates)
}

impl VlT5ForConditionalGeneration {
    /// Beam search over `batch_size` items, each expanded to `num_beams`
    /// contiguous rows of the encoder output. Every re-ranking step reorders
    /// the decoder cache rows to follow their beam of origin.
    pub(crate) fn generate_beam_search(
        &self,
        encoder_output: &Tensor,
        encoder_mask: &Tensor,
        batch_size: usize,
        tokens: &SpecialTokens,
        gen_cfg: &GenerationConfig,
    ) -> Result<Tensor> {
        let num_beams = gen_cfg.num_beams;
        let rows = batch_size * num_beams;
        let vocab_size = self.config().vocab_size;
        let mut cache = if gen_cfg.use_cache {
            Some(self.new_cache())
        } else {
            None
        };
        let mut sequences: Vec<Vec<u32>> = vec![vec![tokens.start]; rows];
        // All beams of an item start identical; in the deterministic case all
        // but the first are disabled so the first step diversifies them.
        let mut beam_scores = vec![0f64; rows];
        if !gen_cfg.do_sample {
            for (i, score) in beam_scores.iter_mut().enumerate() {
                if i % num_beams != 0 {
                    *score = -1e9
                }
            }
        }
        let mut hypotheses: Vec<BeamHypotheses> = (0..batch_size)
            .map(|_| BeamHypotheses::new(num_beams, gen_cfg.length_penalty, gen_cfg.early_stopping))
            .collect();
        let mut done = vec![false; batch_size];
        let mut rng = rand::rngs::StdRng::seed_from_u64(gen_cfg.seed);
        let mut cur_len = 1usize;

        while cur_len < gen_cfg.max_length {
            let input = self.decoder_input(&sequences, cache.as_ref())?;
            let logits = self.decode(&input, encoder_output, Some(encoder_mask), cache.as_mut())?;
            let last = logits.narrow(1, logits.dim(1)? - 1, 1)?.squeeze(1)?;
            let mut scores: Vec<Vec<f32>> = last.to_dtype(DType::F32)?.to_vec2()?;
            for (row, score) in scores.iter_mut().enumerate() {
                if gen_cfg.repetition_penalty != 1.0 {
                    utils::apply_repeat_penalty(
                        score,
                        gen_cfg.repetition_penalty,
                        &sequences[row],
                    )
                }
                if gen_cfg.do_sample && gen_cfg.temperature != 1.0 {
                    for x in score.iter_mut() {
                        *x /= gen_cfg.temperature as f32
                    }
                }
                log_softmax_row(score);
                // The remaining transforms operate on log-probabilities.
                if let Some(eos) = tokens.eos {
                    if cur_len < gen_cfg.min_length {
                        utils::ban_token(score, eos)
                    }
                }
                if gen_cfg.no_repeat_ngram_size > 0 {
                    utils::ban_repeated_ngrams(
                        score,
                        gen_cfg.no_repeat_ngram_size,
                        &sequences[row],
                    )
                }
                if !gen_cfg.bad_words_ids.is_empty() {
                    utils::ban_bad_words(score, &gen_cfg.bad_words_ids, &sequences[row])
                }
            }

            let mut next_tokens: Vec<u32> = Vec::with_capacity(rows);
            let mut next_sources: Vec<u32> = Vec::with_capacity(rows);
            let mut next_scores: Vec<f64> = Vec::with_capacity(rows);
            for batch_idx in 0..batch_size {
                if done[batch_idx] {
                    for _ in 0..num_beams {
                        next_tokens.push(tokens.pad);
                        next_sources.push((batch_idx * num_beams) as u32);
                        next_scores.push(0.0);
                    }
                    continue;
                }
                let candidates = if gen_cfg.do_sample {
                    sample_candidates(
                        &scores,
                        &beam_scores,
                        batch_idx,
                        num_beams,
                        vocab_size,
                        gen_cfg,
                        &mut rng,
                    )?
                } else {
                    top_candidates(&scores, &beam_scores, batch_idx, num_beams, vocab_size)
                };
                let best_candidate_score =
                    candidates.first().map_or(f64::NEG_INFINITY, |c| c.0);
                let mut kept = 0;
                for (rank, (score, beam, token)) in candidates.iter().enumerate() {
                    let row = batch_idx * num_beams + beam;
                    if tokens.eos == Some(*token) {
                        // Finished candidates outside the top beams are dropped.
                        if rank >= num_beams {
                            continue;
                        }
                        hypotheses[batch_idx].add(sequences[row].clone(), *score);
                    } else {
                        next_tokens.push(*token);
                        next_sources.push(row as u32);
                        next_scores.push(*score);
                        kept += 1;
                    }
                    if kept == num_beams {
                        break;
                    }
                }
                if kept < num_beams {
                    candle::bail!(
                        "beam search kept only {kept} of {num_beams} continuations for batch item {batch_idx}"
                    )
                }
                done[batch_idx] = hypotheses[batch_idx].is_done(best_candidate_score, cur_len);
            }
            if done.iter().all(|&d| d) {
                break;
            }
            let mut reordered = Vec::with_capacity(rows);
            for (slot, &src) in next_sources.iter().enumerate() {
                let mut seq = sequences[src as usize].clone();
                seq.push(next_tokens[slot]);
                reordered.push(seq);
            }
            sequences = reordered;
            beam_scores = next_scores;
            if let Some(cache) = cache.as_mut() {
                // Beam identity no longer matches cache row identity after the
                // re-ranking above, realign the cache.
                let index = Tensor::from_vec(next_sources, rows, self.device())?;
                cache.reorder(&index)?;
            }
            cur_len += 1;
        }

        // Open beams of unfinished items compete as they stand.
        for batch_idx in 0..batch_size {
            if done[batch_idx] {
                continue;
            }
            for beam in 0..num_beams {
                let row = batch_idx * num_beams + beam;
                hypotheses[batch_idx].add(sequences[row].clone(), beam_scores[row]);
            }
        }

        let mut best: Vec<Vec<u32>> = Vec::with_capacity(batch_size * gen_cfg.num_return_sequences);
        for hyp in hypotheses.iter_mut() {
            let selected = hyp.take_best(gen_cfg.num_return_sequences);
            if selected.len() < gen_cfg.num_return_sequences {
                candle::bail!(
                    "beam search finished with {} hypotheses, {} requested",
                    selected.len(),
                    gen_cfg.num_return_sequences
                )
            }
            best.extend(selected);
        }
        let max_len = best.iter().map(|s| s.len()).max().unwrap_or(1);
        let padded_len = (max_len + 1).min(gen_cfg.max_length);
        let mut flat = Vec::with_capacity(best.len() * padded_len);
        for seq in best.iter() {
            let mut seq = seq.clone();
            if seq.len() < padded_len {
                if let Some(eos) = tokens.eos {
                    seq.push(eos)
                }
            }
            seq.resize(padded_len, tokens.pad);
            flat.extend(seq);
        }
        Tensor::from_vec(flat, (best.len(), padded_len), self.device())
    }
}

#[cfg(test)]
mod tests {
    use super::BeamHypotheses;

    #[test]
    fn hypotheses_keep_the_best_bounded_set() {
        let mut hyp = BeamHypotheses::new(2, 1.0, false);
        hyp.add(vec![0, 1], -4.0);
        hyp.add(vec![0, 2], -2.0);
        assert_eq!(hyp.len(), 2);
        // Better than the current worst, evicts it.
        hyp.add(vec![0, 3], -1.0);
        assert_eq!(hyp.len(), 2);
        let best = hyp.take_best(2);
        assert_eq!(best[0], vec![0, 3]);
        assert_eq!(best[1], vec![0, 2]);
        // Worse than everything retained, ignored.
        hyp.add(vec![0, 4], -100.0);
        assert_eq!(hyp.take_best(2)[1], vec![0, 2]);
    }

    #[test]
    fn length_penalty_normalizes_scores() {
        let mut hyp = BeamHypotheses::new(1, 2.0, false);
        hyp.add(vec![0; 2], -8.0); // score -8 / 4 = -2
        hyp.add(vec![0; 4], -24.0); // score -24 / 16 = -1.5, better
        assert_eq!(hyp.take_best(1)[0].len(), 4);
    }

    #[test]
    fn early_stopping_is_done_once_full() {
        let mut hyp = BeamHypotheses::new(1, 1.0, true);
        assert!(!hyp.is_done(0.0, 4));
        hyp.add(vec![0, 1], -1.0);
        assert!(hyp.is_done(0.0, 4));

        // Without early stopping, a promising open beam keeps the search alive.
        let mut hyp = BeamHypotheses::new(1, 1.0, false);
        hyp.add(vec![0, 1], -8.0);
        assert!(!hyp.is_done(-2.0, 4));
        assert!(hyp.is_done(-100.0, 4));
    }
}
