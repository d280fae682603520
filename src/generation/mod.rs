//! Token-level sampling of next-token candidates from logits.
use candle::{DType, Error, Result, Tensor};
use rand::{distributions::Distribution, SeedableRng};

#[derive(Clone, PartialEq, Debug)]
pub enum Sampling {
    ArgMax,
    All { temperature: f64 },
    TopK { k: usize, temperature: f64 },
    TopP { p: f64, temperature: f64 },
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

pub struct LogitsProcessor {
    rng: rand::rngs::StdRng,
    sampling: Sampling,
}

impl LogitsProcessor {
    pub fn from_sampling(seed: u64, sampling: Sampling) -> Self {
        let rng = rand::rngs::StdRng::seed_from_u64(seed);
        Self { rng, sampling }
    }

    pub fn new(seed: u64, temperature: Option<f64>, top_p: Option<f64>) -> Self {
        let temperature = temperature.and_then(|v| if v < 1e-7 { None } else { Some(v) });
        let sampling = match temperature {
            None => Sampling::ArgMax,
            Some(temperature) => match top_p {
                None => Sampling::All { temperature },
                Some(p) => Sampling::TopP { p, temperature },
            },
        };
        Self::from_sampling(seed, sampling)
    }

    fn sample_multinomial(&mut self, prs: &Vec<f32>) -> Result<u32> {
        let distr = rand::distributions::WeightedIndex::new(prs).map_err(Error::wrap)?;
        let next_token = distr.sample(&mut self.rng) as u32;
        Ok(next_token)
    }

    /// top-p sampling (or "nucleus sampling") samples from the smallest set of
    /// tokens that exceed probability top_p. This way we never sample tokens that
    /// have very low probabilities and are less likely to go "off the rails".
    fn sample_topp(&mut self, prs: &mut Vec<f32>, top_p: f32) -> Result<u32> {
        let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();
        // Sort by descending probability.
        argsort_indices.sort_by(|&i, &j| prs[j].total_cmp(&prs[i]));
        // Clamp smaller probabilities to zero.
        let mut cumsum = 0.;
        for index in &argsort_indices {
            if cumsum >= top_p {
                prs[*index] = 0.0;
            } else {
                cumsum += prs[*index];
            }
        }
        // Sample with clamped probabilities.
        self.sample_multinomial(prs)
    }

    /// top-k sampling samples from the k tokens with the largest probabilities.
    fn sample_topk(&mut self, prs: &mut Vec<f32>, top_k: usize) -> Result<u32> {
        if top_k >= prs.len() {
            return self.sample_multinomial(prs);
        }
        let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();
        let (indices, _, _) =
            argsort_indices.select_nth_unstable_by(top_k, |&i, &j| prs[j].total_cmp(&prs[i]));
        let prs = indices.iter().map(|&i| prs[i]).collect::<Vec<_>>();
        let index = self.sample_multinomial(&prs)?;
        Ok(indices[index as usize] as u32)
    }

    /// top-k sampling followed by top-p on the retained candidates.
    fn sample_topk_topp(&mut self, prs: &mut Vec<f32>, top_k: usize, top_p: f32) -> Result<u32> {
        if top_k >= prs.len() {
            return self.sample_topp(prs, top_p);
        }
        let mut argsort_indices = (0..prs.len()).collect::<Vec<_>>();
        let (indices, _, _) =
            argsort_indices.select_nth_unstable_by(top_k, |&i, &j| prs[j].total_cmp(&prs[i]));
        let mut prs = indices.iter().map(|&i| prs[i]).collect::<Vec<_>>();
        let sum_p = prs.iter().sum::<f32>();
        let index = if top_p <= 0.0 || top_p >= sum_p {
            self.sample_multinomial(&prs)?
        } else {
            self.sample_topp(&mut prs, top_p)?
        };
        Ok(indices[index as usize] as u32)
    }

    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        self.sample_f(logits, |_| {})
    }

    /// Samples a token after applying `f` to the raw logits (arg-max) or the
    /// softmaxed probabilities (sampling), e.g. to mask banned candidates.
    pub fn sample_f(&mut self, logits: &Tensor, f: impl FnOnce(&mut Vec<f32>)) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?;
        let prs = |logits: &Tensor, temperature: f64| -> Result<Vec<f32>> {
            let logits = (logits / temperature)?;
            let prs = candle_nn::ops::softmax_last_dim(&logits)?;
            Ok(prs.to_vec1()?)
        };
        let sampling = self.sampling.clone();
        let next_token = match sampling {
            Sampling::ArgMax => {
                let mut logits_v: Vec<f32> = logits.to_vec1()?;
                f(&mut logits_v);
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .unwrap()
            }
            Sampling::All { temperature } => {
                let mut prs = prs(&logits, temperature)?;
                f(&mut prs);
                self.sample_multinomial(&prs)?
            }
            Sampling::TopP { p, temperature } => {
                let mut prs = prs(&logits, temperature)?;
                f(&mut prs);
                if p <= 0.0 || p >= 1.0 {
                    // simply sample from the predicted probability distribution
                    self.sample_multinomial(&prs)?
                } else {
                    // top-p (nucleus) sampling, clamping the least likely tokens to zero
                    self.sample_topp(&mut prs, p as f32)?
                }
            }
            Sampling::TopK { k, temperature } => {
                let mut prs = prs(&logits, temperature)?;
                f(&mut prs);
                self.sample_topk(&mut prs, k)?
            }
            Sampling::TopKThenTopP { k, p, temperature } => {
                let mut prs = prs(&logits, temperature)?;
                f(&mut prs);
                self.sample_topk_topp(&mut prs, k, p as f32)?
            }
        };
        Ok(next_token)
    }
}
