use candle::{Device, Result, Tensor};
use candle_vlt5::generation::{LogitsProcessor, Sampling};

#[test]
fn sample_with_zero_temperature() -> Result<()> {
    let mut logits_process = LogitsProcessor::new(1337, None, None);
    let logits = Tensor::new(&[0.1, 0.2, 0.3, 0.4], &Device::Cpu)?;
    let token = logits_process.sample(&logits)?;
    assert_eq!(token, 3);
    Ok(())
}

#[test]
fn sample_with_top_k_one_is_greedy() -> Result<()> {
    let mut logits_process = LogitsProcessor::from_sampling(
        42,
        Sampling::TopK {
            k: 1,
            temperature: 1.0,
        },
    );
    let logits = Tensor::new(&[0.1, 0.2, 0.3, 0.4], &Device::Cpu)?;
    for _ in 0..4 {
        assert_eq!(logits_process.sample(&logits)?, 3);
    }
    Ok(())
}

#[test]
fn sample_with_tiny_top_p_keeps_only_the_top_token() -> Result<()> {
    let mut logits_process = LogitsProcessor::from_sampling(
        42,
        Sampling::TopP {
            p: 0.01,
            temperature: 1.0,
        },
    );
    let logits = Tensor::new(&[0.1, 0.2, 0.3, 0.4], &Device::Cpu)?;
    for _ in 0..4 {
        assert_eq!(logits_process.sample(&logits)?, 3);
    }
    Ok(())
}

#[test]
fn sampling_is_reproducible_per_seed() -> Result<()> {
    let logits = Tensor::new(&[0.1, 0.2, 0.3, 0.4], &Device::Cpu)?;
    let sample = |seed: u64| -> Result<Vec<u32>> {
        let mut p = LogitsProcessor::from_sampling(seed, Sampling::All { temperature: 1.0 });
        (0..8).map(|_| p.sample(&logits)).collect()
    };
    let a = sample(42)?;
    let b = sample(42)?;
    assert_eq!(a, b);
    assert!(a.iter().all(|&t| t < 4));
    Ok(())
}

#[test]
fn sample_f_can_mask_candidates() -> Result<()> {
    let mut logits_process = LogitsProcessor::new(0, None, None);
    let logits = Tensor::new(&[0.1, 0.2, 0.3, 0.4], &Device::Cpu)?;
    let token = logits_process.sample_f(&logits, |logits| logits[3] = f32::NEG_INFINITY)?;
    assert_eq!(token, 2);
    Ok(())
}
