use candle::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vlt5::models::vlt5::{
    Config, GenerationConfig, VisualFeatures, VlT5EncoderModel, VlT5ForConditionalGeneration,
};

fn tiny_config() -> Config {
    Config {
        vocab_size: 10,
        d_model: 8,
        d_kv: 4,
        d_ff: 16,
        num_layers: 2,
        num_heads: 2,
        relative_attention_num_buckets: 8,
        relative_attention_max_distance: 16,
        pad_token_id: Some(9),
        eos_token_id: Some(9),
        bos_token_id: Some(0),
        decoder_start_token_id: Some(0),
        feat_dim: 6,
        pos_dim: 4,
        ..Default::default()
    }
}

fn tiny_model() -> Result<VlT5ForConditionalGeneration> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    VlT5ForConditionalGeneration::load(vb, &tiny_config())
}

fn region_fixtures() -> Result<(Tensor, Tensor)> {
    let features = (Tensor::arange(0f32, 12., &Device::Cpu)?.reshape((1, 2, 6))? * 0.1)?;
    let boxes = Tensor::new(
        &[[[0.1f32, 0.6, 0.2, 0.7], [0.3, 0.9, 0.1, 0.5]]],
        &Device::Cpu,
    )?;
    Ok((features, boxes))
}

#[test]
fn encoder_model_produces_hidden_states() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = VlT5EncoderModel::load(vb, &tiny_config())?;
    let input = Tensor::new(&[[1u32, 2, 3], [4, 5, 9]], &Device::Cpu)?;
    let out = model.forward(&input, None, None)?;
    assert_eq!(out.dims(), [2, 3, 8]);
    Ok(())
}

#[test]
fn joint_encoder_appends_visual_tokens() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let (features, boxes) = region_fixtures()?;
    let visual = VisualFeatures::new(&features, &boxes);
    let out = model.encode(&input, None, Some(&visual))?;
    // 3 text tokens + 2 regions x (appearance, position) tokens.
    assert_eq!(out.dims(), [1, 7, 8]);
    Ok(())
}

#[test]
fn mismatched_feature_width_fails_loudly() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let features = Tensor::zeros((1, 2, 5), DType::F32, &Device::Cpu)?;
    let boxes = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu)?;
    let visual = VisualFeatures::new(&features, &boxes);
    assert!(model.encode(&input, None, Some(&visual)).is_err());
    Ok(())
}

#[test]
fn greedy_generation_is_deterministic() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let gen_cfg = GenerationConfig {
        max_length: 5,
        ..Default::default()
    };
    let first = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    assert_eq!(first.len(), 1);
    assert!(first[0].len() <= 5);
    assert_eq!(first[0][0], 0, "output must start with the decoder start token");
    // Once the end token is emitted, everything after it is padding.
    let mut ended = false;
    for &t in &first[0][1..] {
        if ended {
            assert_eq!(t, 9);
        }
        if t == 9 {
            ended = true;
        }
    }
    let second = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn cached_generation_matches_full_recompute() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3], [2, 7, 9]], &Device::Cpu)?;
    let cached = GenerationConfig {
        max_length: 6,
        ..Default::default()
    };
    let uncached = GenerationConfig {
        use_cache: false,
        ..cached.clone()
    };
    let with_cache = model.generate(&input, None, None, &cached)?.to_vec2::<u32>()?;
    let without_cache = model
        .generate(&input, None, None, &uncached)?
        .to_vec2::<u32>()?;
    assert_eq!(with_cache, without_cache);
    Ok(())
}

#[test]
fn decode_step_logits_match_full_pass() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let encoder_output = model.encode(&input, None, None)?;
    let decoder_ids = Tensor::new(&[[0u32, 4, 7]], &Device::Cpu)?;
    let full = model.decode(&decoder_ids, &encoder_output, None, None)?;
    let full_last = full.narrow(1, 2, 1)?.flatten_all()?.to_vec1::<f32>()?;

    let mut cache = model.new_cache();
    let mut step_logits = Vec::new();
    for &t in [0u32, 4, 7].iter() {
        let step = Tensor::new(&[[t]], &Device::Cpu)?;
        let logits = model.decode(&step, &encoder_output, None, Some(&mut cache))?;
        step_logits = logits.flatten_all()?.to_vec1::<f32>()?;
    }
    assert_eq!(full_last.len(), step_logits.len());
    for (a, b) in full_last.iter().zip(step_logits.iter()) {
        assert!((a - b).abs() < 1e-4, "cached {b} differs from full {a}");
    }
    Ok(())
}

#[test]
fn banned_vocabulary_forces_immediate_end() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let gen_cfg = GenerationConfig {
        max_length: 8,
        bad_words_ids: (0u32..=8).map(|t| vec![t]).collect(),
        ..Default::default()
    };
    let out = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    assert_eq!(out, vec![vec![0, 9]]);
    Ok(())
}

#[test]
fn min_length_defers_the_end_token() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let gen_cfg = GenerationConfig {
        max_length: 5,
        min_length: 3,
        bad_words_ids: (1u32..=8).map(|t| vec![t]).collect(),
        ..Default::default()
    };
    let out = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    // Only 0 and the end token 9 are available; 9 is masked before the
    // minimum length is reached.
    assert_eq!(out[0][1], 0);
    assert_eq!(out[0][2], 0);
    Ok(())
}

#[test]
fn ngram_ban_prevents_repeats() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[5u32, 2, 8]], &Device::Cpu)?;
    let gen_cfg = GenerationConfig {
        max_length: 6,
        no_repeat_ngram_size: 1,
        ..Default::default()
    };
    let out = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    let mut seen = std::collections::HashSet::new();
    for &t in out[0].iter() {
        if t == 9 {
            break;
        }
        assert!(seen.insert(t), "token {t} repeated despite the 1-gram ban");
    }
    Ok(())
}

#[test]
fn beam_search_returns_ranked_hypotheses() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let gen_cfg = GenerationConfig {
        max_length: 5,
        num_beams: 2,
        num_return_sequences: 2,
        ..Default::default()
    };
    let out = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    assert_eq!(out.len(), 2);
    for row in out.iter() {
        assert!(row.len() <= 5);
        assert_eq!(row[0], 0);
    }
    Ok(())
}

#[test]
fn beam_search_cache_matches_full_recompute() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3], [4, 4, 2]], &Device::Cpu)?;
    let cached = GenerationConfig {
        max_length: 6,
        num_beams: 3,
        ..Default::default()
    };
    let uncached = GenerationConfig {
        use_cache: false,
        ..cached.clone()
    };
    let with_cache = model.generate(&input, None, None, &cached)?.to_vec2::<u32>()?;
    let without_cache = model
        .generate(&input, None, None, &uncached)?
        .to_vec2::<u32>()?;
    assert_eq!(with_cache, without_cache);
    Ok(())
}

#[test]
fn visual_inputs_flow_through_generation() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let (features, boxes) = region_fixtures()?;
    let visual = VisualFeatures::new(&features, &boxes);
    let gen_cfg = GenerationConfig {
        max_length: 4,
        ..Default::default()
    };
    let out = model
        .generate(&input, None, Some(&visual), &gen_cfg)?
        .to_vec2::<u32>()?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0][0], 0);
    Ok(())
}

#[test]
fn sampled_generation_is_reproducible_and_expands_returns() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let gen_cfg = GenerationConfig {
        max_length: 5,
        do_sample: true,
        num_return_sequences: 2,
        top_k: 0,
        seed: 7,
        ..Default::default()
    };
    let first = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    assert_eq!(first.len(), 2);
    let second = model.generate(&input, None, None, &gen_cfg)?.to_vec2::<u32>()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn pruned_encoder_heads_still_encode() -> Result<()> {
    let mut model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let before = model.encode(&input, None, None)?;
    let heads = std::collections::HashMap::from([(0usize, vec![0usize])]);
    model.prune_heads(&heads)?;
    let after = model.encode(&input, None, None)?;
    assert_eq!(before.dims(), after.dims());
    let diff = (before - after)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert!(diff > 1e-6, "pruning a head changed nothing");
    Ok(())
}

#[test]
fn shift_right_prepends_the_start_token() -> Result<()> {
    let model = tiny_model()?;
    let labels = Tensor::new(&[[3u32, 4, 9]], &Device::Cpu)?;
    let shifted = model.shift_right(&labels)?.to_vec2::<u32>()?;
    assert_eq!(shifted, vec![vec![0, 3, 4]]);
    Ok(())
}

#[test]
fn teacher_forced_loss_is_a_finite_scalar() -> Result<()> {
    let model = tiny_model()?;
    let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let labels = Tensor::new(&[[4u32, 5, 9]], &Device::Cpu)?;
    let loss = model.loss(&input, None, None, &labels)?;
    assert_eq!(loss.rank(), 0);
    let loss = loss.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss > 0.);
    Ok(())
}

#[test]
fn config_parses_hf_style_json() -> Result<()> {
    let json = r#"{
        "vocab_size": 32128,
        "d_model": 512,
        "d_kv": 64,
        "d_ff": 2048,
        "num_layers": 6,
        "num_heads": 8,
        "relative_attention_num_buckets": 32,
        "dropout_rate": 0.1,
        "layer_norm_epsilon": 1e-6,
        "pad_token_id": 0,
        "eos_token_id": 1,
        "decoder_start_token_id": 0
    }"#;
    let cfg: Config = serde_json::from_str(json).map_err(candle::Error::wrap)?;
    assert_eq!(cfg.relative_attention_max_distance, 128);
    assert!(cfg.use_cache);
    assert_eq!(cfg.feat_dim, 2048);
    assert_eq!(cfg.pad_token_id, Some(0));
    Ok(())
}

#[test]
fn decoding_parameters_are_validated_up_front() {
    let bad = [
        GenerationConfig {
            max_length: 0,
            ..Default::default()
        },
        GenerationConfig {
            num_beams: 0,
            ..Default::default()
        },
        GenerationConfig {
            temperature: 0.,
            ..Default::default()
        },
        GenerationConfig {
            top_p: 1.5,
            ..Default::default()
        },
        GenerationConfig {
            repetition_penalty: 0.5,
            ..Default::default()
        },
        GenerationConfig {
            bad_words_ids: vec![vec![]],
            ..Default::default()
        },
        GenerationConfig {
            num_return_sequences: 2,
            ..Default::default()
        },
        GenerationConfig {
            num_beams: 2,
            num_return_sequences: 3,
            ..Default::default()
        },
    ];
    for cfg in bad {
        assert!(cfg.validate().is_err(), "{cfg:?} should not validate");
    }
    assert!(GenerationConfig::default().validate().is_ok());
}
