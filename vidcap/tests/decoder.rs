#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::test_utils::to_vec2_round;
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use vidcap::loss::masked_cross_entropy;
use vidcap::{CaptionModel, Config, ModelType, RnnType, SampleOptions, Sampler};

const FEAT_DIMS: [usize; 2] = [6, 4];

fn config(model_type: ModelType, rnn_type: RnnType) -> Config {
    let (rnn_size, num_layers) = (8, 2);
    let video_encoding_size = FEAT_DIMS.len() * rnn_size * num_layers;
    Config {
        vocab_size: 10,
        input_encoding_size: match model_type {
            ModelType::Standard => video_encoding_size,
            ModelType::Concat | ModelType::Manet => 5,
        },
        rnn_type,
        rnn_size,
        num_layers,
        drop_prob_lm: 0.0,
        seq_length: 6,
        feat_dims: FEAT_DIMS.to_vec(),
        model_type,
        train_seq_per_img: 1,
        bos_index: 1,
    }
}

fn all_configs() -> Vec<Config> {
    let mut configs = vec![];
    for model_type in [ModelType::Standard, ModelType::Concat, ModelType::Manet] {
        for rnn_type in [RnnType::Lstm, RnnType::Gru, RnnType::Rnn] {
            configs.push(config(model_type, rnn_type))
        }
    }
    configs
}

fn build_model(cfg: &Config) -> Result<(CaptionModel, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = CaptionModel::new(cfg, vb)?;
    Ok((model, varmap))
}

fn feats(b_sz: usize) -> Result<Vec<Tensor>> {
    let feats = FEAT_DIMS
        .iter()
        .map(|&dim| Tensor::randn(0f32, 1f32, (b_sz, 1, dim), &Device::Cpu))
        .collect::<candle::Result<Vec<_>>>()?;
    Ok(feats)
}

#[test]
fn forward_shapes() -> Result<()> {
    let seq = Tensor::new(&[[1u32, 4, 5, 6, 7, 0], [1, 2, 3, 0, 0, 0]], &Device::Cpu)?;
    for cfg in all_configs() {
        let (model, _varmap) = build_model(&cfg)?;
        let mut sampler = Sampler::new(42, 1.0);
        let out = model.forward(&feats(2)?, &seq, &mut sampler, true)?;
        assert_eq!(out.logprobs.dims(), &[2, 5, 10], "{cfg:?}");
        assert_eq!(out.seq.dims(), &[2, 4]);
        assert_eq!(out.seq_logprobs.dims(), &[2, 4]);
        assert_eq!(out.seq.to_vec2::<u32>()?, [[4, 5, 6, 7], [2, 3, 0, 0]]);
        // Each step is a normalised distribution.
        let total = out.logprobs.exp()?.sum(2)?;
        let ones = Tensor::ones((2, 5), DType::F32, &Device::Cpu)?;
        assert_eq!(to_vec2_round(&total, 4)?, to_vec2_round(&ones, 4)?);
    }
    Ok(())
}

#[test]
fn consumed_logprobs_come_from_the_previous_step() -> Result<()> {
    let (model, _varmap) = build_model(&config(ModelType::Concat, RnnType::Lstm))?;
    let seq = Tensor::new(&[[1u32, 4, 5, 6, 0, 0]], &Device::Cpu)?;
    let out = model.forward(&feats(1)?, &seq, &mut Sampler::new(0, 1.0), false)?;
    let logprobs = out.logprobs.to_vec3::<f32>()?;
    let seq_logprobs = out.seq_logprobs.to_vec2::<f32>()?;
    for (t, &token) in [4usize, 5, 6, 0].iter().enumerate() {
        assert_eq!(seq_logprobs[0][t], logprobs[0][t][token]);
    }
    Ok(())
}

#[test]
fn early_exit_when_every_target_ended() -> Result<()> {
    let seq = Tensor::new(&[[1u32, 4, 0, 0, 0, 0], [1, 5, 6, 0, 0, 0]], &Device::Cpu)?;
    for model_type in [ModelType::Standard, ModelType::Concat, ModelType::Manet] {
        let (model, _varmap) = build_model(&config(model_type, RnnType::Gru))?;
        let out = model.forward(&feats(2)?, &seq, &mut Sampler::new(0, 1.0), false)?;
        // Position 3 only holds zeros, the steps 0, 1 and 2 remain.
        assert_eq!(out.num_steps()?, 3);
        assert_eq!(out.seq.to_vec2::<u32>()?, [[4, 0, 0], [5, 6, 0]]);
        assert_eq!(out.seq_logprobs.dims(), &[2, 3]);
    }
    Ok(())
}

#[test]
fn zero_scheduled_sampling_is_teacher_forcing() -> Result<()> {
    let seq = Tensor::new(&[[1u32, 4, 5, 6, 7, 0], [1, 2, 3, 9, 0, 0]], &Device::Cpu)?;
    let feats = feats(2)?;
    let (mut model, _varmap) = build_model(&config(ModelType::Manet, RnnType::Lstm))?;
    let reference = model.forward(&feats, &seq, &mut Sampler::new(0, 1.0), false)?;
    model.set_ss_prob(0.0)?;
    for seed in [0, 1, 1234] {
        let out = model.forward(&feats, &seq, &mut Sampler::new(seed, 1.0), true)?;
        assert_eq!(out.seq.to_vec2::<u32>()?, reference.seq.to_vec2::<u32>()?);
        let lp = out.logprobs.flatten_to(1)?;
        let expected = reference.logprobs.flatten_to(1)?;
        assert_eq!(to_vec2_round(&lp, 5)?, to_vec2_round(&expected, 5)?);
    }
    Ok(())
}

#[test]
fn sampled_inputs_during_training() -> Result<()> {
    let seq = Tensor::new(&[[1u32, 4, 5, 6, 7, 0], [1, 2, 3, 9, 8, 0]], &Device::Cpu)?;
    let feats = feats(2)?;
    let (mut model, _varmap) = build_model(&config(ModelType::Concat, RnnType::Rnn))?;
    assert!(model.set_ss_prob(1.5).is_err());

    model.set_ss_prob(1.0)?;
    let out = model.forward(&feats, &seq, &mut Sampler::new(7, 1.0), true)?;
    // One step less is consumed, unless every sampled token was the eos token.
    let (steps, consumed) = (out.logprobs.dim(1)?, out.seq.dim(1)?);
    assert!(consumed + 1 == steps || consumed == steps);
    let tokens = out.seq.flatten_all()?.to_vec1::<u32>()?;
    assert!(tokens.iter().all(|&t| t < 10));

    model.set_ss_prob(0.0)?;
    model.set_mixer_from(3);
    assert_eq!(model.mixer_from(), 3);
    let out = model.forward(&feats, &seq, &mut Sampler::new(7, 1.0), true)?;
    // Positions 1 and 2 are still teacher forced.
    let consumed = out.seq.to_vec2::<u32>()?;
    assert_eq!(consumed[0][..2], [4, 5]);
    assert_eq!(consumed[1][..2], [2, 3]);
    // Outside of training the knobs are ignored.
    let out = model.forward(&feats, &seq, &mut Sampler::new(7, 1.0), false)?;
    assert_eq!(out.seq.to_vec2::<u32>()?, [[4, 5, 6, 7], [2, 3, 9, 8]]);
    Ok(())
}

// Pushes almost all of the predicted mass onto `token` at every step.
fn favour_token(varmap: &VarMap, token: usize) -> Result<()> {
    let mut bias = vec![0f32; 10];
    bias[token] = 50.;
    let data = varmap.data().lock().unwrap();
    data["logit.bias"].set(&Tensor::new(bias, &Device::Cpu)?)?;
    Ok(())
}

fn assert_consistent_logprobs(out: &vidcap::ForwardOutput) -> Result<()> {
    let logprobs = out.logprobs.to_vec3::<f32>()?;
    let seq = out.seq.to_vec2::<u32>()?;
    let seq_logprobs = out.seq_logprobs.to_vec2::<f32>()?;
    for (b, row) in seq.iter().enumerate() {
        for (j, &token) in row.iter().enumerate() {
            assert_eq!(seq_logprobs[b][j], logprobs[b][j][token as usize]);
        }
    }
    Ok(())
}

#[test]
fn sampled_inputs_follow_the_predicted_distribution() -> Result<()> {
    let seq = Tensor::new(&[[1u32, 4, 5, 6, 7, 0], [1, 2, 3, 9, 8, 0]], &Device::Cpu)?;
    for model_type in [ModelType::Standard, ModelType::Concat, ModelType::Manet] {
        let feats = feats(2)?;
        let (mut model, varmap) = build_model(&config(model_type, RnnType::Lstm))?;
        favour_token(&varmap, 7)?;

        model.set_ss_prob(1.0)?;
        let out = model.forward(&feats, &seq, &mut Sampler::new(3, 1.0), true)?;
        assert_eq!(out.seq.to_vec2::<u32>()?, [[7, 7, 7, 7], [7, 7, 7, 7]]);
        assert_consistent_logprobs(&out)?;

        model.set_ss_prob(0.0)?;
        model.set_mixer_from(3);
        let out = model.forward(&feats, &seq, &mut Sampler::new(3, 1.0), true)?;
        assert_eq!(out.seq.to_vec2::<u32>()?, [[4, 5, 7, 7], [2, 3, 7, 7]]);
        assert_consistent_logprobs(&out)?;
    }
    Ok(())
}

#[test]
fn forward_logprobs_feed_the_cross_entropy() -> Result<()> {
    let seq = Tensor::new(&[[1u32, 4, 5, 6, 7, 0], [1, 2, 3, 0, 0, 0]], &Device::Cpu)?;
    for model_type in [ModelType::Standard, ModelType::Concat, ModelType::Manet] {
        let (model, _varmap) = build_model(&config(model_type, RnnType::Gru))?;
        let out = model.forward(&feats(2)?, &seq, &mut Sampler::new(0, 1.0), false)?;
        assert_eq!(out.num_steps()?, 5);

        // The targets are the tokens after bos, the mask keeps the words and the first eos.
        let target = seq.narrow(1, 1, 5)?;
        let mask = Tensor::new(
            &[[1f32, 1., 1., 1., 1., 0.], [1., 1., 1., 0., 0., 0.]],
            &Device::Cpu,
        )?;
        let loss = masked_cross_entropy(&out.logprobs, &target, &mask)?.to_scalar::<f32>()?;

        let logprobs = out.logprobs.to_vec3::<f32>()?;
        let target = target.to_vec2::<u32>()?;
        let mask = mask.to_vec2::<f32>()?;
        let (mut total, mut count) = (0f32, 0f32);
        for b in 0..2 {
            for t in 0..5 {
                total -= mask[b][t] * logprobs[b][t][target[b][t] as usize];
                count += mask[b][t];
            }
        }
        assert_eq!(count, 8.);
        assert!((loss - total / count).abs() < 1e-5, "{loss} {}", total / count);
    }
    Ok(())
}

#[test]
fn forward_replicates_features() -> Result<()> {
    let (mut model, _varmap) = build_model(&config(ModelType::Concat, RnnType::Lstm))?;
    let seq = Tensor::new(&[[1u32, 4, 5, 0, 0, 0], [1, 4, 5, 0, 0, 0]], &Device::Cpu)?;
    let feats = feats(1)?;
    assert!(model
        .forward(&feats, &seq, &mut Sampler::new(0, 1.0), false)
        .is_err());
    model.set_seq_per_img(2)?;
    assert_eq!(model.seq_per_img(), 2);
    let out = model.forward(&feats, &seq, &mut Sampler::new(0, 1.0), false)?;
    // Identical targets on replicated features give identical predictions.
    let lp0 = out.logprobs.get(0)?;
    let lp1 = out.logprobs.get(1)?;
    assert_eq!(to_vec2_round(&lp0, 5)?, to_vec2_round(&lp1, 5)?);
    Ok(())
}

#[test]
fn greedy_sampling() -> Result<()> {
    for cfg in all_configs() {
        let (model, _varmap) = build_model(&cfg)?;
        let out = model.sample(&feats(3)?, &SampleOptions::default())?;
        let (b_sz, len) = out.seq.dims2()?;
        assert_eq!(b_sz, 3);
        assert!(len <= cfg.seq_length - 2);
        assert_eq!(out.seq_logprobs.dims(), out.seq.dims());
        assert!(out.done_beams.is_none());
        for row in out.seq.to_vec2::<u32>()? {
            if let Some(p) = row.iter().position(|&t| t == 0) {
                assert!(row[p..].iter().all(|&t| t == 0), "{row:?}");
            }
        }
    }
    Ok(())
}

#[test]
fn temperature_sampling_is_seeded() -> Result<()> {
    let (model, _varmap) = build_model(&config(ModelType::Manet, RnnType::Gru))?;
    let feats = feats(4)?;
    let opts = SampleOptions {
        sample_max: false,
        temperature: 0.7,
        seed: 17,
        ..Default::default()
    };
    let a = model.sample(&feats, &opts)?;
    let b = model.sample(&feats, &opts)?;
    assert_eq!(a.seq.to_vec2::<u32>()?, b.seq.to_vec2::<u32>()?);
    assert_eq!(a.lengths()?, b.lengths()?);

    let expanded = SampleOptions {
        expand_feat: true,
        ..opts
    };
    let mut cfg = config(ModelType::Manet, RnnType::Gru);
    cfg.train_seq_per_img = 2;
    let (model, _varmap) = build_model(&cfg)?;
    let out = model.sample(&feats, &expanded)?;
    assert_eq!(out.seq.dim(0)?, 8);
    Ok(())
}

#[test]
fn beam_of_one_is_greedy() -> Result<()> {
    for model_type in [ModelType::Standard, ModelType::Concat, ModelType::Manet] {
        let mut cfg = config(model_type, RnnType::Lstm);
        cfg.seq_length = 4;
        let (model, _varmap) = build_model(&cfg)?;
        let feats = feats(1)?;
        let greedy = model.sample(&feats, &SampleOptions::default())?;
        let opts = SampleOptions {
            beam_size: 1,
            ..Default::default()
        };
        let beam = model.sample_beam(&feats, &opts)?;
        assert_eq!(
            beam.seq.to_vec2::<u32>()?,
            greedy.seq.to_vec2::<u32>()?,
            "{model_type:?}"
        );
        assert_eq!(
            to_vec2_round(&beam.seq_logprobs, 4)?,
            to_vec2_round(&greedy.seq_logprobs, 4)?
        );
    }
    Ok(())
}

#[test]
fn beam_search_returns_the_best_done_beam() -> Result<()> {
    for cfg in all_configs() {
        let (model, _varmap) = build_model(&cfg)?;
        let opts = SampleOptions {
            beam_size: 3,
            ..Default::default()
        };
        let out = model.sample(&feats(2)?, &opts)?;
        let done_beams = out.done_beams.as_ref().expect("beam search sets done_beams");
        assert_eq!(done_beams.len(), 2);
        let seq = out.seq.to_vec2::<u32>()?;
        let len = seq[0].len();
        for (k, done) in done_beams.iter().enumerate() {
            assert!(!done.is_empty());
            let best = done.best()?;
            for beam in done.beams() {
                assert!(best.perplexity <= beam.perplexity);
                assert!(beam.tokens.len() <= cfg.seq_length - 2);
            }
            assert_eq!(seq[k][..best.tokens.len()], best.tokens[..]);
            assert!(seq[k][best.tokens.len()..].iter().all(|&t| t == 0));
            assert!(best.tokens.len() <= len);
        }
    }
    Ok(())
}

#[test]
fn invalid_options() -> Result<()> {
    let (model, _varmap) = build_model(&config(ModelType::Concat, RnnType::Lstm))?;
    let opts = SampleOptions {
        beam_size: 0,
        ..Default::default()
    };
    assert!(model.sample(&feats(1)?, &opts).is_err());
    assert!(model.sample(&feats(1)?[..1], &SampleOptions::default()).is_err());
    Ok(())
}
