#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use candle::test_utils::to_vec2_round;
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use vidcap::{CaptionModel, Config, SampleOptions};

fn config() -> Result<Config> {
    let cfg = serde_json::from_str(
        r#"{
            "vocab_size": 12,
            "input_encoding_size": 6,
            "rnn_type": "lstm",
            "rnn_size": 5,
            "num_layers": 2,
            "drop_prob_lm": 0.5,
            "seq_length": 7,
            "feat_dims": [4, 3],
            "model_type": "manet"
        }"#,
    )?;
    Ok(cfg)
}

#[test]
fn parameter_names() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let _model = CaptionModel::new(&config()?, vb)?;
    let data = varmap.data().lock().unwrap();
    let mut names = data.keys().cloned().collect::<Vec<_>>();
    names.sort();
    assert_eq!(
        names,
        [
            "core.rnn.weight_hh_l0",
            "core.rnn.weight_hh_l1",
            "core.rnn.weight_ih_l0",
            "core.rnn.weight_ih_l1",
            "embed.weight",
            "feat_pool.feat_list.0.0.bias",
            "feat_pool.feat_list.0.0.weight",
            "feat_pool.feat_list.1.0.bias",
            "feat_pool.feat_list.1.0.weight",
            "logit.bias",
            "logit.weight",
            "manet.align_m.bias",
            "manet.align_m.weight",
            "manet.f_feat_m.bias",
            "manet.f_feat_m.weight",
            "manet.f_h_m.bias",
            "manet.f_h_m.weight",
        ]
    );
    // The first layer consumes the token embedding and the 2 * 2 * 5 pooled features.
    assert_eq!(data["core.rnn.weight_ih_l0"].dims(), &[20, 26]);
    assert_eq!(data["core.rnn.weight_ih_l1"].dims(), &[20, 5]);
    Ok(())
}

#[test]
fn save_and_load_round_trip() -> Result<()> {
    let cpu = &Device::Cpu;
    let cfg = config()?;
    let path = std::env::temp_dir().join(format!("vidcap-{}.safetensors", std::process::id()));

    let varmap = VarMap::new();
    let model = CaptionModel::new(&cfg, VarBuilder::from_varmap(&varmap, DType::F32, cpu))?;
    varmap.save(&path)?;

    let mut loaded_map = VarMap::new();
    let loaded = CaptionModel::new(&cfg, VarBuilder::from_varmap(&loaded_map, DType::F32, cpu))?;
    loaded_map.load(&path)?;
    std::fs::remove_file(&path)?;

    let feats = [
        Tensor::randn(0f32, 1f32, (2, 1, 4), cpu)?,
        Tensor::randn(0f32, 1f32, (2, 1, 3), cpu)?,
    ];
    let opts = SampleOptions {
        beam_size: 2,
        ..Default::default()
    };
    let a = model.sample(&feats, &opts)?;
    let b = loaded.sample(&feats, &opts)?;
    assert_eq!(a.seq.to_vec2::<u32>()?, b.seq.to_vec2::<u32>()?);
    assert_eq!(
        to_vec2_round(&a.seq_logprobs, 4)?,
        to_vec2_round(&b.seq_logprobs, 4)?
    );
    Ok(())
}
