//! Recurrent caption decoder conditioned on pooled video features.
//!
//! Three variants share the same decoder loop: `standard` feeds the features as the first input
//! of the recurrent core, `concat` concatenates them with every token embedding and `manet`
//! additionally re-weights the modalities with modal attention before each step.
use candle::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Dropout, Embedding, Init, Linear, VarBuilder};

use crate::beam::{BeamSearch, DoneBeams};
use crate::config::{Config, ModelType, EOS_TOKEN};
use crate::features::{FeatExpander, FeatPool, ModalAttention};
use crate::rnn::{recurrent_core, HiddenState, RecurrentCore};
use crate::sampling::Sampler;
use crate::Error;

/// Result of a training pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Log-probabilities predicted at each step, `(batch, steps, vocab)`.
    pub logprobs: Tensor,
    /// Tokens consumed from position 1 onwards, `(batch, consumed)`. These are the ground
    /// truth tokens unless scheduled sampling or mixer training replaced them.
    pub seq: Tensor,
    /// Log-probability of each consumed token under the previous step distribution.
    pub seq_logprobs: Tensor,
}

impl ForwardOutput {
    /// Number of steps actually run, shorter than the target when every sequence ended early.
    pub fn num_steps(&self) -> Result<usize> {
        self.logprobs.dim(1)
    }
}

/// Inference options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOptions {
    /// Take the arg-max at each step rather than sampling.
    pub sample_max: bool,
    pub beam_size: usize,
    pub temperature: f64,
    /// Replicate the features `train_seq_per_img` times before decoding.
    pub expand_feat: bool,
    pub seed: u64,
    /// Keep dropout active while decoding.
    pub train: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            sample_max: true,
            beam_size: 1,
            temperature: 1.0,
            expand_feat: false,
            seed: 299792458,
            train: false,
        }
    }
}

/// Generated captions. Sequences are zero padded after their eos token.
#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// `(batch, len)` u32 tokens.
    pub seq: Tensor,
    /// `(batch, len)` log-probabilities of the emitted tokens.
    pub seq_logprobs: Tensor,
    /// The finished beams of every item, only set by beam search.
    pub done_beams: Option<Vec<DoneBeams>>,
}

impl SampleOutput {
    /// Number of tokens of each sequence, counting the eos token when present.
    pub fn lengths(&self) -> Result<Vec<usize>> {
        let lengths = self
            .seq
            .to_vec2::<u32>()?
            .iter()
            .map(|row| match row.iter().position(|&t| t == EOS_TOKEN) {
                Some(p) => p + 1,
                None => row.len(),
            })
            .collect();
        Ok(lengths)
    }
}

#[derive(Debug)]
pub struct CaptionModel {
    embed: Embedding,
    logit: Linear,
    dropout: Dropout,
    feat_pool: FeatPool,
    feat_expander: FeatExpander,
    core: Box<dyn RecurrentCore>,
    manet: Option<ModalAttention>,
    cfg: Config,
    ss_prob: f64,
    mixer_from: usize,
    forward_span: tracing::Span,
    sample_span: tracing::Span,
}

impl CaptionModel {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let init = Init::Uniform { lo: -0.1, up: 0.1 };
        let embed_weight = vb.pp("embed").get_with_hints(
            (cfg.vocab_size, cfg.input_encoding_size),
            "weight",
            init,
        )?;
        let embed = Embedding::new(embed_weight, cfg.input_encoding_size);
        let vb_logit = vb.pp("logit");
        let logit_weight =
            vb_logit.get_with_hints((cfg.vocab_size, cfg.rnn_size), "weight", init)?;
        let logit_bias = vb_logit.get_with_hints(cfg.vocab_size, "bias", Init::Const(0.))?;
        let logit = Linear::new(logit_weight, Some(logit_bias));
        let feat_pool = FeatPool::new(
            &cfg.feat_dims,
            cfg.pooled_size(),
            cfg.drop_prob_lm,
            vb.pp("feat_pool"),
        )?;
        let feat_expander = FeatExpander::new(cfg.train_seq_per_img)?;
        let core = recurrent_core(cfg, vb.pp("core").pp("rnn"))?;
        let manet = match cfg.model_type {
            ModelType::Manet => Some(ModalAttention::new(
                cfg.video_encoding_size(),
                cfg.rnn_size,
                cfg.num_feats(),
                vb.pp("manet"),
            )?),
            ModelType::Standard | ModelType::Concat => None,
        };
        Ok(Self {
            embed,
            logit,
            dropout: Dropout::new(cfg.drop_prob_lm),
            feat_pool,
            feat_expander,
            core,
            manet,
            cfg: cfg.clone(),
            ss_prob: 0.,
            mixer_from: 0,
            forward_span: tracing::span!(tracing::Level::TRACE, "decoder-forward"),
            sample_span: tracing::span!(tracing::Level::TRACE, "decoder-sample"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn ss_prob(&self) -> f64 {
        self.ss_prob
    }

    /// Probability of replacing a ground truth token by a sampled one during training.
    pub fn set_ss_prob(&mut self, ss_prob: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&ss_prob) {
            Err(Error::config(format!(
                "ss_prob should be in [0, 1], got {ss_prob}"
            )))?
        }
        self.ss_prob = ss_prob;
        Ok(())
    }

    pub fn mixer_from(&self) -> usize {
        self.mixer_from
    }

    /// First position whose input is sampled from the model during training, 0 disables
    /// mixer training.
    pub fn set_mixer_from(&mut self, mixer_from: usize) {
        self.mixer_from = mixer_from
    }

    pub fn seq_per_img(&self) -> usize {
        self.feat_expander.n()
    }

    pub fn set_seq_per_img(&mut self, seq_per_img: usize) -> Result<()> {
        self.feat_expander.set_n(seq_per_img)
    }

    // Runs the core on one input. For the concat variants the running features are appended
    // to the input, with manet they are first re-weighted and the result replaces them.
    fn core_step(
        &self,
        xt: &Tensor,
        feats: &mut Tensor,
        state: &HiddenState,
        train: bool,
    ) -> Result<(Tensor, HiddenState)> {
        match self.cfg.model_type {
            ModelType::Standard => self.core.step(xt, state, train),
            ModelType::Concat | ModelType::Manet => {
                if let Some(manet) = &self.manet {
                    *feats = manet.forward(feats, &state.first_layer()?)?;
                }
                let xt = Tensor::cat(&[xt, &*feats], 1)?;
                self.core.step(&xt, state, train)
            }
        }
    }

    fn logprobs(&self, output: &Tensor) -> Result<Tensor> {
        candle_nn::ops::log_softmax(&self.logit.forward(output)?, D::Minus1)
    }

    fn bos(&self, b_sz: usize, device: &candle::Device) -> Result<Tensor> {
        Tensor::from_vec(vec![self.cfg.bos_index; b_sz], b_sz, device)
    }

    /// Teacher forced pass over the target sequences.
    ///
    /// `feats` holds one tensor per modality for the `batch` videos, `seq` has shape
    /// `(batch * seq_per_img, len)` and starts with the bos token. The sampler is only used by
    /// scheduled sampling and mixer training, which draw from `exp(logprobs)` whatever the
    /// sampler temperature.
    pub fn forward(
        &self,
        feats: &[Tensor],
        seq: &Tensor,
        sampler: &mut Sampler,
        train: bool,
    ) -> Result<ForwardOutput> {
        let _enter = self.forward_span.enter();
        let fc_feats = self.feat_pool.forward(feats, train)?;
        let mut fc_feats = self.feat_expander.forward(&fc_feats)?;
        let b_sz = fc_feats.dim(0)?;
        let (seq_b_sz, seq_len) = seq.dims2()?;
        if seq_b_sz != b_sz {
            Err(Error::shape(
                "decoder-forward",
                format!(
                    "{seq_b_sz} target sequences for {b_sz} feature rows (seq_per_img {})",
                    self.seq_per_img()
                ),
            ))?
        }
        let seq = seq.to_dtype(DType::U32)?;
        let device = fc_feats.device().clone();

        let mut state = self.core.zero_state(b_sz)?;
        let mut outputs: Vec<Tensor> = Vec::with_capacity(seq_len);
        let mut consumed = Vec::with_capacity(seq_len);
        let mut consumed_logprobs = Vec::with_capacity(seq_len);
        for t in self.cfg.start_step()..seq_len as isize - 1 {
            let xt = if t < 0 {
                fc_feats.clone()
            } else {
                let t = t as usize;
                let gt = seq.i((.., t))?.contiguous()?;
                let it = match outputs.last() {
                    Some(prev) if train && t >= 1 && self.ss_prob > 0. => {
                        let replace = sampler.bernoulli(b_sz, self.ss_prob);
                        if replace.iter().any(|&r| r) {
                            let sampled = sampler.multinomial_unscaled(prev)?.to_vec1::<u32>()?;
                            let mut it = gt.to_vec1::<u32>()?;
                            for (i, &r) in replace.iter().enumerate() {
                                if r {
                                    it[i] = sampled[i]
                                }
                            }
                            Tensor::from_vec(it, b_sz, &device)?
                        } else {
                            gt
                        }
                    }
                    Some(prev) if train && self.mixer_from > 0 && t >= self.mixer_from => {
                        sampler.multinomial_unscaled(prev)?
                    }
                    _ => gt,
                };
                if let Some(prev) = outputs.last().filter(|_| t >= 1) {
                    let lp = prev.gather(&it.unsqueeze(1)?, 1)?.squeeze(1)?;
                    consumed_logprobs.push(lp);
                    consumed.push(it.clone());
                }
                if it.max(0)?.to_scalar::<u32>()? == EOS_TOKEN {
                    tracing::debug!(step = t, "every target sequence ended");
                    break;
                }
                self.embed.forward(&it)?
            };
            let (output, next_state) = self.core_step(&xt, &mut fc_feats, &state, train)?;
            state = next_state;
            if t >= 0 {
                let output = self.dropout.forward(&output, train)?;
                outputs.push(self.logprobs(&output)?)
            }
        }
        if outputs.is_empty() {
            Err(Error::invariant(
                "decoder-forward",
                format!("a target of length {seq_len} leaves no step to predict"),
            ))?
        }
        let logprobs = Tensor::stack(&outputs, 1)?;
        let (seq, seq_logprobs) = if consumed.is_empty() {
            (
                Tensor::zeros((b_sz, 0), DType::U32, &device)?,
                Tensor::zeros((b_sz, 0), logprobs.dtype(), &device)?,
            )
        } else {
            (
                Tensor::stack(&consumed, 1)?,
                Tensor::stack(&consumed_logprobs, 1)?,
            )
        };
        Ok(ForwardOutput {
            logprobs,
            seq,
            seq_logprobs,
        })
    }

    /// Generates captions, at most `seq_length - 2` tokens each.
    ///
    /// Beam sizes above one are handled by [`Self::sample_beam`].
    pub fn sample(&self, feats: &[Tensor], opts: &SampleOptions) -> Result<SampleOutput> {
        if opts.beam_size == 0 {
            Err(Error::config("beam_size should be positive"))?
        }
        if opts.beam_size > 1 {
            return self.sample_beam(feats, opts);
        }
        let _enter = self.sample_span.enter();
        let mut fc_feats = self.pooled_features(feats, opts)?;
        let b_sz = fc_feats.dim(0)?;
        let device = fc_feats.device().clone();
        let mut sampler = match opts.sample_max {
            true => None,
            false => Some(Sampler::new(opts.seed, opts.temperature)),
        };

        let mut state = self.core.zero_state(b_sz)?;
        let mut unfinished = vec![true; b_sz];
        let mut seq = Vec::with_capacity(self.cfg.seq_length);
        let mut seq_logprobs = Vec::with_capacity(self.cfg.seq_length);
        let mut logprobs: Option<Tensor> = None;
        for t in self.cfg.start_step()..self.cfg.seq_length as isize - 1 {
            let xt = match (t, logprobs.as_ref()) {
                (t, _) if t < 0 => fc_feats.clone(),
                (0, _) => self.embed.forward(&self.bos(b_sz, &device)?)?,
                (_, None) => Err(Error::invariant(
                    "decoder-sample",
                    format!("no distribution available at step {t}"),
                ))?,
                (_, Some(prev)) => {
                    let (it, lp) = match sampler.as_mut() {
                        None => {
                            let prev = prev.detach();
                            (prev.argmax(D::Minus1)?, prev.max(D::Minus1)?)
                        }
                        Some(sampler) => {
                            let it = sampler.multinomial(prev)?;
                            let lp = prev.gather(&it.unsqueeze(1)?, 1)?.squeeze(1)?;
                            (it, lp)
                        }
                    };
                    let xt = self.embed.forward(&it)?;
                    let mut tokens = it.to_vec1::<u32>()?;
                    for (token, unfinished) in tokens.iter_mut().zip(unfinished.iter_mut()) {
                        *unfinished &= *token != EOS_TOKEN;
                        if !*unfinished {
                            *token = EOS_TOKEN
                        }
                    }
                    seq.push(Tensor::from_vec(tokens, b_sz, &device)?);
                    seq_logprobs.push(lp);
                    if unfinished.iter().all(|u| !u) {
                        tracing::debug!(step = t, "every sequence is finished");
                        break;
                    }
                    xt
                }
            };
            let (output, next_state) = self.core_step(&xt, &mut fc_feats, &state, opts.train)?;
            state = next_state;
            if t >= 0 {
                logprobs = Some(self.logprobs(&output)?)
            }
        }
        let (seq, seq_logprobs) = if seq.is_empty() {
            (
                Tensor::zeros((b_sz, 0), DType::U32, &device)?,
                Tensor::zeros((b_sz, 0), fc_feats.dtype(), &device)?,
            )
        } else {
            (Tensor::stack(&seq, 1)?, Tensor::stack(&seq_logprobs, 1)?)
        };
        Ok(SampleOutput {
            seq,
            seq_logprobs,
            done_beams: None,
        })
    }

    fn pooled_features(&self, feats: &[Tensor], opts: &SampleOptions) -> Result<Tensor> {
        let fc_feats = self.feat_pool.forward(feats, opts.train)?;
        if opts.expand_feat {
            self.feat_expander.forward(&fc_feats)
        } else {
            Ok(fc_feats)
        }
    }

    /// Beam search decoding, every batch item is searched on its own.
    ///
    /// The returned sequences are the lowest perplexity beams, right padded with zeros to the
    /// longest one. All the finished beams are available in `done_beams`.
    pub fn sample_beam(&self, feats: &[Tensor], opts: &SampleOptions) -> Result<SampleOutput> {
        let span = tracing::span!(tracing::Level::TRACE, "beam-search", size = opts.beam_size);
        let _enter = span.enter();
        let fc_feats = self.pooled_features(feats, opts)?;
        let b_sz = fc_feats.dim(0)?;
        let device = fc_feats.device().clone();

        let mut done_beams = Vec::with_capacity(b_sz);
        for k in 0..b_sz {
            let mut search = BeamSearch::new(opts.beam_size, self.cfg.seq_length)?;
            let mut feats_k = fc_feats.narrow(0, k, 1)?;
            let mut state = self.core.zero_state(1)?;
            if self.cfg.start_step() < 0 {
                let xt = feats_k.clone();
                (_, state) = self.core_step(&xt, &mut feats_k, &state, opts.train)?;
            }
            let xt = self.embed.forward(&self.bos(1, &device)?)?;
            let (output, next_state) = self.core_step(&xt, &mut feats_k, &state, opts.train)?;
            state = next_state;
            let mut logprobs = self.logprobs(&output)?;
            for position in 1..=search.last_position() {
                let rows = logprobs.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                let forks = search.step(position, &rows)?;
                if search.is_finished() {
                    break;
                }
                let parents = forks.iter().map(|f| f.parent as u32).collect::<Vec<_>>();
                let tokens = forks.iter().map(|f| f.token).collect::<Vec<_>>();
                let parents = Tensor::from_vec(parents, forks.len(), &device)?;
                let tokens = Tensor::from_vec(tokens, forks.len(), &device)?;
                state = state.fork(&parents)?;
                feats_k = feats_k.index_select(&parents, 0)?;
                let xt = self.embed.forward(&tokens)?;
                let (output, next_state) =
                    self.core_step(&xt, &mut feats_k, &state, opts.train)?;
                state = next_state;
                logprobs = self.logprobs(&output)?;
            }
            done_beams.push(search.finish()?)
        }

        let mut best = Vec::with_capacity(b_sz);
        for done in done_beams.iter() {
            best.push(done.best()?)
        }
        let len = best.iter().map(|b| b.tokens.len()).max().unwrap_or(0);
        let mut seq = vec![EOS_TOKEN; b_sz * len];
        let mut seq_logprobs = vec![0f32; b_sz * len];
        for (k, beam) in best.iter().enumerate() {
            let n = beam.tokens.len();
            seq[k * len..k * len + n].copy_from_slice(&beam.tokens);
            seq_logprobs[k * len..k * len + n].copy_from_slice(&beam.logprobs);
        }
        Ok(SampleOutput {
            seq: Tensor::from_vec(seq, (b_sz, len), &device)?,
            seq_logprobs: Tensor::from_vec(seq_logprobs, (b_sz, len), &device)?,
            done_beams: Some(done_beams),
        })
    }
}
