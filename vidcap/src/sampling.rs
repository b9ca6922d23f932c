//! Random draws used while decoding: multinomial token sampling and the per-item coin flips of
//! scheduled sampling.
use candle::{Result, Tensor};
use candle_transformers::generation::LogitsProcessor;
use rand::{Rng, SeedableRng};

pub struct Sampler {
    logits_processor: LogitsProcessor,
    // Training draws ignore the temperature.
    unscaled: LogitsProcessor,
    rng: rand::rngs::StdRng,
}

fn draw(processor: &mut LogitsProcessor, logprobs: &Tensor) -> Result<Tensor> {
    let logprobs = logprobs.detach();
    let b_sz = logprobs.dim(0)?;
    let mut tokens = Vec::with_capacity(b_sz);
    for i in 0..b_sz {
        tokens.push(processor.sample(&logprobs.get(i)?)?)
    }
    Tensor::from_vec(tokens, b_sz, logprobs.device())
}

impl Sampler {
    /// A sampler drawing tokens from `exp(logprobs / temperature)`.
    pub fn new(seed: u64, temperature: f64) -> Self {
        Self {
            logits_processor: LogitsProcessor::new(seed, Some(temperature), None),
            unscaled: LogitsProcessor::new(seed.wrapping_add(2), Some(1.0), None),
            rng: rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(1)),
        }
    }

    /// Draws one token per row of `logprobs`, a `(batch, vocab)` tensor of log-probabilities.
    ///
    /// The softmax applied by the logits processor renormalises the exponentiated values, so
    /// this is a multinomial draw over `exp(logprobs)`. Returns a `u32` tensor of shape `(batch,)`
    /// on the device of `logprobs`.
    pub fn multinomial(&mut self, logprobs: &Tensor) -> Result<Tensor> {
        draw(&mut self.logits_processor, logprobs)
    }

    /// Same as [`Sampler::multinomial`] with a temperature of one, used for the sampled inputs
    /// of scheduled sampling and mixer training.
    pub fn multinomial_unscaled(&mut self, logprobs: &Tensor) -> Result<Tensor> {
        draw(&mut self.unscaled, logprobs)
    }

    /// One Bernoulli(p) decision per batch item.
    pub fn bernoulli(&mut self, b_sz: usize, p: f64) -> Vec<bool> {
        (0..b_sz).map(|_| self.rng.gen::<f64>() < p).collect()
    }
}
