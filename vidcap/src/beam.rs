//! Beam search bookkeeping for a single video.
//!
//! The search only manipulates token ids and log-probabilities, the caller owns the recurrent
//! states and re-orders them after each step using the returned [`Fork`]s.
use candle::Result;

use crate::config::EOS_TOKEN;
use crate::Error;

/// Perplexity assigned to beams finishing after a single token, these sort after every beam
/// with a computed perplexity.
pub const DEGENERATE_PERPLEXITY: f64 = 10_000.;

/// A hypothesis, either still being expanded or finished.
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    pub tokens: Vec<u32>,
    /// Log-probability of each token when it was appended.
    pub logprobs: Vec<f32>,
    pub logprob_sum: f32,
    /// Only meaningful once the beam is finished.
    pub perplexity: f64,
}

impl Beam {
    fn root() -> Self {
        Self {
            tokens: vec![],
            logprobs: vec![],
            logprob_sum: 0.,
            perplexity: f64::INFINITY,
        }
    }

    fn extend(&self, candidate: &Candidate) -> Self {
        let mut tokens = Vec::with_capacity(self.tokens.len() + 1);
        tokens.extend_from_slice(&self.tokens);
        tokens.push(candidate.token);
        let mut logprobs = Vec::with_capacity(self.logprobs.len() + 1);
        logprobs.extend_from_slice(&self.logprobs);
        logprobs.push(candidate.logprob);
        Self {
            tokens,
            logprobs,
            logprob_sum: candidate.logprob_sum,
            perplexity: f64::INFINITY,
        }
    }

    fn finish(mut self) -> Self {
        let len = self.tokens.len();
        self.perplexity = if len > 1 {
            (-(self.logprob_sum as f64) / (len - 1) as f64).exp()
        } else {
            DEGENERATE_PERPLEXITY
        };
        self
    }
}

/// A possible continuation of an active beam.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token: u32,
    /// Row of the active beam being extended.
    pub parent: usize,
    pub logprob_sum: f32,
    pub logprob: f32,
}

/// Tells the caller that the new active beam at this position continues the state of the
/// beam at row `parent` with `token` as the next input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fork {
    pub parent: usize,
    pub token: u32,
}

/// The finished beams of one batch item.
#[derive(Debug, Clone, Default)]
pub struct DoneBeams {
    beams: Vec<Beam>,
}

impl DoneBeams {
    pub fn beams(&self) -> &[Beam] {
        &self.beams
    }

    pub fn len(&self) -> usize {
        self.beams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// The lowest perplexity beam, this is the first one once ranked.
    pub fn best(&self) -> Result<&Beam> {
        match self.beams.first() {
            Some(beam) => Ok(beam),
            None => Err(Error::invariant("beam-search", "no beam reached termination"))?,
        }
    }

    fn rank(&mut self) {
        // Stable so that ties keep their completion order.
        self.beams
            .sort_by(|a, b| a.perplexity.total_cmp(&b.perplexity))
    }
}

/// Beam search state for one batch item.
#[derive(Debug, Clone)]
pub struct BeamSearch {
    beam_size: usize,
    seq_length: usize,
    active: Vec<Beam>,
    done: DoneBeams,
}

impl BeamSearch {
    /// Starts with a single active beam that has consumed the bos token. Positions run from 1
    /// to `seq_length - 2`, every beam still active at the last position is finished there.
    pub fn new(beam_size: usize, seq_length: usize) -> Result<Self> {
        if beam_size == 0 {
            Err(Error::config("beam_size should be positive"))?
        }
        if seq_length < 3 {
            Err(Error::config(format!(
                "beam search needs seq_length >= 3, got {seq_length}"
            )))?
        }
        Ok(Self {
            beam_size,
            seq_length,
            active: vec![Beam::root()],
            done: DoneBeams::default(),
        })
    }

    pub fn last_position(&self) -> usize {
        self.seq_length - 2
    }

    pub fn active(&self) -> &[Beam] {
        &self.active
    }

    pub fn is_finished(&self) -> bool {
        self.active.is_empty()
    }

    /// Ranks the continuations of the active beams.
    ///
    /// `logprobs[q]` is the next token distribution of active beam `q`. Every beam row is
    /// sorted in descending order and its `min(beam_size, vocab)` best tokens are candidates.
    pub fn candidates(&self, logprobs: &[Vec<f32>]) -> Result<Vec<Candidate>> {
        if logprobs.len() != self.active.len() {
            Err(Error::shape(
                "beam-search",
                format!(
                    "{} distributions for {} active beams",
                    logprobs.len(),
                    self.active.len()
                ),
            ))?
        }
        let mut sorted = Vec::with_capacity(logprobs.len());
        for row in logprobs.iter() {
            let mut ix = (0..row.len()).collect::<Vec<_>>();
            ix.sort_by(|&i, &j| row[j].total_cmp(&row[i]));
            sorted.push(ix)
        }
        let cols = self.beam_size.min(logprobs.first().map_or(0, |r| r.len()));
        let mut candidates = Vec::with_capacity(cols * logprobs.len());
        for c in 0..cols {
            for (q, beam) in self.active.iter().enumerate() {
                let token = sorted[q][c];
                let logprob = logprobs[q][token];
                candidates.push(Candidate {
                    token: token as u32,
                    parent: q,
                    logprob_sum: beam.logprob_sum + logprob,
                    logprob,
                })
            }
        }
        candidates.sort_by(|a, b| b.logprob_sum.total_cmp(&a.logprob_sum));
        Ok(candidates)
    }

    /// Expands the active beams at `position` and keeps the `beam_size` best continuations.
    ///
    /// Continuations ending with the eos token, or produced at the last position, are moved to
    /// the finished set and are not expanded any further. The returned forks describe the new
    /// active beams in order.
    pub fn step(&mut self, position: usize, logprobs: &[Vec<f32>]) -> Result<Vec<Fork>> {
        if position == 0 || position > self.last_position() {
            Err(Error::shape(
                "beam-search",
                format!(
                    "position {position} outside of 1..={}",
                    self.last_position()
                ),
            ))?
        }
        let mut candidates = self.candidates(logprobs)?;
        candidates.truncate(self.beam_size);
        let mut active = Vec::with_capacity(candidates.len());
        let mut forks = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter() {
            let beam = self.active[candidate.parent].extend(candidate);
            if candidate.token == EOS_TOKEN || position == self.last_position() {
                self.done.beams.push(beam.finish())
            } else {
                forks.push(Fork {
                    parent: candidate.parent,
                    token: candidate.token,
                });
                active.push(beam)
            }
        }
        self.active = active;
        Ok(forks)
    }

    /// Ranks the finished beams by increasing perplexity.
    pub fn finish(mut self) -> Result<DoneBeams> {
        self.done.rank();
        if self.done.is_empty() {
            Err(Error::invariant(
                "beam-search",
                "the search ended without any finished beam",
            ))?
        }
        tracing::debug!(
            finished = self.done.len(),
            best_perplexity = self.done.beams[0].perplexity,
            "beam search done"
        );
        Ok(self.done)
    }
}
