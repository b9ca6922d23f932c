//! Model configuration.
//!
//! The configuration is usually stored as JSON next to the safetensors weights, the field names
//! follow the options of the training scripts that produced the checkpoints.
use serde::Deserialize;

use crate::Error;

/// Token emitted to terminate a sequence. Sequences are zero padded after it.
pub const EOS_TOKEN: u32 = 0;

/// Recurrent family used by the core, selected by name in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RnnType {
    Lstm,
    Gru,
    Rnn,
}

/// How the pooled video features are fed to the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Features are the first input of the recurrent core, before the bos token.
    Standard,
    /// Features are concatenated with every token embedding.
    Concat,
    /// As `Concat`, with the features re-weighted by modal attention at each step.
    Manet,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub input_encoding_size: usize,
    pub rnn_type: RnnType,
    pub rnn_size: usize,
    pub num_layers: usize,
    pub drop_prob_lm: f32,
    pub seq_length: usize,
    pub feat_dims: Vec<usize>,
    pub model_type: ModelType,
    #[serde(default = "default_seq_per_img")]
    pub train_seq_per_img: usize,
    #[serde(default = "default_bos_index")]
    pub bos_index: u32,
}

fn default_seq_per_img() -> usize {
    1
}

fn default_bos_index() -> u32 {
    1
}

impl Config {
    pub fn num_feats(&self) -> usize {
        self.feat_dims.len()
    }

    /// Width of the projection of a single modality, this matches the flattened hidden state.
    pub fn pooled_size(&self) -> usize {
        self.num_layers * self.rnn_size
    }

    /// Width of the pooled features once all the modalities are concatenated.
    pub fn video_encoding_size(&self) -> usize {
        self.num_feats() * self.pooled_size()
    }

    /// Width of the input vector consumed by the recurrent core at each step.
    pub fn rnn_input_size(&self) -> usize {
        match self.model_type {
            ModelType::Standard => self.input_encoding_size,
            ModelType::Concat | ModelType::Manet => {
                self.input_encoding_size + self.video_encoding_size()
            }
        }
    }

    /// Index of the first decoding step, -1 when the features are consumed as a step of their own.
    pub fn start_step(&self) -> isize {
        match self.model_type {
            ModelType::Standard => -1,
            ModelType::Concat | ModelType::Manet => 0,
        }
    }

    pub fn validate(&self) -> candle::Result<()> {
        if self.feat_dims.is_empty() {
            Err(Error::config("feat_dims should list at least one modality"))?
        }
        if let Some(i) = self.feat_dims.iter().position(|&d| d == 0) {
            Err(Error::config(format!("feat_dims[{i}] is zero")))?
        }
        if self.vocab_size == 0 || self.input_encoding_size == 0 || self.rnn_size == 0 {
            Err(Error::config(
                "vocab_size, input_encoding_size and rnn_size should be positive",
            ))?
        }
        if self.num_layers == 0 {
            Err(Error::config("num_layers should be positive"))?
        }
        if self.seq_length < 2 {
            Err(Error::config(format!(
                "seq_length should be at least 2, got {}",
                self.seq_length
            )))?
        }
        if self.train_seq_per_img == 0 {
            Err(Error::config("train_seq_per_img should be positive"))?
        }
        if !(0.0..1.0).contains(&self.drop_prob_lm) {
            Err(Error::config(format!(
                "drop_prob_lm should be in [0, 1), got {}",
                self.drop_prob_lm
            )))?
        }
        if self.bos_index == EOS_TOKEN || self.bos_index as usize >= self.vocab_size {
            Err(Error::config(format!(
                "bos_index {} should be a non-eos token below vocab_size {}",
                self.bos_index, self.vocab_size
            )))?
        }
        if self.model_type == ModelType::Standard
            && self.input_encoding_size != self.video_encoding_size()
        {
            Err(Error::config(format!(
                "the standard model feeds the features as an input step, input_encoding_size {} \
                 should match the video encoding size {}",
                self.input_encoding_size,
                self.video_encoding_size()
            )))?
        }
        Ok(())
    }
}
