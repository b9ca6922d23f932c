//! Video feature front end: pooling of the modalities, replication for multiple captions per
//! video and modal attention.
use candle::{Module, Result, Tensor, D};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use crate::Error;

/// Projects each modality to a common width and concatenates the projections.
#[derive(Debug, Clone)]
pub struct FeatPool {
    feat_list: Vec<Linear>,
    feat_dims: Vec<usize>,
    dropout: Dropout,
    span: tracing::Span,
}

impl FeatPool {
    pub fn new(feat_dims: &[usize], out_size: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("feat_list");
        let feat_list = feat_dims
            .iter()
            .enumerate()
            .map(|(i, &dim)| linear(dim, out_size, vb.pp(i).pp(0)))
            .collect::<Result<Vec<_>>>()?;
        let span = tracing::span!(tracing::Level::TRACE, "feat-pool");
        Ok(Self {
            feat_list,
            feat_dims: feat_dims.to_vec(),
            dropout: Dropout::new(drop_p),
            span,
        })
    }

    pub fn num_feats(&self) -> usize {
        self.feat_list.len()
    }

    /// Each feature tensor has shape `(batch, 1, dim)` or `(batch, dim)`, the result has shape
    /// `(batch, num_feats * out_size)`.
    pub fn forward(&self, feats: &[Tensor], train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        if feats.len() != self.feat_list.len() {
            Err(Error::shape(
                "feat-pool",
                format!(
                    "got {} modalities, expected {}",
                    feats.len(),
                    self.feat_list.len()
                ),
            ))?
        }
        let mut pooled = Vec::with_capacity(feats.len());
        for (i, (feat, layer)) in feats.iter().zip(self.feat_list.iter()).enumerate() {
            let feat = match feat.rank() {
                3 => feat.squeeze(1)?,
                2 => feat.clone(),
                _ => Err(Error::shape(
                    "feat-pool",
                    format!("modality {i} has shape {:?}", feat.shape()),
                ))?,
            };
            let dim = feat.dim(1)?;
            if dim != self.feat_dims[i] {
                Err(Error::shape(
                    "feat-pool",
                    format!("modality {i} has width {dim}, expected {}", self.feat_dims[i]),
                ))?
            }
            let xs = layer.forward(&feat)?.relu()?;
            pooled.push(self.dropout.forward(&xs, train)?)
        }
        Tensor::cat(&pooled, 1)
    }
}

/// Repeats every row of the pooled features `n` times, so that each reference caption of a
/// video sees its own copy of the features.
#[derive(Debug, Clone, Copy)]
pub struct FeatExpander {
    n: usize,
}

impl FeatExpander {
    pub fn new(n: usize) -> Result<Self> {
        if n == 0 {
            Err(Error::config("the feature replication factor should be positive"))?
        }
        Ok(Self { n })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn set_n(&mut self, n: usize) -> Result<()> {
        *self = Self::new(n)?;
        Ok(())
    }

    /// `(b, d)` to `(b * n, d)`, rows `i * n .. (i + 1) * n` are copies of row `i`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if self.n == 1 {
            return Ok(xs.clone());
        }
        let (b_sz, dim) = xs.dims2()?;
        xs.unsqueeze(1)?
            .broadcast_as((b_sz, self.n, dim))?
            .contiguous()?
            .reshape((b_sz * self.n, dim))
    }
}

/// Modal attention: a softmax gate over the modalities computed from the features and the
/// current hidden state, each weight scaling the block of columns of its modality.
#[derive(Debug, Clone)]
pub struct ModalAttention {
    f_feat_m: Linear,
    f_h_m: Linear,
    align_m: Linear,
    num_feats: usize,
    video_encoding_size: usize,
    span: tracing::Span,
}

impl ModalAttention {
    pub fn new(
        video_encoding_size: usize,
        rnn_size: usize,
        num_feats: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if num_feats == 0 || video_encoding_size % num_feats != 0 {
            Err(Error::config(format!(
                "video encoding size {video_encoding_size} cannot be split in {num_feats} blocks"
            )))?
        }
        let f_feat_m = linear(video_encoding_size, num_feats, vb.pp("f_feat_m"))?;
        let f_h_m = linear(rnn_size, num_feats, vb.pp("f_h_m"))?;
        let align_m = linear(num_feats, num_feats, vb.pp("align_m"))?;
        let span = tracing::span!(tracing::Level::TRACE, "manet");
        Ok(Self {
            f_feat_m,
            f_h_m,
            align_m,
            num_feats,
            video_encoding_size,
            span,
        })
    }

    /// Per-modality weights of shape `(batch, num_feats)`, each row sums to one.
    pub fn weights(&self, xs: &Tensor, h: &Tensor) -> Result<Tensor> {
        let f_feat = self.f_feat_m.forward(xs)?;
        let f_h = self.f_h_m.forward(h)?;
        let att = self.align_m.forward(&(f_feat + f_h)?.tanh()?)?;
        candle_nn::ops::softmax(&att, D::Minus1)
    }

    /// `xs` has shape `(batch, video_encoding_size)` and `h` `(batch, rnn_size)`.
    pub fn forward(&self, xs: &Tensor, h: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let b_sz = xs.dim(0)?;
        let block = self.video_encoding_size / self.num_feats;
        let weights = self
            .weights(xs, h)?
            .unsqueeze(2)?
            .broadcast_as((b_sz, self.num_feats, block))?
            .contiguous()?
            .reshape((b_sz, self.video_encoding_size))?;
        xs * weights
    }
}
