//! Recurrent core of the decoder.
//!
//! The cores are multi-layer and bias-free, the weights use the PyTorch names
//! (`weight_ih_l{k}`, `weight_hh_l{k}`) and gate ordering so that checkpoints can be exchanged.
//! Embedding the tokens and projecting the outputs to the vocabulary is left to the decoder.
use candle::{DType, Device, Module, Result, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder};

use crate::config::{Config, RnnType};

/// The state carried between two steps, each tensor has shape `(num_layers, batch, hidden)`.
#[derive(Debug, Clone)]
pub enum HiddenState {
    /// Hidden and cell states of a gated-memory core.
    Pair { h: Tensor, c: Tensor },
    /// Hidden state of a single-tensor core.
    Single(Tensor),
}

impl HiddenState {
    /// The hidden state vector for all the layers.
    pub fn h(&self) -> &Tensor {
        match self {
            Self::Pair { h, .. } => h,
            Self::Single(h) => h,
        }
    }

    /// The cell state vector, only available for gated-memory cores.
    pub fn c(&self) -> Option<&Tensor> {
        match self {
            Self::Pair { c, .. } => Some(c),
            Self::Single(_) => None,
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        self.h().dim(1)
    }

    /// Hidden vector of the first layer, shape `(batch, hidden)`.
    pub fn first_layer(&self) -> Result<Tensor> {
        self.h().get(0)
    }

    /// Builds a new state whose row `i` is a copy of row `rows[i]` of this state.
    ///
    /// The returned tensors own their storage, later updates to either state never reach the
    /// other one.
    pub fn fork(&self, rows: &Tensor) -> Result<Self> {
        let state = match self {
            Self::Pair { h, c } => Self::Pair {
                h: h.index_select(rows, 1)?,
                c: c.index_select(rows, 1)?,
            },
            Self::Single(h) => Self::Single(h.index_select(rows, 1)?),
        };
        Ok(state)
    }
}

/// A single step recurrent transition.
pub trait RecurrentCore: std::fmt::Debug {
    /// The all-zero state used at the start of a sequence.
    fn zero_state(&self, batch_size: usize) -> Result<HiddenState>;

    /// Consumes one input of shape `(batch, input_size)` and returns the output of the last
    /// layer, shape `(batch, hidden)`, together with the updated state.
    ///
    /// When `train` is set, dropout is applied between the stacked layers.
    fn step(&self, input: &Tensor, state: &HiddenState, train: bool)
        -> Result<(Tensor, HiddenState)>;

    fn hidden_size(&self) -> usize;
}

/// Builds the core matching the configured recurrent family.
pub fn recurrent_core(cfg: &Config, vb: VarBuilder) -> Result<Box<dyn RecurrentCore>> {
    let stack = Stack::new(cfg, gates(cfg.rnn_type), vb)?;
    let core: Box<dyn RecurrentCore> = match cfg.rnn_type {
        RnnType::Lstm => Box::new(Lstm { stack }),
        RnnType::Gru => Box::new(Gru { stack }),
        RnnType::Rnn => Box::new(Rnn { stack }),
    };
    Ok(core)
}

fn gates(rnn_type: RnnType) -> usize {
    match rnn_type {
        RnnType::Lstm => 4,
        RnnType::Gru => 3,
        RnnType::Rnn => 1,
    }
}

#[derive(Debug, Clone)]
struct Layer {
    w_ih: Linear,
    w_hh: Linear,
}

#[derive(Debug, Clone)]
struct Stack {
    layers: Vec<Layer>,
    hidden_size: usize,
    dropout: Dropout,
    dtype: DType,
    device: Device,
    span: tracing::Span,
}

impl Stack {
    fn new(cfg: &Config, gates: usize, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.rnn_size;
        // Same default as torch.nn.LSTM / GRU / RNN.
        let bound = 1. / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let mut layers = Vec::with_capacity(cfg.num_layers);
        for k in 0..cfg.num_layers {
            let in_dim = if k == 0 {
                cfg.rnn_input_size()
            } else {
                hidden_size
            };
            let w_ih = vb.get_with_hints(
                (gates * hidden_size, in_dim),
                &format!("weight_ih_l{k}"),
                init,
            )?;
            let w_hh = vb.get_with_hints(
                (gates * hidden_size, hidden_size),
                &format!("weight_hh_l{k}"),
                init,
            )?;
            layers.push(Layer {
                w_ih: Linear::new(w_ih, None),
                w_hh: Linear::new(w_hh, None),
            })
        }
        let span = tracing::span!(tracing::Level::TRACE, "rnn-step", kind = ?cfg.rnn_type);
        Ok(Self {
            layers,
            hidden_size,
            dropout: Dropout::new(cfg.drop_prob_lm),
            dtype: vb.dtype(),
            device: vb.device().clone(),
            span,
        })
    }

    fn zeros(&self, batch_size: usize) -> Result<Tensor> {
        Tensor::zeros(
            (self.layers.len(), batch_size, self.hidden_size),
            self.dtype,
            &self.device,
        )
    }

    // Runs the layers bottom to top, `cell` maps (layer, input, layer index) to the new
    // per-layer states, the first returned tensor being the hidden vector fed upwards.
    fn run<F>(
        &self,
        input: &Tensor,
        train: bool,
        mut cell: F,
    ) -> Result<(Tensor, Vec<Vec<Tensor>>)>
    where
        F: FnMut(&Layer, &Tensor, usize) -> Result<Vec<Tensor>>,
    {
        let _enter = self.span.enter();
        let num_layers = self.layers.len();
        let mut xs = input.clone();
        let mut per_layer = Vec::with_capacity(num_layers);
        for (k, layer) in self.layers.iter().enumerate() {
            let states = cell(layer, &xs, k)?;
            xs = if k + 1 < num_layers {
                self.dropout.forward(&states[0], train)?
            } else {
                states[0].clone()
            };
            per_layer.push(states)
        }
        Ok((xs, per_layer))
    }
}

fn stack_layers(per_layer: &[Vec<Tensor>], idx: usize) -> Result<Tensor> {
    let ts = per_layer.iter().map(|s| &s[idx]).collect::<Vec<_>>();
    Tensor::stack(&ts, 0)
}

/// Long short-term memory core, gates ordered as input, forget, cell, output.
#[derive(Debug, Clone)]
pub struct Lstm {
    stack: Stack,
}

impl RecurrentCore for Lstm {
    fn zero_state(&self, batch_size: usize) -> Result<HiddenState> {
        Ok(HiddenState::Pair {
            h: self.stack.zeros(batch_size)?,
            c: self.stack.zeros(batch_size)?,
        })
    }

    fn step(
        &self,
        input: &Tensor,
        state: &HiddenState,
        train: bool,
    ) -> Result<(Tensor, HiddenState)> {
        let (h, c) = match state {
            HiddenState::Pair { h, c } => (h, c),
            HiddenState::Single(_) => candle::bail!("lstm core expects a (h, c) state"),
        };
        let (out, per_layer) = self.stack.run(input, train, |layer, xs, k| {
            let h_prev = h.get(k)?;
            let c_prev = c.get(k)?;
            let gates = (layer.w_ih.forward(xs)? + layer.w_hh.forward(&h_prev)?)?;
            let chunks = gates.chunk(4, 1)?;
            let in_gate = candle_nn::ops::sigmoid(&chunks[0])?;
            let forget_gate = candle_nn::ops::sigmoid(&chunks[1])?;
            let cell_gate = chunks[2].tanh()?;
            let out_gate = candle_nn::ops::sigmoid(&chunks[3])?;
            let next_c = ((forget_gate * c_prev)? + (in_gate * cell_gate)?)?;
            let next_h = (out_gate * next_c.tanh()?)?;
            Ok(vec![next_h, next_c])
        })?;
        let state = HiddenState::Pair {
            h: stack_layers(&per_layer, 0)?,
            c: stack_layers(&per_layer, 1)?,
        };
        Ok((out, state))
    }

    fn hidden_size(&self) -> usize {
        self.stack.hidden_size
    }
}

/// Gated recurrent unit core, gates ordered as reset, update, new.
#[derive(Debug, Clone)]
pub struct Gru {
    stack: Stack,
}

impl RecurrentCore for Gru {
    fn zero_state(&self, batch_size: usize) -> Result<HiddenState> {
        Ok(HiddenState::Single(self.stack.zeros(batch_size)?))
    }

    fn step(
        &self,
        input: &Tensor,
        state: &HiddenState,
        train: bool,
    ) -> Result<(Tensor, HiddenState)> {
        let h = state.h();
        let (out, per_layer) = self.stack.run(input, train, |layer, xs, k| {
            let h_prev = h.get(k)?;
            let w_ih = layer.w_ih.forward(xs)?.chunk(3, 1)?;
            let w_hh = layer.w_hh.forward(&h_prev)?.chunk(3, 1)?;
            let r_gate = candle_nn::ops::sigmoid(&(&w_ih[0] + &w_hh[0])?)?;
            let z_gate = candle_nn::ops::sigmoid(&(&w_ih[1] + &w_hh[1])?)?;
            let n_gate = (&w_ih[2] + (r_gate * &w_hh[2])?)?.tanh()?;
            let next_h = ((&z_gate * &h_prev)? - ((z_gate - 1.)? * n_gate)?)?;
            Ok(vec![next_h])
        })?;
        Ok((out, HiddenState::Single(stack_layers(&per_layer, 0)?)))
    }

    fn hidden_size(&self) -> usize {
        self.stack.hidden_size
    }
}

/// Elman recurrent core with a tanh non-linearity.
#[derive(Debug, Clone)]
pub struct Rnn {
    stack: Stack,
}

impl RecurrentCore for Rnn {
    fn zero_state(&self, batch_size: usize) -> Result<HiddenState> {
        Ok(HiddenState::Single(self.stack.zeros(batch_size)?))
    }

    fn step(
        &self,
        input: &Tensor,
        state: &HiddenState,
        train: bool,
    ) -> Result<(Tensor, HiddenState)> {
        let h = state.h();
        let (out, per_layer) = self.stack.run(input, train, |layer, xs, k| {
            let h_prev = h.get(k)?;
            let next_h = (layer.w_ih.forward(xs)? + layer.w_hh.forward(&h_prev)?)?.tanh()?;
            Ok(vec![next_h])
        })?;
        Ok((out, HiddenState::Single(stack_layers(&per_layer, 0)?)))
    }

    fn hidden_size(&self) -> usize {
        self.stack.hidden_size
    }
}
