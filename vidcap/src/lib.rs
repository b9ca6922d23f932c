// The crate functions return candle errors, the domain specific cases are wrapped from `Error`.
pub mod beam;
pub mod cider;
pub mod config;
pub mod error;
pub mod features;
pub mod loss;
pub mod model;
pub mod refs;
pub mod rnn;
pub mod sampling;

pub use beam::{Beam, BeamSearch, DoneBeams};
pub use cider::{Cider, CiderD, Scorer};
pub use config::{Config, ModelType, RnnType, EOS_TOKEN};
pub use error::Error;
pub use features::{FeatExpander, FeatPool, ModalAttention};
pub use model::{CaptionModel, ForwardOutput, SampleOptions, SampleOutput};
pub use refs::{load_gt_refs, load_predictions, Prediction, Refs};
pub use rnn::{recurrent_core, HiddenState, RecurrentCore};
pub use sampling::Sampler;
