//! Training criteria for the caption decoder.
use candle::{DType, Result, Tensor};

use crate::Error;

// Truncates all the tensors along the time axis (dim 1) to the shortest one. The results are
// contiguous as gather only accepts contiguous operands.
fn truncate_time(xs: &[&Tensor]) -> Result<Vec<Tensor>> {
    let mut len = usize::MAX;
    for x in xs.iter() {
        len = len.min(x.dim(1)?)
    }
    xs.iter()
        .map(|x| x.narrow(1, 0, len)?.contiguous())
        .collect()
}

fn masked_mean(values: &Tensor, mask: &Tensor, op: &'static str) -> Result<Tensor> {
    let denom = mask.sum_all()?;
    if denom.to_dtype(DType::F64)?.to_scalar::<f64>()? == 0. {
        Err(Error::invariant(op, "the mask selects no position"))?
    }
    (values * mask)?.sum_all()?.neg()? / denom
}

/// The masked cross-entropy of a sequence of predicted distributions.
///
/// Arguments
///
/// * [pred]: log-probabilities of dimensions `B, L, V`.
/// * [target]: token ids as a tensor of dimensions `B, L`.
/// * [mask]: float weights of dimensions `B, L`, zero for padding positions.
///
/// The three tensors are truncated to their shortest time length. The result is a scalar,
/// the negative log-likelihood summed over the unmasked positions and divided by the mask sum.
pub fn masked_cross_entropy(pred: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    if pred.rank() != 3 || target.rank() != 2 || mask.rank() != 2 {
        Err(Error::shape(
            "masked-cross-entropy",
            format!(
                "expected (B, L, V), (B, L), (B, L), got {:?}, {:?}, {:?}",
                pred.shape(),
                target.shape(),
                mask.shape()
            ),
        ))?
    }
    let xs = truncate_time(&[pred, target, mask])?;
    let target = xs[1].to_dtype(DType::U32)?.unsqueeze(2)?;
    let picked = xs[0].gather(&target, 2)?.squeeze(2)?;
    let mask = xs[2].to_dtype(picked.dtype())?;
    masked_mean(&picked, &mask, "masked-cross-entropy")
}

/// The policy gradient loss used for self-critical training.
///
/// Arguments
///
/// * [seq_logprobs]: log-probabilities of the sampled tokens, dimensions `B, L`.
/// * [seq]: the sampled token ids, dimensions `B, L`, zero after the end of each sequence.
/// * [reward]: the reward of each position with dimensions `B, L`, or of each sequence with
///   dimension `B`.
///
/// The mask keeps the positions up to and including the first eos token, that is `seq > 0`
/// shifted right by one with a leading one.
pub fn reward_criterion(seq_logprobs: &Tensor, seq: &Tensor, reward: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len) = seq_logprobs.dims2()?;
    if seq.dims2()? != (b_sz, seq_len) || seq_len == 0 {
        Err(Error::shape(
            "reward-criterion",
            format!(
                "logprobs {:?} and sequences {:?} should have the same non-empty shape",
                seq_logprobs.shape(),
                seq.shape()
            ),
        ))?
    }
    let dtype = seq_logprobs.dtype();
    let reward = match reward.rank() {
        1 => reward.unsqueeze(1)?.broadcast_as((b_sz, seq_len))?,
        _ => reward.clone(),
    };
    let mask = seq.to_dtype(DType::U32)?.gt(0u32)?.to_dtype(dtype)?;
    let lead = Tensor::ones((b_sz, 1), dtype, seq_logprobs.device())?;
    let mask = Tensor::cat(&[&lead, &mask.narrow(1, 0, seq_len - 1)?], 1)?;
    let values = (seq_logprobs * reward.to_dtype(dtype)?)?;
    masked_mean(&values, &mask, "reward-criterion")
}
