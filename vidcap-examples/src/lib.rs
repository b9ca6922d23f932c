use candle::{Device, Result, Tensor};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else if candle::utils::metal_is_available() {
        Device::new_metal(0)
    } else {
        println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        Ok(Device::Cpu)
    }
}

/// Formats a `(batch, len)` tensor of token ids, one line per sequence, stopping at the first
/// eos token.
pub fn format_sequences(seq: &Tensor) -> Result<Vec<String>> {
    let rows = seq.to_vec2::<u32>()?;
    let lines = rows
        .iter()
        .map(|row| {
            row.iter()
                .take_while(|&&t| t != vidcap::EOS_TOKEN)
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    Ok(lines)
}
