//! In-place checkpoint quantisation to a block-quantised ftype.

use crate::error::{LlamaError, Result};
use crate::format::FileSaver;
use crate::loader::ModelLoader;
use crate::model::Ftype;
use llama_kernels::{dequantize_row, quantize_q4_0, quantize_q4_1, TensorType, HISTOGRAM_BINS};
use log::info;
use std::path::Path;

fn format_shape(ne: &[usize]) -> String {
    let dims: Vec<String> = ne.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(" x "))
}

/// Re-encode `fname_inp` with every 2-D `*weight` tensor quantised to the
/// target ftype's block format, writing a `ggjt` v1 file to `fname_out`.
/// All other tensors pass through unchanged.
pub fn model_quantize(fname_inp: &Path, fname_out: &Path, ftype: Ftype) -> Result<()> {
    let quantized_type = match ftype {
        Ftype::MostlyQ4_0 => TensorType::Q4_0,
        Ftype::MostlyQ4_1 => TensorType::Q4_1,
        _ => {
            return Err(LlamaError::BadFormat(format!(
                "invalid quantization target: {}",
                ftype.name()
            )))
        }
    };

    // All shards merged, mmap off: every payload is materialised so it can
    // be transcoded.
    let mut loader = ModelLoader::open(fname_inp, false, false)?;
    let vocab = loader.take_vocab();
    let mut saver = FileSaver::create(
        fname_out,
        loader.hparams(),
        &vocab,
        loader.file_version(),
        ftype,
    )?;

    let n_tensors = loader.records().len();
    let mut total_size_org = 0usize;
    let mut total_size_new = 0usize;
    let mut hist_all = [0i64; HISTOGRAM_BINS];

    for (idx, record) in loader.records().iter().enumerate() {
        let data = loader.materialize_owned(record)?;

        let prelude = format!(
            "[{}/{}] {:>36} - {}, type = {:>6}",
            idx + 1,
            n_tensors,
            record.name,
            format_shape(&record.ne),
            record.dtype.to_string(),
        );

        // Quantise only the 2-D weight matrices; norms and any 1-D data
        // stay in their source type.
        let quantize = record.name.ends_with("weight") && record.ne.len() == 2;

        let (new_type, new_data) = if !quantize {
            info!(
                "{prelude}, size = {:8.3} MB",
                data.len() as f64 / (1024.0 * 1024.0)
            );
            (record.dtype, data)
        } else {
            let nelements = record.ne[0] * record.ne[1];
            let mut f32_data = vec![0.0f32; nelements];
            match record.dtype {
                TensorType::F32 | TensorType::F16 => {
                    let row_bytes = record.dtype.row_bytes(record.ne[0]);
                    for (row, out) in data
                        .chunks_exact(row_bytes)
                        .zip(f32_data.chunks_exact_mut(record.ne[0]))
                    {
                        dequantize_row(record.dtype, row, out);
                    }
                }
                other => {
                    return Err(LlamaError::BadFormat(format!(
                        "type {other} unsupported for integer quantization"
                    )))
                }
            }

            let out = match quantized_type {
                TensorType::Q4_0 => quantize_q4_0(&f32_data, record.ne[0]),
                TensorType::Q4_1 => quantize_q4_1(&f32_data, record.ne[0]),
                _ => unreachable!(),
            };

            let hist_line: Vec<String> = out
                .histogram
                .iter()
                .map(|&count| format!("{:5.3}", count as f64 / nelements as f64))
                .collect();
            info!(
                "{prelude}, size = {:8.2} MB -> {:8.2} MB | hist: {}",
                data.len() as f64 / (1024.0 * 1024.0),
                out.data.len() as f64 / (1024.0 * 1024.0),
                hist_line.join(" ")
            );

            for (all, cur) in hist_all.iter_mut().zip(&out.histogram) {
                *all += cur;
            }
            (quantized_type, out.data)
        };

        total_size_org += record.size;
        total_size_new += new_data.len();
        saver.write_tensor(&record.name, new_type, &record.ne, &new_data)?;
    }

    saver.finish()?;

    info!(
        "model size  = {:8.2} MB",
        total_size_org as f64 / (1024.0 * 1024.0)
    );
    info!(
        "quant size  = {:8.2} MB",
        total_size_new as f64 / (1024.0 * 1024.0)
    );

    let sum_all: i64 = hist_all.iter().sum();
    if sum_all > 0 {
        let hist_line: Vec<String> = hist_all
            .iter()
            .map(|&count| format!("{:5.3}", count as f64 / sum_all as f64))
            .collect();
        info!("hist: {}", hist_line.join(" "));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_quantised_targets() {
        let err = model_quantize(Path::new("in.bin"), Path::new("out.bin"), Ftype::MostlyF16)
            .unwrap_err();
        assert!(matches!(err, LlamaError::BadFormat(_)));
    }
}
