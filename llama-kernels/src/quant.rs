use crate::types::{TensorType, QK};
use half::f16;

/// Bins in the quantisation code histogram (one per 4-bit code).
pub const HISTOGRAM_BINS: usize = 16;

/// Result of block-quantising a tensor payload.
#[derive(Debug)]
pub struct QuantizeOutput {
    /// Packed block payload.
    pub data: Vec<u8>,
    /// Count of each 4-bit code selected across all blocks.
    pub histogram: [i64; HISTOGRAM_BINS],
}

/// Quantise `src` to Q4_0 blocks: per 32-element block a shared f32 scale
/// and 16 packed nibble bytes. `row_len` is the tensor's leading dimension;
/// rows must be a whole number of blocks so that block boundaries never
/// straddle rows.
pub fn quantize_q4_0(src: &[f32], row_len: usize) -> QuantizeOutput {
    assert!(row_len % QK == 0 && src.len() % row_len == 0);

    let mut data = Vec::with_capacity(src.len() / QK * TensorType::Q4_0.type_size());
    let mut histogram = [0i64; HISTOGRAM_BINS];

    for block in src.chunks_exact(QK) {
        let amax = block.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
        let d = amax / 7.0;
        let id = if d != 0.0 { d.recip() } else { 0.0 };

        data.extend_from_slice(&d.to_le_bytes());
        for pair in block.chunks_exact(2) {
            let v0 = ((pair[0] * id).round() as i8 + 8) as u8;
            let v1 = ((pair[1] * id).round() as i8 + 8) as u8;
            debug_assert!(v0 < 16 && v1 < 16);
            histogram[v0 as usize] += 1;
            histogram[v1 as usize] += 1;
            data.push(v0 | (v1 << 4));
        }
    }

    QuantizeOutput { data, histogram }
}

/// Quantise `src` to Q4_1 blocks: per 32-element block an f32 scale, an f32
/// offset and 16 packed nibble bytes.
pub fn quantize_q4_1(src: &[f32], row_len: usize) -> QuantizeOutput {
    assert!(row_len % QK == 0 && src.len() % row_len == 0);

    let mut data = Vec::with_capacity(src.len() / QK * TensorType::Q4_1.type_size());
    let mut histogram = [0i64; HISTOGRAM_BINS];

    for block in src.chunks_exact(QK) {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in block {
            min = min.min(v);
            max = max.max(v);
        }
        let d = (max - min) / 15.0;
        let id = if d != 0.0 { d.recip() } else { 0.0 };

        data.extend_from_slice(&d.to_le_bytes());
        data.extend_from_slice(&min.to_le_bytes());
        for pair in block.chunks_exact(2) {
            let v0 = (((pair[0] - min) * id).round() as u8).min(15);
            let v1 = (((pair[1] - min) * id).round() as u8).min(15);
            histogram[v0 as usize] += 1;
            histogram[v1 as usize] += 1;
            data.push(v0 | (v1 << 4));
        }
    }

    QuantizeOutput { data, histogram }
}

/// Expand one typed row into f32.
pub fn dequantize_row(dtype: TensorType, row: &[u8], out: &mut [f32]) {
    debug_assert_eq!(row.len(), dtype.row_bytes(out.len()));
    match dtype {
        TensorType::F32 => {
            for (o, b) in out.iter_mut().zip(row.chunks_exact(4)) {
                *o = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
        }
        TensorType::F16 => {
            for (o, b) in out.iter_mut().zip(row.chunks_exact(2)) {
                *o = f16::from_le_bytes([b[0], b[1]]).to_f32();
            }
        }
        TensorType::Q4_0 => {
            for (block, out) in row
                .chunks_exact(TensorType::Q4_0.type_size())
                .zip(out.chunks_exact_mut(QK))
            {
                let d = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
                for (qs, o) in block[4..].iter().zip(out.chunks_exact_mut(2)) {
                    o[0] = ((qs & 0x0f) as i32 - 8) as f32 * d;
                    o[1] = ((qs >> 4) as i32 - 8) as f32 * d;
                }
            }
        }
        TensorType::Q4_1 => {
            for (block, out) in row
                .chunks_exact(TensorType::Q4_1.type_size())
                .zip(out.chunks_exact_mut(QK))
            {
                let d = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
                let m = f32::from_le_bytes([block[4], block[5], block[6], block[7]]);
                for (qs, o) in block[8..].iter().zip(out.chunks_exact_mut(2)) {
                    o[0] = (qs & 0x0f) as f32 * d + m;
                    o[1] = (qs >> 4) as f32 * d + m;
                }
            }
        }
    }
}

/// Dot product of one typed weight row with an f32 activation vector.
pub fn vec_dot(dtype: TensorType, row: &[u8], x: &[f32]) -> f32 {
    debug_assert_eq!(row.len(), dtype.row_bytes(x.len()));
    match dtype {
        TensorType::F32 => row
            .chunks_exact(4)
            .zip(x)
            .map(|(b, &xi)| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * xi)
            .sum(),
        TensorType::F16 => row
            .chunks_exact(2)
            .zip(x)
            .map(|(b, &xi)| f16::from_le_bytes([b[0], b[1]]).to_f32() * xi)
            .sum(),
        TensorType::Q4_0 => {
            let mut acc = 0.0f32;
            for (block, xs) in row
                .chunks_exact(TensorType::Q4_0.type_size())
                .zip(x.chunks_exact(QK))
            {
                let d = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
                let mut sum = 0.0f32;
                for (qs, xp) in block[4..].iter().zip(xs.chunks_exact(2)) {
                    sum += ((qs & 0x0f) as i32 - 8) as f32 * xp[0];
                    sum += ((qs >> 4) as i32 - 8) as f32 * xp[1];
                }
                acc += d * sum;
            }
            acc
        }
        TensorType::Q4_1 => {
            let mut acc = 0.0f32;
            for (block, xs) in row
                .chunks_exact(TensorType::Q4_1.type_size())
                .zip(x.chunks_exact(QK))
            {
                let d = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
                let m = f32::from_le_bytes([block[4], block[5], block[6], block[7]]);
                let mut code_sum = 0.0f32;
                let mut x_sum = 0.0f32;
                for (qs, xp) in block[8..].iter().zip(xs.chunks_exact(2)) {
                    code_sum += (qs & 0x0f) as f32 * xp[0] + (qs >> 4) as f32 * xp[1];
                    x_sum += xp[0] + xp[1];
                }
                acc += d * code_sum + m * x_sum;
            }
            acc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 - n as f32 / 2.0) * 0.25).collect()
    }

    #[test]
    fn q4_0_round_trip_error_is_bounded() {
        let src = ramp(64);
        let out = quantize_q4_0(&src, 64);
        assert_eq!(out.data.len(), TensorType::Q4_0.row_bytes(64));

        let mut back = vec![0.0f32; 64];
        dequantize_row(TensorType::Q4_0, &out.data, &mut back);

        // Max error per block is half a quantisation step.
        for (block, dec) in src.chunks_exact(QK).zip(back.chunks_exact(QK)) {
            let amax = block.iter().fold(0.0f32, |a, &v| a.max(v.abs()));
            let step = amax / 7.0;
            for (&s, &d) in block.iter().zip(dec) {
                assert!((s - d).abs() <= step * 0.5 + 1e-6, "{s} vs {d}");
            }
        }
    }

    #[test]
    fn q4_1_round_trip_error_is_bounded() {
        let src = ramp(64);
        let out = quantize_q4_1(&src, 64);
        assert_eq!(out.data.len(), TensorType::Q4_1.row_bytes(64));

        let mut back = vec![0.0f32; 64];
        dequantize_row(TensorType::Q4_1, &out.data, &mut back);

        for (block, dec) in src.chunks_exact(QK).zip(back.chunks_exact(QK)) {
            let min = block.iter().cloned().fold(f32::INFINITY, f32::min);
            let max = block.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let step = (max - min) / 15.0;
            for (&s, &d) in block.iter().zip(dec) {
                assert!((s - d).abs() <= step * 0.5 + 1e-6, "{s} vs {d}");
            }
        }
    }

    #[test]
    fn histogram_counts_every_element() {
        let src = ramp(96);
        let out = quantize_q4_0(&src, 32);
        assert_eq!(out.histogram.iter().sum::<i64>(), 96);
    }

    #[test]
    fn vec_dot_matches_dequantised_dot() {
        let src = ramp(64);
        let x: Vec<f32> = (0..64).map(|i| (i as f32 * 0.1).sin()).collect();

        for (quantise, dtype) in [
            (quantize_q4_0 as fn(&[f32], usize) -> QuantizeOutput, TensorType::Q4_0),
            (quantize_q4_1, TensorType::Q4_1),
        ] {
            let out = quantise(&src, 64);
            let mut dec = vec![0.0f32; 64];
            dequantize_row(dtype, &out.data, &mut dec);
            let expect: f32 = dec.iter().zip(&x).map(|(a, b)| a * b).sum();
            let got = vec_dot(dtype, &out.data, &x);
            assert!((expect - got).abs() < 1e-3, "{dtype}: {expect} vs {got}");
        }
    }

    #[test]
    fn zero_block_quantises_to_zero() {
        let src = vec![0.0f32; 32];
        let out = quantize_q4_0(&src, 32);
        let mut back = vec![1.0f32; 32];
        dequantize_row(TensorType::Q4_0, &out.data, &mut back);
        assert!(back.iter().all(|&v| v == 0.0));
    }
}
