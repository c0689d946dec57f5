//! Gradient compression: top-k sparsification and 8-bit quantization
//!
//! The scheme travels inline with every update so the aggregator can
//! reconstruct without out-of-band agreement. Top-k reconstruction
//! zero-fills dropped coordinates; 8-bit dequantization uses the attached
//! scale and offset.

use meshguard_common::config::CompressionKind;
use meshguard_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A gradient vector in one of the supported encodings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompressedGradient {
    Dense {
        values: Vec<f64>,
    },
    TopK {
        dimension: usize,
        indices: Vec<u32>,
        values: Vec<f64>,
    },
    Int8 {
        scale: f64,
        offset: f64,
        codes: Vec<u8>,
    },
    TopKInt8 {
        dimension: usize,
        indices: Vec<u32>,
        scale: f64,
        offset: f64,
        codes: Vec<u8>,
    },
}

impl CompressedGradient {
    pub fn dimension(&self) -> usize {
        match self {
            CompressedGradient::Dense { values } => values.len(),
            CompressedGradient::TopK { dimension, .. } => *dimension,
            CompressedGradient::Int8 { codes, .. } => codes.len(),
            CompressedGradient::TopKInt8 { dimension, .. } => *dimension,
        }
    }
}

/// Compress a dense gradient under the configured scheme
pub fn compress(values: &[f64], scheme: CompressionKind, topk_fraction: f64) -> CompressedGradient {
    match scheme {
        CompressionKind::None => CompressedGradient::Dense {
            values: values.to_vec(),
        },
        CompressionKind::TopK => {
            let (indices, kept) = top_k(values, topk_fraction);
            CompressedGradient::TopK {
                dimension: values.len(),
                indices,
                values: kept,
            }
        }
        CompressionKind::Int8 => {
            let (scale, offset, codes) = quantize(values);
            CompressedGradient::Int8 {
                scale,
                offset,
                codes,
            }
        }
        CompressionKind::TopKInt8 => {
            let (indices, kept) = top_k(values, topk_fraction);
            let (scale, offset, codes) = quantize(&kept);
            CompressedGradient::TopKInt8 {
                dimension: values.len(),
                indices,
                scale,
                offset,
                codes,
            }
        }
    }
}

/// Reconstruct a dense gradient, validating dimension and rejecting
/// non-finite coordinates
pub fn decompress(gradient: &CompressedGradient, expected_dimension: usize) -> Result<Vec<f64>> {
    let dense = match gradient {
        CompressedGradient::Dense { values } => values.clone(),
        CompressedGradient::TopK {
            dimension,
            indices,
            values,
        } => scatter(*dimension, indices, values)?,
        CompressedGradient::Int8 {
            scale,
            offset,
            codes,
        } => dequantize(*scale, *offset, codes),
        CompressedGradient::TopKInt8 {
            dimension,
            indices,
            scale,
            offset,
            codes,
        } => {
            let values = dequantize(*scale, *offset, codes);
            scatter(*dimension, indices, &values)?
        }
    };

    if dense.len() != expected_dimension {
        return Err(Error::Integrity(format!(
            "gradient dimension {} does not match expected {}",
            dense.len(),
            expected_dimension
        )));
    }
    if dense.iter().any(|v| !v.is_finite()) {
        return Err(Error::Integrity("gradient contains non-finite values".into()));
    }
    Ok(dense)
}

/// Worst-case per-coordinate reconstruction error of the quantizer used by
/// this gradient (zero for the unquantized schemes)
pub fn quantization_error_bound(gradient: &CompressedGradient) -> f64 {
    match gradient {
        CompressedGradient::Dense { .. } | CompressedGradient::TopK { .. } => 0.0,
        CompressedGradient::Int8 { scale, .. }
        | CompressedGradient::TopKInt8 { scale, .. } => scale / 2.0,
    }
}

fn top_k(values: &[f64], fraction: f64) -> (Vec<u32>, Vec<f64>) {
    if values.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let k = ((values.len() as f64 * fraction).ceil() as usize)
        .clamp(1, values.len());

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .abs()
            .partial_cmp(&values[a].abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut picked: Vec<usize> = order.into_iter().take(k).collect();
    picked.sort_unstable();

    let indices: Vec<u32> = picked.iter().map(|&i| i as u32).collect();
    let kept: Vec<f64> = picked.iter().map(|&i| values[i]).collect();
    (indices, kept)
}

fn scatter(dimension: usize, indices: &[u32], values: &[f64]) -> Result<Vec<f64>> {
    if indices.len() != values.len() {
        return Err(Error::Integrity(
            "sparse index and value lengths differ".into(),
        ));
    }
    let mut dense = vec![0.0; dimension];
    for (&index, &value) in indices.iter().zip(values.iter()) {
        let slot = dense.get_mut(index as usize).ok_or_else(|| {
            Error::Integrity(format!("sparse index {} out of bounds {}", index, dimension))
        })?;
        *slot = value;
    }
    Ok(dense)
}

/// Affine 8-bit quantization: `code = round((v - offset) / scale)`
fn quantize(values: &[f64]) -> (f64, f64, Vec<u8>) {
    let (min, max) = values.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    if values.is_empty() || !min.is_finite() || !max.is_finite() || max == min {
        let offset = if min.is_finite() { min } else { 0.0 };
        return (0.0, offset, vec![0; values.len()]);
    }
    let scale = (max - min) / 255.0;
    let codes = values
        .iter()
        .map(|&v| (((v - min) / scale).round() as i64).clamp(0, 255) as u8)
        .collect();
    (scale, min, codes)
}

fn dequantize(scale: f64, offset: f64, codes: &[u8]) -> Vec<f64> {
    codes.iter().map(|&c| offset + c as f64 * scale).collect()
}
