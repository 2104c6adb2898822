//! Two-layer MLP lifting vision-encoder features into the decoder's hidden width.
//!
//! Weights arrive as raw little-endian f32 blobs exported next to the model
//! files; dimensions are inferred from the blob sizes rather than configured.

use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::error::EngineError;

/// `tanh` approximation of GELU, matching the exported projector's activation.
pub(crate) fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797_884_56 * (x + 0.044_715 * x * x * x)).tanh())
}

#[derive(Debug, Clone)]
struct AffineLayer {
    /// Row-major `[out, in]`.
    weight: Vec<f32>,
    bias: Vec<f32>,
}

impl AffineLayer {
    fn forward(&self, input: &[f32], out_dim: usize, in_dim: usize) -> Vec<f32> {
        let mut output = Vec::with_capacity(out_dim);
        for row in 0..out_dim {
            let weights = &self.weight[row * in_dim..(row + 1) * in_dim];
            let mut acc = self.bias[row];
            for (w, x) in weights.iter().zip(input) {
                acc += w * x;
            }
            output.push(acc);
        }
        output
    }
}

/// Hand-rolled projection network: affine → GELU → optional affine.
#[derive(Debug, Clone)]
pub struct VisionProjector {
    input_dim: usize,
    hidden: usize,
    layer1: AffineLayer,
    layer2: Option<AffineLayer>,
}

impl VisionProjector {
    /// Build from already-decoded weights. Layer-1 dimensions are derived from the
    /// bias length (`hidden`) and the weight element count (`hidden * input_dim`).
    pub fn from_raw(
        l1_weight: Vec<f32>,
        l1_bias: Vec<f32>,
        second: Option<(Vec<f32>, Vec<f32>)>,
    ) -> Result<Self> {
        let hidden = l1_bias.len();
        if hidden == 0 {
            return Err(EngineError::ResourceLoad("projector layer-1 bias is empty".into()).into());
        }
        if l1_weight.is_empty() || l1_weight.len() % hidden != 0 {
            return Err(EngineError::ResourceLoad(format!(
                "projector layer-1 weight count {} is not divisible by hidden width {hidden}",
                l1_weight.len()
            ))
            .into());
        }
        let input_dim = l1_weight.len() / hidden;
        let layer2 = match second {
            Some((weight, bias)) => {
                if weight.len() != hidden * hidden {
                    return Err(EngineError::ResourceLoad(format!(
                        "projector layer-2 weight count {} does not match {hidden}x{hidden}",
                        weight.len()
                    ))
                    .into());
                }
                if bias.len() != hidden {
                    return Err(EngineError::ResourceLoad(format!(
                        "projector layer-2 bias length {} does not match hidden width {hidden}",
                        bias.len()
                    ))
                    .into());
                }
                Some(AffineLayer { weight, bias })
            }
            None => None,
        };
        Ok(Self {
            input_dim,
            hidden,
            layer1: AffineLayer {
                weight: l1_weight,
                bias: l1_bias,
            },
            layer2,
        })
    }

    /// Load from the four conventional blob files. A missing layer-1 file disables
    /// projection entirely (`Ok(None)`); layer 2 is loaded only when both of its
    /// files are present.
    pub fn load_optional(
        l1_weight: &Path,
        l1_bias: &Path,
        l2_weight: &Path,
        l2_bias: &Path,
    ) -> Result<Option<Self>> {
        if !l1_weight.exists() || !l1_bias.exists() {
            debug!("projector layer-1 blobs absent, falling back to truncate/pad");
            return Ok(None);
        }
        let weight = read_f32_blob(l1_weight)?;
        let bias = read_f32_blob(l1_bias)?;
        let second = if l2_weight.exists() && l2_bias.exists() {
            Some((read_f32_blob(l2_weight)?, read_f32_blob(l2_bias)?))
        } else {
            None
        };
        let projector = Self::from_raw(weight, bias, second)?;
        debug!(
            input_dim = projector.input_dim,
            hidden = projector.hidden,
            two_stage = projector.layer2.is_some(),
            "vision projector loaded"
        );
        Ok(Some(projector))
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Project one vision vector. Sources narrower or wider than the trained
    /// input width are zero-extended or truncated to fit.
    pub fn project(&self, source: &[f32]) -> Vec<f32> {
        let mut input = vec![0.0f32; self.input_dim];
        let width = self.input_dim.min(source.len());
        input[..width].copy_from_slice(&source[..width]);

        let mut activated = self.layer1.forward(&input, self.hidden, self.input_dim);
        for value in &mut activated {
            *value = gelu(*value);
        }
        match &self.layer2 {
            Some(layer) => layer.forward(&activated, self.hidden, self.hidden),
            None => activated,
        }
    }
}

fn read_f32_blob(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path).map_err(|err| {
        EngineError::ResourceLoad(format!("failed to read {}: {err}", path.display()))
    })?;
    if bytes.len() % 4 != 0 {
        return Err(EngineError::ResourceLoad(format!(
            "{} holds {} bytes, not a whole number of f32 values",
            path.display(),
            bytes.len()
        ))
        .into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
