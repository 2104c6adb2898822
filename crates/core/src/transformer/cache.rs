//! Per-layer key/value cache carried through a single generation.
//!
//! The cache is owned exclusively by one in-flight answer and replaced wholesale
//! by each decoder call; two generations can never alias the same tensors.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};

use crate::{backend::CacheSpec, error::EngineError};

/// Key/value tensors for one decoder layer, both `[1, heads, seq, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvLayer {
    pub key: Tensor,
    pub value: Tensor,
}

impl KvLayer {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        let key_dims = key
            .shape()
            .dims4()
            .context("cache key must be [batch, heads, seq, head_dim]")?;
        let value_dims = value
            .shape()
            .dims4()
            .context("cache value must be [batch, heads, seq, head_dim]")?;
        if key_dims != value_dims {
            return Err(EngineError::ShapeMismatch(format!(
                "cache key dims {key_dims:?} differ from value dims {value_dims:?}"
            ))
            .into());
        }
        Ok(Self { key, value })
    }

    pub fn seq_len(&self) -> Result<usize> {
        self.key.dim(2).map_err(Into::into)
    }
}

/// Growable cache: one [`KvLayer`] per decoder layer, all at the same length.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<KvLayer>,
}

impl KvCache {
    /// Empty placeholder cache: correctly shaped, zero sequence length. Fed to the
    /// decoder at prefill.
    pub fn empty(spec: &CacheSpec, dtype: DType, device: &Device) -> Result<Self> {
        let mut layers = Vec::with_capacity(spec.num_layers);
        for _ in 0..spec.num_layers {
            let key = Tensor::zeros((1, spec.num_heads, 0, spec.head_dim), dtype, device)?;
            let value = Tensor::zeros((1, spec.num_heads, 0, spec.head_dim), dtype, device)?;
            layers.push(KvLayer { key, value });
        }
        Ok(Self { layers })
    }

    pub fn from_layers(layers: Vec<KvLayer>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[KvLayer] {
        &self.layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Sequence length covered by the cache; zero when no layer exists.
    pub fn seq_len(&self) -> Result<usize> {
        match self.layers.first() {
            Some(layer) => layer.seq_len(),
            None => Ok(0),
        }
    }

    /// Check the cache against the decoder's declared geometry: layer count,
    /// per-layer shapes, and a uniform sequence length across layers.
    pub fn validate(&self, spec: &CacheSpec) -> Result<()> {
        if self.layers.len() != spec.num_layers {
            return Err(EngineError::ShapeMismatch(format!(
                "cache holds {} layers, decoder declares {}",
                self.layers.len(),
                spec.num_layers
            ))
            .into());
        }
        let mut expected_len: Option<usize> = None;
        for (idx, layer) in self.layers.iter().enumerate() {
            let (batch, heads, seq, head_dim) = layer
                .key
                .shape()
                .dims4()
                .with_context(|| format!("cache layer {idx} key must be rank 4"))?;
            if batch != 1 || heads != spec.num_heads || head_dim != spec.head_dim {
                return Err(EngineError::ShapeMismatch(format!(
                    "cache layer {idx} shaped [{batch}, {heads}, {seq}, {head_dim}], \
                     expected [1, {}, _, {}]",
                    spec.num_heads, spec.head_dim
                ))
                .into());
            }
            let value_dims = layer
                .value
                .shape()
                .dims4()
                .with_context(|| format!("cache layer {idx} value must be rank 4"))?;
            if value_dims != (batch, heads, seq, head_dim) {
                return Err(EngineError::ShapeMismatch(format!(
                    "cache layer {idx} value dims {value_dims:?} differ from key"
                ))
                .into());
            }
            match expected_len {
                None => expected_len = Some(seq),
                Some(len) if len != seq => {
                    return Err(EngineError::ShapeMismatch(format!(
                        "cache layer {idx} length {seq} differs from layer 0 length {len}"
                    ))
                    .into());
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: CacheSpec = CacheSpec {
        num_layers: 2,
        num_heads: 3,
        head_dim: 4,
    };

    fn layer(seq: usize, heads: usize, head_dim: usize) -> Result<KvLayer> {
        let key = Tensor::zeros((1, heads, seq, head_dim), DType::F32, &Device::Cpu)?;
        let value = Tensor::zeros((1, heads, seq, head_dim), DType::F32, &Device::Cpu)?;
        KvLayer::new(key, value)
    }

    #[test]
    fn empty_cache_has_zero_length_and_valid_shape() -> Result<()> {
        let cache = KvCache::empty(&SPEC, DType::F32, &Device::Cpu)?;
        assert_eq!(cache.num_layers(), 2);
        assert_eq!(cache.seq_len()?, 0);
        cache.validate(&SPEC)?;
        Ok(())
    }

    #[test]
    fn validate_rejects_layer_count_mismatch() -> Result<()> {
        let cache = KvCache::from_layers(vec![layer(5, 3, 4)?]);
        let err = cache.validate(&SPEC).expect_err("one layer short");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn validate_rejects_uneven_layer_lengths() -> Result<()> {
        let cache = KvCache::from_layers(vec![layer(5, 3, 4)?, layer(6, 3, 4)?]);
        assert!(cache.validate(&SPEC).is_err());
        Ok(())
    }

    #[test]
    fn validate_rejects_wrong_head_geometry() -> Result<()> {
        let cache = KvCache::from_layers(vec![layer(5, 3, 4)?, layer(5, 2, 4)?]);
        assert!(cache.validate(&SPEC).is_err());
        Ok(())
    }

    #[test]
    fn mismatched_key_value_shapes_are_rejected() -> Result<()> {
        let key = Tensor::zeros((1, 3, 5, 4), DType::F32, &Device::Cpu)?;
        let value = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(KvLayer::new(key, value).is_err());
        Ok(())
    }
}
