//! Capability traits for the three platform-supplied neural collaborators.
//!
//! Each model is an opaque function from named input tensors to named output
//! tensors; the core never sees weights or graph structure, only shapes. Backend
//! selection (CPU/GPU/NPU execution providers) happens in the host integration,
//! see [`crate::runtime`].

use anyhow::Result;
use candle_core::Tensor;

use crate::transformer::cache::KvCache;

/// Geometry of the per-layer key/value cache declared by a decoder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSpec {
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

/// Vision tower: preprocessed image tensor in, `(T, feat_dim)` features out.
pub trait VisionEncoder {
    fn encode(&self, image: &Tensor) -> Result<Tensor>;
}

/// Token embedder: ids in, `(L, hidden)` embeddings out.
pub trait TokenEmbedder {
    fn embed(&self, ids: &[i64]) -> Result<Tensor>;

    /// Embedding for a single id, shaped `(1, hidden)`.
    fn embed_one(&self, id: i64) -> Result<Tensor> {
        self.embed(std::slice::from_ref(&id))
    }
}

/// Inputs for one decoder call, prefill or single step.
pub struct DecoderInputs<'a> {
    /// `[1, S, hidden]` embeddings for the positions fed this call.
    pub embeddings: &'a Tensor,
    /// `[1, past + S]` ones.
    pub attention_mask: &'a Tensor,
    /// `[1, S]` absolute positions.
    pub position_ids: &'a Tensor,
    /// Cache returned by the previous call; zero sequence length at prefill.
    pub past: &'a KvCache,
}

/// Outputs of one decoder call.
pub struct DecoderOutput {
    /// `[1, S, vocab]` logits.
    pub logits: Tensor,
    /// Replacement cache covering the whole sequence decoded so far.
    pub cache: KvCache,
}

/// Decoder-with-cache. Calls within one generation are strictly sequential; the
/// engine never invokes `forward` reentrantly.
pub trait Decoder {
    fn cache_spec(&self) -> CacheSpec;
    fn forward(&self, inputs: DecoderInputs<'_>) -> Result<DecoderOutput>;
}
