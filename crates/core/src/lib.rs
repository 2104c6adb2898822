//! On-device vision-language inference core.
//!
//! Everything numeric runs through three host-supplied backends (vision encoder,
//! token embedder, cached decoder); this crate owns the text side: byte-level BPE
//! tokenization, prompt assembly, vision-feature fusion, the autoregressive
//! decode loop, and nucleus sampling.

pub mod backend;
pub mod config;
pub mod conversation;
pub mod error;
pub mod inference;
pub mod runtime;
pub mod sampling;
pub mod streaming;
pub mod tokenizer;
pub mod transformer;
pub mod vision;

pub use backend::{CacheSpec, Decoder, DecoderInputs, DecoderOutput, TokenEmbedder, VisionEncoder};
pub use config::{AssetPaths, ModelConfig};
pub use conversation::ChatTemplate;
pub use error::EngineError;
pub use inference::{DecodeOutcome, DecodeParameters, ProgressCallback, VlmEngine};
pub use runtime::ExecutionProvider;
pub use sampling::SamplingParams;
pub use tokenizer::BpeTokenizer;
pub use transformer::cache::{KvCache, KvLayer};
pub use vision::VisionProjector;
