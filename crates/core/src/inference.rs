//! Orchestration of one image-question-answer generation.
//!
//! The engine owns the tokenizer, prompt template, and projector; the three
//! neural collaborators are borrowed per call so hosts can manage backend
//! lifetimes themselves. All generation state lives in a per-call value, so one
//! engine can serve calls back to back without leaking context between them.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use tracing::{debug, info, trace};

use crate::{
    backend::{Decoder, DecoderInputs, TokenEmbedder, VisionEncoder},
    config::{load_model_config, AssetPaths, ModelConfig},
    conversation::ChatTemplate,
    error::EngineError,
    sampling::{init_rng, sample_token, SamplingParams},
    streaming::DeltaTracker,
    tokenizer::BpeTokenizer,
    transformer::cache::KvCache,
    vision::{fuse_embeddings, VisionProjector},
};

/// Generation knobs for a full answer.
#[derive(Debug, Clone, Copy)]
pub struct DecodeParameters {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub repetition_penalty: f32,
    /// Fixed RNG seed for reproducible runs; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for DecodeParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 96,
            temperature: 0.7,
            top_p: 0.95,
            repetition_penalty: 1.1,
            seed: None,
        }
    }
}

impl DecodeParameters {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
        }
    }
}

/// Finished answer plus token accounting.
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Receives newly decoded text fragments as generation progresses.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(&str);

/// Inference core for one loaded model.
pub struct VlmEngine {
    tokenizer: BpeTokenizer,
    template: ChatTemplate,
    config: ModelConfig,
    projector: Option<VisionProjector>,
    params: DecodeParameters,
}

impl VlmEngine {
    /// Load every asset named by `paths` and assemble an engine.
    pub fn initialize(paths: &AssetPaths, params: DecodeParameters) -> Result<Self> {
        let tokenizer = BpeTokenizer::from_dir(&paths.tokenizer_dir)?;
        let config = load_model_config(&paths.model_config)?;
        let projector = VisionProjector::load_optional(
            &paths.projector_l1_weight,
            &paths.projector_l1_bias,
            &paths.projector_l2_weight,
            &paths.projector_l2_bias,
        )?;
        info!(
            hidden_size = config.hidden_size,
            projector = projector.is_some(),
            "engine initialized"
        );
        Ok(Self::from_parts(
            tokenizer,
            ChatTemplate::new(),
            config,
            projector,
            params,
        ))
    }

    /// Assemble an engine from already-built components.
    pub fn from_parts(
        tokenizer: BpeTokenizer,
        template: ChatTemplate,
        config: ModelConfig,
        projector: Option<VisionProjector>,
        params: DecodeParameters,
    ) -> Self {
        Self {
            tokenizer,
            template,
            config,
            projector,
            params,
        }
    }

    pub fn tokenizer(&self) -> &BpeTokenizer {
        &self.tokenizer
    }

    pub fn template(&self) -> &ChatTemplate {
        &self.template
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn params(&self) -> &DecodeParameters {
        &self.params
    }

    /// Placeholder id, preferring the tokenizer's registration over the config.
    pub fn image_token_id(&self) -> i64 {
        self.tokenizer
            .image_token_id()
            .unwrap_or(self.config.image_token_index)
    }

    /// End-of-sequence id, preferring the tokenizer's registration over the config.
    pub fn eos_id(&self) -> i64 {
        self.tokenizer.eos_id().unwrap_or(self.config.eos_token_id)
    }

    /// Answer one question about one preprocessed image.
    ///
    /// Runs vision encode, prompt embedding, feature fusion, a prefill decoder
    /// call, then the autoregressive loop: sample, check stop conditions, feed the
    /// token back. The loop skips the decoder call that would follow the final
    /// sampled token. `progress` receives decoded text deltas as they stabilize.
    pub fn analyze(
        &self,
        vision: &dyn VisionEncoder,
        embedder: &dyn TokenEmbedder,
        decoder: &dyn Decoder,
        image: &Tensor,
        question: &str,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> Result<DecodeOutcome> {
        let prompt = self.template.render(question);
        let prompt_ids = self.tokenizer.encode(&prompt)?;
        debug!(prompt_tokens = prompt_ids.len(), "prompt encoded");

        let features = vision
            .encode(image)
            .map_err(|err| EngineError::Inference(format!("vision encoder failed: {err:#}")))?;
        let text_embeddings = embedder
            .embed(&prompt_ids)
            .map_err(|err| EngineError::Inference(format!("token embedder failed: {err:#}")))?;
        let fused = fuse_embeddings(
            &text_embeddings,
            &prompt_ids,
            self.image_token_id(),
            &features,
            self.projector.as_ref(),
        )?;

        let mut state = GenerationState::prefill(decoder, &fused)?;
        let sampling = self.params.sampling();
        let mut rng = init_rng(self.params.seed);
        let eos_id = self.eos_id();
        let mut tracker = DeltaTracker::new();

        loop {
            let token = sample_token(&state.last_logits, &state.generated, &sampling, &mut rng)?;
            if token == eos_id {
                trace!(step = state.generated.len(), "eos sampled");
                break;
            }
            state.generated.push(token);
            if let Some(callback) = progress.as_mut() {
                let snapshot = self.tokenizer.decode(&state.generated);
                if let Some(delta) = tracker.advance(&snapshot, false) {
                    callback(&delta);
                }
            }
            if state.generated.len() >= self.params.max_new_tokens {
                debug!(limit = self.params.max_new_tokens, "token budget exhausted");
                break;
            }
            state.advance(embedder, decoder, token)?;
        }

        let text = self.tokenizer.decode(&state.generated);
        if let Some(callback) = progress.as_mut() {
            if let Some(delta) = tracker.advance(&text, true) {
                callback(&delta);
            }
        }
        info!(
            prompt_tokens = prompt_ids.len(),
            generated_tokens = state.generated.len(),
            "generation finished"
        );
        Ok(DecodeOutcome {
            text,
            prompt_tokens: prompt_ids.len(),
            generated_tokens: state.generated.len(),
        })
    }
}

/// Mutable state of one in-flight generation: the cache, the sampled ids, and
/// the logits the next sampling step reads from.
struct GenerationState {
    cache: KvCache,
    seq_len: usize,
    generated: Vec<i64>,
    last_logits: Vec<f32>,
}

impl GenerationState {
    /// Run the prefill call over the fused `(S, hidden)` embedding sequence.
    fn prefill(decoder: &dyn Decoder, fused: &Tensor) -> Result<Self> {
        let (seq_len, _hidden) = fused
            .shape()
            .dims2()
            .context("fused embeddings must be (tokens, hidden)")?;
        if seq_len == 0 {
            return Err(EngineError::Inference("fused prompt is empty".into()).into());
        }
        let device = fused.device();
        let embeddings = fused.unsqueeze(0)?;
        let attention_mask = Tensor::ones((1, seq_len), DType::I64, device)?;
        let position_ids = Tensor::arange(0i64, seq_len as i64, device)?.reshape((1, seq_len))?;

        let spec = decoder.cache_spec();
        let past = KvCache::empty(&spec, DType::F32, device)?;
        let output = decoder
            .forward(DecoderInputs {
                embeddings: &embeddings,
                attention_mask: &attention_mask,
                position_ids: &position_ids,
                past: &past,
            })
            .map_err(|err| EngineError::Inference(format!("decoder prefill failed: {err:#}")))?;

        output.cache.validate(&spec)?;
        let cache_len = output.cache.seq_len()?;
        if cache_len != seq_len {
            return Err(EngineError::ShapeMismatch(format!(
                "prefill cache covers {cache_len} positions, expected {seq_len}"
            ))
            .into());
        }
        let last_logits = last_row(&output.logits)?;
        Ok(Self {
            cache: output.cache,
            seq_len,
            generated: Vec::new(),
            last_logits,
        })
    }

    /// Feed one sampled token back through the decoder, growing the cache by one.
    fn advance(
        &mut self,
        embedder: &dyn TokenEmbedder,
        decoder: &dyn Decoder,
        token: i64,
    ) -> Result<()> {
        let embedding = embedder
            .embed_one(token)
            .map_err(|err| EngineError::Inference(format!("token embedder failed: {err:#}")))?;
        let device = embedding.device().clone();
        let embeddings = embedding.reshape((1, 1, ()))?;
        let attention_mask = Tensor::ones((1, self.seq_len + 1), DType::I64, &device)?;
        let position_ids = Tensor::from_vec(vec![self.seq_len as i64], (1, 1), &device)?;

        let output = decoder
            .forward(DecoderInputs {
                embeddings: &embeddings,
                attention_mask: &attention_mask,
                position_ids: &position_ids,
                past: &self.cache,
            })
            .map_err(|err| EngineError::Inference(format!("decoder step failed: {err:#}")))?;

        let cache_len = output.cache.seq_len()?;
        if cache_len != self.seq_len + 1 {
            return Err(EngineError::ShapeMismatch(format!(
                "decoder step grew cache to {cache_len}, expected {}",
                self.seq_len + 1
            ))
            .into());
        }
        self.last_logits = last_row(&output.logits)?;
        self.cache = output.cache;
        self.seq_len += 1;
        Ok(())
    }
}

/// Logits of the final position, as a plain vector over the vocabulary.
fn last_row(logits: &Tensor) -> Result<Vec<f32>> {
    let (batch, steps, _vocab) = logits
        .shape()
        .dims3()
        .context("decoder logits must be [batch, steps, vocab]")?;
    if batch != 1 {
        return Err(EngineError::ShapeMismatch(format!(
            "decoder emitted batch size {batch}, expected 1"
        ))
        .into());
    }
    if steps == 0 {
        return Err(EngineError::ShapeMismatch("decoder emitted zero steps".into()).into());
    }
    logits.get(0)?.get(steps - 1)?.to_vec1().map_err(Into::into)
}
