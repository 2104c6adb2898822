//! Model configuration and on-disk asset layout.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

use crate::error::EngineError;

fn default_image_token_index() -> i64 {
    151_646
}

fn default_eos_token_id() -> i64 {
    151_645
}

/// Subset of the exported `config.json` the engine cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Decoder embedding width.
    pub hidden_size: usize,
    /// Vision encoder output width, before projection.
    #[serde(default)]
    pub mm_hidden_size: Option<usize>,
    /// Id of the image placeholder token in the prompt.
    #[serde(default = "default_image_token_index")]
    pub image_token_index: i64,
    /// Fallback end-of-sequence id when the tokenizer files do not name one.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: i64,
}

/// Parse a `config.json`, mapping I/O and JSON failures to a load error.
pub fn load_model_config(path: &Path) -> Result<ModelConfig> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        EngineError::ResourceLoad(format!("failed to read {}: {err}", path.display()))
    })?;
    let config: ModelConfig = serde_json::from_str(&raw).map_err(|err| {
        EngineError::ResourceLoad(format!("failed to parse {}: {err}", path.display()))
    })?;
    debug!(
        hidden_size = config.hidden_size,
        image_token_index = config.image_token_index,
        "model config loaded"
    );
    Ok(config)
}

/// Locations of every file the engine reads at startup.
#[derive(Debug, Clone)]
pub struct AssetPaths {
    pub tokenizer_dir: PathBuf,
    pub model_config: PathBuf,
    pub projector_l1_weight: PathBuf,
    pub projector_l1_bias: PathBuf,
    pub projector_l2_weight: PathBuf,
    pub projector_l2_bias: PathBuf,
}

impl AssetPaths {
    /// Conventional layout: tokenizer files, `config.json`, and projector blobs
    /// all live directly under one model directory.
    pub fn from_root(root: &Path) -> Self {
        Self {
            tokenizer_dir: root.to_path_buf(),
            model_config: root.join("config.json"),
            projector_l1_weight: root.join("vision_projector_l1_w.bin"),
            projector_l1_bias: root.join("vision_projector_l1_b.bin"),
            projector_l2_weight: root.join("vision_projector_l2_w.bin"),
            projector_l2_bias: root.join("vision_projector_l2_b.bin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() -> Result<()> {
        let config: ModelConfig = serde_json::from_str(r#"{"hidden_size": 896}"#)?;
        assert_eq!(config.hidden_size, 896);
        assert_eq!(config.mm_hidden_size, None);
        assert_eq!(config.image_token_index, 151_646);
        assert_eq!(config.eos_token_id, 151_645);
        Ok(())
    }

    #[test]
    fn explicit_fields_override_defaults() -> Result<()> {
        let config: ModelConfig = serde_json::from_str(
            r#"{"hidden_size": 64, "mm_hidden_size": 128, "image_token_index": 7, "eos_token_id": 8}"#,
        )?;
        assert_eq!(config.mm_hidden_size, Some(128));
        assert_eq!(config.image_token_index, 7);
        assert_eq!(config.eos_token_id, 8);
        Ok(())
    }

    #[test]
    fn missing_config_file_is_a_resource_error() {
        let err = load_model_config(Path::new("/nonexistent/config.json"))
            .expect_err("path does not exist");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ResourceLoad(_))
        ));
    }

    #[test]
    fn root_layout_places_all_assets_under_one_directory() {
        let paths = AssetPaths::from_root(Path::new("/models/fastvlm"));
        assert_eq!(paths.model_config, Path::new("/models/fastvlm/config.json"));
        assert_eq!(
            paths.projector_l2_bias,
            Path::new("/models/fastvlm/vision_projector_l2_b.bin")
        );
    }
}
