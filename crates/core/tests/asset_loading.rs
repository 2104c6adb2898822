//! Loading tokenizer files, model config, and projector blobs from disk.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use fastvlm_core::{
    AssetPaths, BpeTokenizer, DecodeParameters, EngineError, VisionProjector, VlmEngine,
};

/// Fresh scratch directory for one test.
fn scratch(name: &str) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("fastvlm-assets-{}-{name}", std::process::id()));
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn write_tokenizer_files(dir: &PathBuf) -> Result<()> {
    fs::write(
        dir.join("vocab.json"),
        r#"{"a": 0, "b": 1, "ab": 2, "<unk>": 3}"#,
    )?;
    fs::write(dir.join("merges.txt"), "#version: 0.2\na b\n")?;
    fs::write(
        dir.join("tokenizer_config.json"),
        r#"{
            "chat_template": "{% for message in messages %}...{% endfor %}",
            "added_tokens_decoder": {
                "151645": {"content": "<|im_end|>"},
                "151646": {"content": "<image>"}
            }
        }"#,
    )?;
    fs::write(
        dir.join("special_tokens_map.json"),
        r#"{"eos_token": {"content": "<|im_end|>"}, "pad_token": "<|im_end|>"}"#,
    )?;
    Ok(())
}

fn write_f32(path: &PathBuf, values: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes)?;
    Ok(())
}

#[test]
fn tokenizer_loads_vocab_merges_and_specials() -> Result<()> {
    let dir = scratch("tokenizer")?;
    write_tokenizer_files(&dir)?;

    let tokenizer = BpeTokenizer::from_dir(&dir)?;
    assert_eq!(tokenizer.encode("ab")?, vec![2]);
    assert_eq!(tokenizer.image_token_id(), Some(151_646));
    assert_eq!(tokenizer.eos_id(), Some(151_645));
    // The untagged pad entry resolves through the same registry.
    assert_eq!(tokenizer.pad_id(), Some(151_645));
    assert!(tokenizer.chat_template().is_some());
    Ok(())
}

#[test]
fn missing_vocab_is_a_resource_error() -> Result<()> {
    let dir = scratch("missing-vocab")?;
    let err = BpeTokenizer::from_dir(&dir).expect_err("empty directory");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ResourceLoad(_))
    ));
    Ok(())
}

#[test]
fn malformed_merges_line_is_rejected() -> Result<()> {
    let dir = scratch("bad-merges")?;
    write_tokenizer_files(&dir)?;
    fs::write(dir.join("merges.txt"), "a b c\n")?;
    assert!(BpeTokenizer::from_dir(&dir).is_err());
    Ok(())
}

#[test]
fn projector_loads_single_and_double_stage_blobs() -> Result<()> {
    let dir = scratch("projector")?;
    let l1_w = dir.join("vision_projector_l1_w.bin");
    let l1_b = dir.join("vision_projector_l1_b.bin");
    let l2_w = dir.join("vision_projector_l2_w.bin");
    let l2_b = dir.join("vision_projector_l2_b.bin");

    write_f32(&l1_w, &[1.0, 0.0, 0.0, 1.0])?;
    write_f32(&l1_b, &[0.0, 0.0])?;
    let single = VisionProjector::load_optional(&l1_w, &l1_b, &l2_w, &l2_b)?
        .expect("layer-1 blobs present");
    assert_eq!(single.input_dim(), 2);
    assert_eq!(single.hidden(), 2);

    write_f32(&l2_w, &[1.0, 0.0, 0.0, 1.0])?;
    write_f32(&l2_b, &[0.5, 0.5])?;
    let double = VisionProjector::load_optional(&l1_w, &l1_b, &l2_w, &l2_b)?
        .expect("both stages present");
    // Second stage shifts the output by its bias.
    assert!(double.project(&[0.0, 0.0])[0] > single.project(&[0.0, 0.0])[0]);
    Ok(())
}

#[test]
fn absent_projector_blobs_disable_projection() -> Result<()> {
    let dir = scratch("no-projector")?;
    let missing = dir.join("nope.bin");
    assert!(VisionProjector::load_optional(&missing, &missing, &missing, &missing)?.is_none());
    Ok(())
}

#[test]
fn truncated_blob_is_a_resource_error() -> Result<()> {
    let dir = scratch("bad-blob")?;
    let l1_w = dir.join("vision_projector_l1_w.bin");
    let l1_b = dir.join("vision_projector_l1_b.bin");
    fs::write(&l1_w, [0u8; 5])?;
    write_f32(&l1_b, &[0.0])?;
    let err = VisionProjector::load_optional(&l1_w, &l1_b, &dir.join("x"), &dir.join("y"))
        .expect_err("5 bytes is not whole f32 values");
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::ResourceLoad(_))
    ));
    Ok(())
}

#[test]
fn engine_initializes_from_model_directory() -> Result<()> {
    let dir = scratch("engine")?;
    write_tokenizer_files(&dir)?;
    fs::write(dir.join("config.json"), r#"{"hidden_size": 2}"#)?;
    write_f32(&dir.join("vision_projector_l1_w.bin"), &[1.0, 0.0, 0.0, 1.0])?;
    write_f32(&dir.join("vision_projector_l1_b.bin"), &[0.0, 0.0])?;

    let paths = AssetPaths::from_root(&dir);
    let engine = VlmEngine::initialize(&paths, DecodeParameters::default())?;
    assert_eq!(engine.image_token_id(), 151_646);
    assert_eq!(engine.eos_id(), 151_645);
    assert_eq!(engine.config().hidden_size, 2);
    Ok(())
}

#[test]
fn engine_initialization_fails_without_config() -> Result<()> {
    let dir = scratch("engine-no-config")?;
    write_tokenizer_files(&dir)?;
    let paths = AssetPaths::from_root(&dir);
    assert!(VlmEngine::initialize(&paths, DecodeParameters::default()).is_err());
    Ok(())
}
