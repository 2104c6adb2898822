//! Splicing vision features into the text embedding sequence.
//!
//! The prompt carries a single placeholder token; its embedding row is replaced
//! by the full run of vision feature rows, widened to the decoder's hidden size.

use anyhow::{Context, Result};
use candle_core::Tensor;
use tracing::{debug, warn};

use crate::{error::EngineError, vision::projector::VisionProjector};

/// Replace the first placeholder row of `text_embeddings` with the vision
/// feature rows.
///
/// `text_embeddings` is `(tokens, hidden)` and must align row-for-row with
/// `token_ids`; `vision_features` is `(patches, feat_dim)`. Each feature row is
/// widened to `hidden` through the projector when one is supplied, copied
/// directly when the widths already agree, and truncated or zero-padded as a
/// last resort. The output is `(tokens - 1 + patches, hidden)`. A prompt with
/// no placeholder passes through unchanged.
pub fn fuse_embeddings(
    text_embeddings: &Tensor,
    token_ids: &[i64],
    image_token_id: i64,
    vision_features: &Tensor,
    projector: Option<&VisionProjector>,
) -> Result<Tensor> {
    let (num_tokens, hidden) = text_embeddings
        .shape()
        .dims2()
        .context("text embeddings must be (tokens, hidden)")?;
    if num_tokens != token_ids.len() {
        return Err(EngineError::ShapeMismatch(format!(
            "text embeddings cover {num_tokens} rows but {} token ids were given",
            token_ids.len()
        ))
        .into());
    }

    let Some(position) = token_ids.iter().position(|&id| id == image_token_id) else {
        debug!("prompt carries no image placeholder, embeddings pass through");
        return Ok(text_embeddings.clone());
    };

    let (num_patches, feat_dim) = vision_features
        .shape()
        .dims2()
        .context("vision features must be (patches, feat_dim)")?;
    // Matching widths copy rows unchanged, so the projector is only consulted
    // (and its output width only constrained) when projection actually runs.
    if feat_dim != hidden {
        if let Some(projector) = projector {
            if projector.hidden() != hidden {
                return Err(EngineError::ShapeMismatch(format!(
                    "projector emits width {} but decoder hidden size is {hidden}",
                    projector.hidden()
                ))
                .into());
            }
        }
    }

    let text_rows = text_embeddings.to_vec2::<f32>()?;
    let feature_rows = vision_features.to_vec2::<f32>()?;

    let mut fused: Vec<f32> = Vec::with_capacity((num_tokens - 1 + num_patches) * hidden);
    for row in &text_rows[..position] {
        fused.extend_from_slice(row);
    }
    if projector.is_none() && feat_dim != hidden {
        warn!(
            feat_dim,
            hidden, "no projector loaded, vision rows truncated or zero-padded"
        );
    }
    for row in &feature_rows {
        match projector {
            _ if feat_dim == hidden => fused.extend_from_slice(row),
            Some(projector) => fused.extend_from_slice(&projector.project(row)),
            None => {
                let width = feat_dim.min(hidden);
                fused.extend_from_slice(&row[..width]);
                fused.extend(std::iter::repeat(0.0).take(hidden - width));
            }
        }
    }
    for row in &text_rows[position + 1..] {
        fused.extend_from_slice(row);
    }

    let fused_len = num_tokens - 1 + num_patches;
    debug!(
        position,
        num_patches, fused_len, "vision features spliced into prompt"
    );
    Tensor::from_vec(fused, (fused_len, hidden), text_embeddings.device()).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    const IMAGE_ID: i64 = 99;

    fn rows(data: &[&[f32]]) -> Result<Tensor> {
        let width = data[0].len();
        let flat: Vec<f32> = data.iter().flat_map(|row| row.iter().copied()).collect();
        Tensor::from_vec(flat, (data.len(), width), &Device::Cpu).map_err(Into::into)
    }

    #[test]
    fn matching_widths_are_copied_in_place() -> Result<()> {
        let text = rows(&[&[1.0, 1.0], &[0.0, 0.0], &[2.0, 2.0]])?;
        let features = rows(&[&[5.0, 6.0], &[7.0, 8.0]])?;
        let fused = fuse_embeddings(&text, &[10, IMAGE_ID, 11], IMAGE_ID, &features, None)?;
        assert_eq!(fused.shape().dims2()?, (4, 2));
        let fused = fused.to_vec2::<f32>()?;
        assert_eq!(fused[0], vec![1.0, 1.0]);
        assert_eq!(fused[1], vec![5.0, 6.0]);
        assert_eq!(fused[2], vec![7.0, 8.0]);
        assert_eq!(fused[3], vec![2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn narrow_features_are_zero_padded_without_projector() -> Result<()> {
        // Row 0 is the placeholder and disappears in the splice; row 1 survives.
        let text = rows(&[&[9.0, 9.0, 9.0], &[1.0, 1.0, 1.0]])?;
        let features = rows(&[&[4.0]])?;
        let fused = fuse_embeddings(&text, &[IMAGE_ID, 10], IMAGE_ID, &features, None)?;
        let fused = fused.to_vec2::<f32>()?;
        assert_eq!(fused[0], vec![4.0, 0.0, 0.0]);
        assert_eq!(fused[1], vec![1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn matching_widths_ignore_mismatched_projector() -> Result<()> {
        // Projector emits width 3, but rows already match the hidden width and
        // must be copied unchanged without consulting it.
        let projector =
            VisionProjector::from_raw(vec![1.0, 1.0, 1.0], vec![0.0, 0.0, 0.0], None)?;
        assert_eq!(projector.hidden(), 3);
        let text = rows(&[&[5.0, 5.0]])?;
        let features = rows(&[&[6.0, 7.0]])?;
        let fused = fuse_embeddings(&text, &[IMAGE_ID], IMAGE_ID, &features, Some(&projector))?;
        assert_eq!(fused.to_vec2::<f32>()?[0], vec![6.0, 7.0]);
        Ok(())
    }

    #[test]
    fn wide_features_are_truncated_without_projector() -> Result<()> {
        let text = rows(&[&[0.0, 0.0]])?;
        let features = rows(&[&[1.0, 2.0, 3.0, 4.0]])?;
        let fused = fuse_embeddings(&text, &[IMAGE_ID], IMAGE_ID, &features, None)?;
        assert_eq!(fused.to_vec2::<f32>()?[0], vec![1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn projector_widens_mismatched_features() -> Result<()> {
        // 2-out, 1-in identity-ish projector with zero bias.
        let projector = VisionProjector::from_raw(vec![1.0, 1.0], vec![0.0, 0.0], None)?;
        let text = rows(&[&[9.0, 9.0]])?;
        let features = rows(&[&[2.0]])?;
        let fused = fuse_embeddings(&text, &[IMAGE_ID], IMAGE_ID, &features, Some(&projector))?;
        let expected = projector.project(&[2.0]);
        assert_eq!(fused.to_vec2::<f32>()?[0], expected);
        Ok(())
    }

    #[test]
    fn projector_width_must_match_hidden() -> Result<()> {
        let projector = VisionProjector::from_raw(vec![1.0], vec![0.5], None)?;
        let text = rows(&[&[0.0, 0.0]])?;
        let features = rows(&[&[1.0]])?;
        let err = fuse_embeddings(&text, &[IMAGE_ID], IMAGE_ID, &features, Some(&projector))
            .expect_err("projector emits width 1, hidden is 2");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn prompt_without_placeholder_passes_through() -> Result<()> {
        let text = rows(&[&[1.0, 2.0], &[3.0, 4.0]])?;
        let features = rows(&[&[9.0, 9.0]])?;
        let fused = fuse_embeddings(&text, &[10, 11], IMAGE_ID, &features, None)?;
        assert_eq!(fused.to_vec2::<f32>()?, text.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn row_count_must_match_token_ids() -> Result<()> {
        let text = rows(&[&[1.0, 2.0]])?;
        let features = rows(&[&[9.0, 9.0]])?;
        assert!(fuse_embeddings(&text, &[10, IMAGE_ID], IMAGE_ID, &features, None).is_err());
        Ok(())
    }

    #[test]
    fn centered_placeholder_expands_to_expected_length() -> Result<()> {
        // Two text tokens on each side of the placeholder, four feature rows.
        let text = rows(&[&[1.0, 0.0][..]; 5])?;
        let features = rows(&[&[2.0, 2.0][..]; 4])?;
        let ids = [10, 11, IMAGE_ID, 12, 13];
        let fused = fuse_embeddings(&text, &ids, IMAGE_ID, &features, None)?;
        assert_eq!(fused.shape().dims2()?, (8, 2));
        let fused = fused.to_vec2::<f32>()?;
        assert_eq!(fused[1], vec![1.0, 0.0]);
        assert_eq!(fused[2], vec![2.0, 2.0]);
        assert_eq!(fused[5], vec![2.0, 2.0]);
        assert_eq!(fused[6], vec![1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn only_first_placeholder_is_replaced() -> Result<()> {
        let text = rows(&[&[0.0], &[1.0], &[0.0]])?;
        let features = rows(&[&[7.0]])?;
        let fused = fuse_embeddings(&text, &[IMAGE_ID, 5, IMAGE_ID], IMAGE_ID, &features, None)?;
        let fused = fused.to_vec2::<f32>()?;
        assert_eq!(fused, vec![vec![7.0], vec![1.0], vec![0.0]]);
        Ok(())
    }
}
