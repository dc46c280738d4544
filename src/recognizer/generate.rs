//! The autoregressive generation loop: optional vision merge, chunked
//! prefill, first-token sampling, then single-token decode steps until EOS
//! or the token budget runs out.

use ndarray::Array2;

use crate::config::RecognitionOptions;
use crate::error::Result;
use crate::pipeline::CancelToken;

use super::cache::KvCache;
use super::config::RecognizerConfig;
use super::language::{merge_vision_embeddings, GlmTextModel};
use super::prepare::PreparedInput;
use super::rope::{decode_positions, get_rope_index};
use super::sampling::{sample_token, SampleRng};
use super::vision::VisionTower;

/// Cancellation probe / cache-flush cadence inside the decode loop.
const LOOP_PROBE_INTERVAL: usize = 256;

/// Run one full generation for a prepared input.
///
/// Returns the generated token ids, EOS excluded. A fresh KV cache and
/// position state are created per call; nothing is shared across concurrent
/// recognitions.
pub fn generate(
    text_model: &GlmTextModel,
    vision_tower: &VisionTower,
    prepared: &PreparedInput,
    config: &RecognizerConfig,
    options: &RecognitionOptions,
    cancel: &CancelToken,
) -> Result<Vec<u32>> {
    cancel.check()?;

    // Embeddings, with the vision merge when pixels are present.
    let mut embeddings = text_model.embed(&prepared.input_ids)?;
    if prepared.pixel_values.nrows() > 0 {
        let features = vision_tower.forward(&prepared.pixel_values, &prepared.image_grid_thw)?;
        merge_vision_embeddings(
            &mut embeddings,
            &prepared.input_ids,
            &features,
            config.image_token_id,
            config.video_token_id,
        )?;
    }

    // M-RoPE positions for the prompt; the delta drives decode-time
    // positions. Both are scoped to this stream, so passing new pixel
    // values simply means a new call with fresh state.
    let rope = get_rope_index(
        &prepared.input_ids,
        &prepared.image_grid_thw,
        config.vision_config.spatial_merge_size,
        config.image_token_id,
        config.video_token_id,
        config.image_start_token_id,
    )?;

    let mut cache = KvCache::new(text_model.num_layers());
    let total = embeddings.nrows();
    let step = options.prefill_step_size;

    // Chunked prefill: advance the cache chunk by chunk, leaving a single
    // trailing token slot for the logits-producing call.
    let mut processed = 0usize;
    if total > step && total > 1 {
        while total - processed > 1 {
            cancel.check()?;
            let end = (processed + step).min(total - 1);
            let chunk = embeddings.slice(ndarray::s![processed..end, ..]).to_owned();
            let positions = rope
                .positions
                .slice(ndarray::s![.., processed..end])
                .to_owned();
            text_model.forward_embeddings(&chunk, &positions, &mut cache);
            processed = end;
        }
    }

    // First token from the residual prompt.
    let residual = embeddings.slice(ndarray::s![processed.., ..]).to_owned();
    let positions = rope.positions.slice(ndarray::s![.., processed..]).to_owned();
    let hidden = text_model.forward_embeddings(&residual, &positions, &mut cache);
    let mut logits = text_model.logits_last(&hidden);

    let mut rng = SampleRng::new(0);
    let mut generated: Vec<u32> = Vec::new();
    let mut next = sample_token(&mut logits, &generated, options, &mut rng);

    // Decode loop.
    loop {
        if config.eos_token_ids.contains(&next) {
            break;
        }
        generated.push(next);
        if generated.len() >= options.max_tokens {
            break;
        }
        if generated.len() % LOOP_PROBE_INTERVAL == 0 {
            cancel.check()?;
            // Memory-pressure flush point; the f32 runtime holds no pools,
            // so the probe is the whole story here.
            log::trace!("generation at {} tokens", generated.len());
        }

        let token_embedding: Array2<f32> = text_model.embed(&[next])?;
        let positions = decode_positions(cache.offset(), 1, rope.delta);
        let hidden = text_model.forward_embeddings(&token_embedding, &positions, &mut cache);
        let mut logits = text_model.logits_last(&hidden);
        next = sample_token(&mut logits, &generated, options, &mut rng);
    }

    Ok(generated)
}
