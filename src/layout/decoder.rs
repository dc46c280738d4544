//! Deformable transformer decoder with iterative box refinement.
//!
//! Anchor-based query selection feeds six decoder layers; each layer runs
//! query self-attention, deformable cross-attention into the encoder
//! features, and an FFN, then refines its reference boxes through an
//! inverse-sigmoid delta. Class, mask, and order-pointer heads read the
//! final layer's queries.
#![allow(clippy::cast_precision_loss)]

use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::error::{GlmOcrError, Result};
use crate::tensor::{
    inverse_sigmoid, merge_heads, relu_inplace, scaled_dot_attention, sigmoid, split_heads,
};
use crate::weights::{LayerNorm, Linear, TensorMap};

use super::config::LayoutModelConfig;
use super::deformable::DeformableAttention;
use super::encoder::EncoderOutputs;
use super::order::GlobalPointer;

const LN_EPS: f32 = 1e-5;
const SIGMOID_EPS: f32 = 1e-4;
/// Anchor centers/sizes outside `(ANCHOR_EPS, 1 - ANCHOR_EPS)` are invalid.
const ANCHOR_EPS: f32 = 0.01;

/// A multi-layer perceptron with ReLU between layers.
#[derive(Debug)]
pub(crate) struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub(crate) fn load(weights: &mut TensorMap, prefix: &str, num_layers: usize) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            layers.push(Linear::load(weights, &format!("{prefix}.layers.{i}"))?);
        }
        Ok(Self { layers })
    }

    pub(crate) fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let last = self.layers.len() - 1;
        let mut cur = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            cur = layer.forward(cur.view());
            if i != last {
                relu_inplace(cur.as_slice_mut().expect("contiguous mlp"));
            }
        }
        cur
    }
}

/// Standard multi-head self-attention over a query sequence.
#[derive(Debug)]
struct MultiheadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
}

impl MultiheadAttention {
    fn load(weights: &mut TensorMap, prefix: &str, num_heads: usize) -> Result<Self> {
        Ok(Self {
            q_proj: Linear::load(weights, &format!("{prefix}.q_proj"))?,
            k_proj: Linear::load(weights, &format!("{prefix}.k_proj"))?,
            v_proj: Linear::load(weights, &format!("{prefix}.v_proj"))?,
            out_proj: Linear::load(weights, &format!("{prefix}.out_proj"))?,
            num_heads,
        })
    }

    fn forward(&self, q_in: &Array2<f32>, k_in: &Array2<f32>, v_in: &Array2<f32>) -> Array2<f32> {
        let q = split_heads(self.q_proj.forward(q_in.view()).view(), self.num_heads);
        let k = split_heads(self.k_proj.forward(k_in.view()).view(), self.num_heads);
        let v = split_heads(self.v_proj.forward(v_in.view()).view(), self.num_heads);
        let head_dim = q.dim().2;
        let out = scaled_dot_attention(
            q.view(),
            k.view(),
            v.view(),
            None,
            1.0 / (head_dim as f32).sqrt(),
        );
        self.out_proj.forward(merge_heads(out.view()).view())
    }
}

/// One decoder layer.
#[derive(Debug)]
struct DecoderLayer {
    self_attn: MultiheadAttention,
    norm1: LayerNorm,
    cross_attn: DeformableAttention,
    norm2: LayerNorm,
    linear1: Linear,
    linear2: Linear,
    norm3: LayerNorm,
}

impl DecoderLayer {
    fn load(weights: &mut TensorMap, prefix: &str, config: &LayoutModelConfig) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::load(
                weights,
                &format!("{prefix}.self_attn"),
                config.num_heads,
            )?,
            norm1: LayerNorm::load(weights, &format!("{prefix}.norm1"), LN_EPS)?,
            cross_attn: DeformableAttention::load(
                weights,
                &format!("{prefix}.cross_attn"),
                config.d_model,
                config.num_heads,
                config.num_levels,
                config.num_decoder_points,
            )?,
            norm2: LayerNorm::load(weights, &format!("{prefix}.norm2"), LN_EPS)?,
            linear1: Linear::load(weights, &format!("{prefix}.linear1"))?,
            linear2: Linear::load(weights, &format!("{prefix}.linear2"))?,
            norm3: LayerNorm::load(weights, &format!("{prefix}.norm3"), LN_EPS)?,
        })
    }

    fn forward(
        &self,
        target: &Array2<f32>,
        query_pos: &Array2<f32>,
        encoder_states: ArrayView2<f32>,
        spatial_shapes: &[(usize, usize)],
        reference_points: &Array2<f32>,
    ) -> Result<Array2<f32>> {
        // Self-attention with learned position embedding on q and k.
        let q = target + query_pos;
        let attn = self.self_attn.forward(&q, &q, target);
        let target = self.norm1.forward((target + &attn).view());

        // Deformable cross-attention.
        let q = &target + query_pos;
        let cross = self.cross_attn.forward(
            q.view(),
            encoder_states,
            spatial_shapes,
            reference_points.view(),
        )?;
        let target = self.norm2.forward((&target + &cross).view());

        // FFN.
        let mut ffn = self.linear1.forward(target.view());
        relu_inplace(ffn.as_slice_mut().expect("contiguous ffn"));
        let ffn = self.linear2.forward(ffn.view());
        Ok(self.norm3.forward((&target + &ffn).view()))
    }
}

/// Raw model outputs for one page.
#[derive(Debug)]
pub struct LayoutPrediction {
    /// `(Q, C)` class logits.
    pub logits: Array2<f32>,
    /// `(Q, 4)` boxes as normalized `cx, cy, w, h`.
    pub pred_boxes: Array2<f32>,
    /// `(Q, Q)` pairwise order-pointer logits.
    pub order_logits: Array2<f32>,
    /// `(Q, Mh, Mw)` mask logits.
    pub out_masks: Array3<f32>,
}

/// The query-selection encoder head plus the decoder stack.
#[derive(Debug)]
pub struct LayoutDecoder {
    enc_output_proj: Linear,
    enc_output_norm: LayerNorm,
    enc_score_head: Linear,
    enc_bbox_head: Mlp,
    query_pos_head: Mlp,
    layers: Vec<DecoderLayer>,
    dec_score_head: Vec<Linear>,
    dec_bbox_head: Vec<Mlp>,
    mask_query_head: Mlp,
    decoder_norm: LayerNorm,
    global_pointer: GlobalPointer,
    config: LayoutModelConfig,
}

impl LayoutDecoder {
    pub fn load(weights: &mut TensorMap, config: &LayoutModelConfig) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.num_decoder_layers);
        let mut dec_score_head = Vec::with_capacity(config.num_decoder_layers);
        let mut dec_bbox_head = Vec::with_capacity(config.num_decoder_layers);
        for i in 0..config.num_decoder_layers {
            layers.push(DecoderLayer::load(
                weights,
                &format!("decoder.layers.{i}"),
                config,
            )?);
            dec_score_head.push(Linear::load(weights, &format!("decoder.score_head.{i}"))?);
            dec_bbox_head.push(Mlp::load(weights, &format!("decoder.bbox_head.{i}"), 3)?);
        }
        Ok(Self {
            enc_output_proj: Linear::load(weights, "decoder.enc_output.proj")?,
            enc_output_norm: LayerNorm::load(weights, "decoder.enc_output.norm", LN_EPS)?,
            enc_score_head: Linear::load(weights, "decoder.enc_score_head")?,
            enc_bbox_head: Mlp::load(weights, "decoder.enc_bbox_head", 3)?,
            query_pos_head: Mlp::load(weights, "decoder.query_pos_head", 2)?,
            layers,
            dec_score_head,
            dec_bbox_head,
            mask_query_head: Mlp::load(weights, "decoder.mask_query_head", 3)?,
            decoder_norm: LayerNorm::load(weights, "decoder.norm", LN_EPS)?,
            global_pointer: GlobalPointer::load(
                weights,
                "decoder.global_pointer",
                config.global_pointer_head_size,
            )?,
            config: config.clone(),
        })
    }

    /// Anchors and their validity for every level token.
    ///
    /// Invalid anchors (any coordinate outside `(0.01, 0.99)`) get a
    /// positive-infinity sentinel so their sigmoid saturates; their memory
    /// rows are zeroed by the valid mask instead.
    fn generate_anchors(&self, spatial_shapes: &[(usize, usize)]) -> (Array2<f32>, Vec<bool>) {
        let total: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
        let mut anchors = Array2::<f32>::zeros((total, 4));
        let mut valid = vec![true; total];
        let mut row = 0usize;
        for (level, (h, w)) in spatial_shapes.iter().enumerate() {
            let wh = self.config.grid_size * 2.0f32.powi(level as i32);
            for y in 0..*h {
                for x in 0..*w {
                    let cx = (x as f32 + 0.5) / *w as f32;
                    let cy = (y as f32 + 0.5) / *h as f32;
                    let coords = [cx, cy, wh, wh];
                    let ok = coords
                        .iter()
                        .all(|c| *c > ANCHOR_EPS && *c < 1.0 - ANCHOR_EPS);
                    valid[row] = ok;
                    for (i, c) in coords.iter().enumerate() {
                        anchors[[row, i]] = if ok {
                            inverse_sigmoid(*c, SIGMOID_EPS)
                        } else {
                            f32::INFINITY
                        };
                    }
                    row += 1;
                }
            }
        }
        (anchors, valid)
    }

    /// Full decoder forward over the encoder outputs.
    pub fn forward(&self, encoder: &EncoderOutputs) -> Result<LayoutPrediction> {
        let spatial_shapes: Vec<(usize, usize)> = encoder
            .features
            .iter()
            .map(|f| (f.dim().1, f.dim().2))
            .collect();

        // Flatten levels into one (S, d_model) sequence.
        let total: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
        let d_model = self.config.d_model;
        let mut memory = Array2::<f32>::zeros((total, d_model));
        let mut row = 0usize;
        for feat in &encoder.features {
            let (c, h, w) = feat.dim();
            for y in 0..h {
                for x in 0..w {
                    for ch in 0..c {
                        memory[[row, ch]] = feat[[ch, y, x]];
                    }
                    row += 1;
                }
            }
        }

        let (anchors, valid) = self.generate_anchors(&spatial_shapes);

        // Zero invalid rows, project, norm.
        let mut gated = memory.clone();
        for (i, ok) in valid.iter().enumerate() {
            if !ok {
                gated.row_mut(i).fill(0.0);
            }
        }
        let output_memory = self
            .enc_output_norm
            .forward(self.enc_output_proj.forward(gated.view()).view());

        let enc_logits = self.enc_score_head.forward(output_memory.view());
        let mut coord_logits = self.enc_bbox_head.forward(output_memory.view());
        coord_logits += &anchors;

        // Top num_queries tokens by max class logit, ties by token index.
        let mut ranked: Vec<(f32, usize)> = enc_logits
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, logits)| {
                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                (max, i)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let num_queries = self.config.num_queries.min(ranked.len());
        let selected: Vec<usize> = ranked[..num_queries].iter().map(|(_, i)| *i).collect();

        let mut target = Array2::<f32>::zeros((num_queries, d_model));
        let mut ref_unact = Array2::<f32>::zeros((num_queries, 4));
        for (q, &token) in selected.iter().enumerate() {
            target.row_mut(q).assign(&output_memory.row(token));
            ref_unact.row_mut(q).assign(&coord_logits.row(token));
        }

        // Mask-enhanced box re-initialization.
        if self.config.mask_enhanced {
            let normed = self.decoder_norm.forward(target.view());
            let queries = self.mask_query_head.forward(normed.view());
            let boxes = mask_to_boxes(
                &query_masks(&queries, &encoder.mask_features),
                self.config.mask_size,
            );
            for q in 0..num_queries {
                for i in 0..4 {
                    ref_unact[[q, i]] = inverse_sigmoid(boxes[[q, i]], SIGMOID_EPS);
                }
            }
        }

        // Decoder stack with iterative refinement.
        let mut hidden = target;
        for (i, layer) in self.layers.iter().enumerate() {
            let mut reference = ref_unact.clone();
            reference.mapv_inplace(sigmoid);
            let query_pos = self.query_pos_head.forward(reference.view());
            hidden = layer.forward(
                &hidden,
                &query_pos,
                memory.view(),
                &spatial_shapes,
                &reference,
            )?;
            let delta = self.dec_bbox_head[i].forward(hidden.view());
            for q in 0..num_queries {
                for c in 0..4 {
                    ref_unact[[q, c]] =
                        inverse_sigmoid(reference[[q, c]], SIGMOID_EPS) + delta[[q, c]];
                }
            }
        }

        let logits = self.dec_score_head[self.layers.len() - 1].forward(hidden.view());
        let mut pred_boxes = ref_unact;
        pred_boxes.mapv_inplace(sigmoid);

        let normed = self.decoder_norm.forward(hidden.view());
        let mask_queries = self.mask_query_head.forward(normed.view());
        let out_masks = query_masks_3d(&mask_queries, &encoder.mask_features);
        let order_logits = self.global_pointer.logits(normed.view());

        Ok(LayoutPrediction {
            logits,
            pred_boxes,
            order_logits,
            out_masks,
        })
    }
}

/// Dot mask queries with flattened mask features: `(Q, C) x (C, Mh*Mw)`.
fn query_masks(queries: &Array2<f32>, mask_features: &Array3<f32>) -> Array2<f32> {
    let (c, mh, mw) = mask_features.dim();
    let flat = mask_features
        .view()
        .into_shape_with_order((c, mh * mw))
        .expect("contiguous mask features");
    queries.dot(&flat)
}

/// Same as [`query_masks`] but reshaped to `(Q, Mh, Mw)`.
fn query_masks_3d(queries: &Array2<f32>, mask_features: &Array3<f32>) -> Array3<f32> {
    let (_, mh, mw) = mask_features.dim();
    let q = queries.nrows();
    query_masks(queries, mask_features)
        .into_shape_with_order((q, mh, mw))
        .expect("mask reshape")
}

/// Tight normalized boxes of the positive-mask region per query.
///
/// Falls back to a tiny centered box when a query has no positive pixels.
fn mask_to_boxes(masks: &Array2<f32>, mask_size: (usize, usize)) -> Array2<f32> {
    let (mh, mw) = mask_size;
    let q = masks.nrows();
    let mut boxes = Array2::<f32>::zeros((q, 4));
    for qi in 0..q {
        let row = masks.row(qi);
        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut any = false;
        for y in 0..mh {
            for x in 0..mw {
                if row[y * mw + x] > 0.0 {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }
        if any {
            let w = (max_x - min_x + 1) as f32 / mw as f32;
            let h = (max_y - min_y + 1) as f32 / mh as f32;
            boxes[[qi, 0]] = (min_x as f32 + (max_x - min_x + 1) as f32 / 2.0) / mw as f32;
            boxes[[qi, 1]] = (min_y as f32 + (max_y - min_y + 1) as f32 / 2.0) / mh as f32;
            boxes[[qi, 2]] = w;
            boxes[[qi, 3]] = h;
        } else {
            boxes[[qi, 0]] = 0.5;
            boxes[[qi, 1]] = 0.5;
            boxes[[qi, 2]] = 1.0 / mw as f32;
            boxes[[qi, 3]] = 1.0 / mh as f32;
        }
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use rustc_hash::FxHashMap;

    /// A decoder small enough to run end to end: one layer, two levels, two
    /// classes, three queries.
    fn tiny_decoder() -> (LayoutDecoder, LayoutModelConfig) {
        let config = LayoutModelConfig {
            d_model: 4,
            num_queries: 3,
            num_classes: 2,
            num_decoder_layers: 1,
            num_heads: 2,
            num_levels: 2,
            num_decoder_points: 1,
            mask_size: (4, 4),
            mask_feature_channels: 2,
            mask_enhanced: true,
            global_pointer_head_size: 2,
            feat_strides: vec![1, 2],
            ..LayoutModelConfig::default()
        };
        let d = config.d_model;
        let mut tensors: FxHashMap<String, ArrayD<f32>> = FxHashMap::default();
        let mut linear = |name: &str, out_d: usize, in_d: usize| {
            tensors.insert(
                format!("{name}.weight"),
                ArrayD::from_shape_fn(IxDyn(&[out_d, in_d]), |idx| {
                    0.05 * ((idx[0] + 2 * idx[1]) % 3) as f32
                }),
            );
        };
        linear("decoder.enc_output.proj", d, d);
        linear("decoder.enc_score_head", config.num_classes, d);
        linear("decoder.score_head.0", config.num_classes, d);
        for i in 0..3 {
            linear(&format!("decoder.enc_bbox_head.layers.{i}"), if i == 2 { 4 } else { d }, d);
            linear(&format!("decoder.bbox_head.0.layers.{i}"), if i == 2 { 4 } else { d }, d);
            linear(
                &format!("decoder.mask_query_head.layers.{i}"),
                if i == 2 { config.mask_feature_channels } else { d },
                d,
            );
        }
        linear("decoder.query_pos_head.layers.0", 2 * d, 4);
        linear("decoder.query_pos_head.layers.1", d, 2 * d);
        for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
            linear(&format!("decoder.layers.0.self_attn.{proj}"), d, d);
        }
        let lp = config.num_heads * config.num_levels * config.num_decoder_points;
        linear("decoder.layers.0.cross_attn.sampling_offsets", lp * 2, d);
        linear("decoder.layers.0.cross_attn.attention_weights", lp, d);
        linear("decoder.layers.0.cross_attn.value_proj", d, d);
        linear("decoder.layers.0.cross_attn.output_proj", d, d);
        linear("decoder.layers.0.linear1", 2 * d, d);
        linear("decoder.layers.0.linear2", d, 2 * d);
        linear("decoder.global_pointer", 2 * config.global_pointer_head_size, d);
        for norm in [
            "decoder.enc_output.norm",
            "decoder.layers.0.norm1",
            "decoder.layers.0.norm2",
            "decoder.layers.0.norm3",
            "decoder.norm",
        ] {
            tensors.insert(
                format!("{norm}.weight"),
                ArrayD::from_elem(IxDyn(&[d]), 1.0),
            );
            tensors.insert(format!("{norm}.bias"), ArrayD::from_elem(IxDyn(&[d]), 0.0));
        }
        let mut map = TensorMap::from_tensors(tensors);
        let decoder = LayoutDecoder::load(&mut map, &config).unwrap();
        assert!(map.is_empty(), "unused decoder tensors: {:?}", map.keys().collect::<Vec<_>>());
        (decoder, config)
    }

    #[test]
    fn test_tiny_decoder_end_to_end_shapes() {
        let (decoder, config) = tiny_decoder();
        let encoder = EncoderOutputs {
            features: vec![
                Array3::<f32>::from_elem((4, 2, 2), 0.3),
                Array3::<f32>::from_elem((4, 1, 1), -0.2),
            ],
            mask_features: Array3::<f32>::from_elem((2, 4, 4), 0.1),
        };
        let prediction = decoder.forward(&encoder).unwrap();

        assert_eq!(prediction.logits.dim(), (3, config.num_classes));
        assert_eq!(prediction.pred_boxes.dim(), (3, 4));
        assert_eq!(prediction.order_logits.dim(), (3, 3));
        assert_eq!(prediction.out_masks.dim(), (3, 4, 4));
        for v in prediction.logits.iter().chain(prediction.out_masks.iter()) {
            assert!(v.is_finite());
        }
        // Boxes are sigmoid outputs.
        for v in prediction.pred_boxes.iter() {
            assert!((0.0..=1.0).contains(v));
        }
        // Lower triangle of the order logits is masked.
        assert_eq!(prediction.order_logits[[0, 0]], -10_000.0);
        assert_eq!(prediction.order_logits[[2, 1]], -10_000.0);
    }

    #[test]
    fn test_mask_to_boxes_tight() {
        // Single query, 4x4 mask with positives in rows 1..=2, cols 2..=3.
        let mut mask = Array2::<f32>::from_elem((1, 16), -1.0);
        for y in 1..3 {
            for x in 2..4 {
                mask[[0, y * 4 + x]] = 1.0;
            }
        }
        let boxes = mask_to_boxes(&mask, (4, 4));
        assert!((boxes[[0, 2]] - 0.5).abs() < 1e-6); // width 2/4
        assert!((boxes[[0, 3]] - 0.5).abs() < 1e-6);
        assert!((boxes[[0, 0]] - 0.75).abs() < 1e-6); // centered over cols 2..4
        assert!((boxes[[0, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mask_to_boxes_empty_fallback() {
        let mask = Array2::<f32>::from_elem((1, 16), -1.0);
        let boxes = mask_to_boxes(&mask, (4, 4));
        assert_eq!(boxes[[0, 0]], 0.5);
        assert_eq!(boxes[[0, 1]], 0.5);
        assert!(boxes[[0, 2]] <= 0.25);
    }

    #[test]
    fn test_query_masks_shapes() {
        let queries = Array2::<f32>::ones((2, 3));
        let features = Array3::<f32>::ones((3, 4, 5));
        let masks = query_masks_3d(&queries, &features);
        assert_eq!(masks.dim(), (2, 4, 5));
        assert_eq!(masks[[0, 0, 0]], 3.0);
    }
}
