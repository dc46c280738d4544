//! Numeric primitives over ndarray
//!
//! Everything the two inference subsystems need from a tensor runtime,
//! implemented as free functions over contiguous f32 buffers: convolution,
//! normalization, attention, rotary application, padding, and interpolation.
//! Inner loops use linear index arithmetic rather than per-pixel object
//! graphs; matrix products go through `ndarray`'s `dot`.
//!
//! Layout conventions:
//! - Images and feature maps are channel-first `(C, H, W)`.
//! - Token sequences are `(L, D)`; per-head tensors are `(H, L, D)`.
//! - Batch is always 1 inside a single inference stream, so no batch axis is
//!   materialized.

mod attention;
mod conv;
mod interpolate;
mod ops;

pub use attention::{
    causal_mask, merge_heads, offset_mask, scaled_dot_attention, split_heads,
};
pub use conv::{conv2d, Conv2dParams};
pub use interpolate::{
    bilinear_sample_zero_pad, resize_bilinear, resize_nearest, upsample_bilinear_2x,
    upsample_nearest_2x,
};
pub use ops::{
    gelu, gelu_inplace, inverse_sigmoid, layer_norm, linear, log_softmax_1d, pad_rows_to_multiple,
    relu_inplace, rms_norm, sigmoid, sigmoid_inplace, silu, silu_inplace, softmax_axis_last,
    softmax_1d,
};
