//! Checkpoint loading: safetensors files into f32 ndarray tensors.
//!
//! Both models ship bf16 or f32 checkpoints; everything is widened to f32 at
//! load time. Tensors are keyed by their (possibly sanitized) checkpoint
//! names until the model constructors take ownership of them.

use std::path::Path;

use half::{bf16, f16};
use ndarray::{Array1, Array2, Array3, Array4, ArrayD, IxDyn};
use rustc_hash::FxHashMap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::error::{GlmOcrError, Result};

/// A loaded checkpoint: tensor name to f32 array.
#[derive(Debug, Default)]
pub struct TensorMap {
    tensors: FxHashMap<String, ArrayD<f32>>,
}

fn widen(view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => {
            let mut out = Vec::with_capacity(data.len() / 4);
            for chunk in data.chunks_exact(4) {
                out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
            Ok(out)
        }
        Dtype::BF16 => {
            let mut out = Vec::with_capacity(data.len() / 2);
            for chunk in data.chunks_exact(2) {
                out.push(bf16::from_le_bytes([chunk[0], chunk[1]]).to_f32());
            }
            Ok(out)
        }
        Dtype::F16 => {
            let mut out = Vec::with_capacity(data.len() / 2);
            for chunk in data.chunks_exact(2) {
                out.push(f16::from_le_bytes([chunk[0], chunk[1]]).to_f32());
            }
            Ok(out)
        }
        other => Err(GlmOcrError::config(format!(
            "unsupported checkpoint dtype {other:?}"
        ))),
    }
}

impl TensorMap {
    /// Load every `.safetensors` file in a snapshot directory.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut map = Self::default();
        let mut found = false;
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        entries.sort();
        for path in entries {
            found = true;
            map.load_file(&path)?;
        }
        if !found {
            return Err(GlmOcrError::config(format!(
                "no .safetensors files in {}",
                dir.display()
            )));
        }
        Ok(map)
    }

    /// Load one `.safetensors` file, merging into this map.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| {
            GlmOcrError::config(format!("failed to parse {}: {e}", path.display()))
        })?;
        for (name, view) in tensors.tensors() {
            let shape: Vec<usize> = view.shape().to_vec();
            let data = widen(&view)?;
            let array = ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| {
                GlmOcrError::config(format!("tensor {name} shape error: {e}"))
            })?;
            self.tensors.insert(name, array);
        }
        Ok(())
    }

    #[must_use]
    pub fn from_tensors(tensors: FxHashMap<String, ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn insert(&mut self, name: String, tensor: ArrayD<f32>) {
        self.tensors.insert(name, tensor);
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    /// Apply a key rewrite, dropping entries for which `f` returns `None`.
    pub fn rewrite_keys(&mut self, f: impl Fn(&str) -> Option<String>) {
        let old = std::mem::take(&mut self.tensors);
        for (name, tensor) in old {
            if let Some(new_name) = f(&name) {
                self.tensors.insert(new_name, tensor);
            }
        }
    }

    fn take(&mut self, name: &str) -> Result<ArrayD<f32>> {
        self.tensors
            .remove(name)
            .ok_or_else(|| GlmOcrError::config(format!("missing checkpoint tensor '{name}'")))
    }

    /// Take a tensor as a 1-D array.
    pub fn take1(&mut self, name: &str) -> Result<Array1<f32>> {
        let t = self.take(name)?;
        t.into_dimensionality().map_err(|e| {
            GlmOcrError::config(format!("tensor '{name}' is not 1-D: {e}"))
        })
    }

    /// Take a tensor as a 2-D array.
    pub fn take2(&mut self, name: &str) -> Result<Array2<f32>> {
        let t = self.take(name)?;
        t.into_dimensionality().map_err(|e| {
            GlmOcrError::config(format!("tensor '{name}' is not 2-D: {e}"))
        })
    }

    /// Take a tensor as a 3-D array.
    pub fn take3(&mut self, name: &str) -> Result<Array3<f32>> {
        let t = self.take(name)?;
        t.into_dimensionality().map_err(|e| {
            GlmOcrError::config(format!("tensor '{name}' is not 3-D: {e}"))
        })
    }

    /// Take a tensor as a 4-D array.
    pub fn take4(&mut self, name: &str) -> Result<Array4<f32>> {
        let t = self.take(name)?;
        t.into_dimensionality().map_err(|e| {
            GlmOcrError::config(format!("tensor '{name}' is not 4-D: {e}"))
        })
    }

    /// Take a tensor of any rank.
    pub fn take_dyn(&mut self, name: &str) -> Result<ArrayD<f32>> {
        self.take(name)
    }
}

/// A linear projection with weights in checkpoint `(out, in)` layout.
#[derive(Debug)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl Linear {
    /// Load `{prefix}.weight` and, when present, `{prefix}.bias`.
    pub fn load(weights: &mut TensorMap, prefix: &str) -> Result<Self> {
        let weight = weights.take2(&format!("{prefix}.weight"))?;
        let bias = weights.take1(&format!("{prefix}.bias")).ok();
        Ok(Self { weight, bias })
    }

    #[must_use]
    pub fn forward(&self, x: ndarray::ArrayView2<f32>) -> Array2<f32> {
        crate::tensor::linear(x, self.weight.view(), self.bias.as_ref().map(Array1::view))
    }

    #[inline]
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.dim().0
    }

    #[inline]
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.dim().1
    }
}

/// Layer-norm parameters.
#[derive(Debug)]
pub struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    pub fn load(weights: &mut TensorMap, prefix: &str, eps: f32) -> Result<Self> {
        Ok(Self {
            weight: weights.take1(&format!("{prefix}.weight"))?,
            bias: weights.take1(&format!("{prefix}.bias"))?,
            eps,
        })
    }

    #[must_use]
    pub fn forward(&self, x: ndarray::ArrayView2<f32>) -> Array2<f32> {
        crate::tensor::layer_norm(x, self.weight.view(), self.bias.view(), self.eps)
    }
}

/// RMS-norm parameters.
#[derive(Debug)]
pub struct RmsNorm {
    weight: Array1<f32>,
    eps: f32,
}

impl RmsNorm {
    pub fn load(weights: &mut TensorMap, prefix: &str, eps: f32) -> Result<Self> {
        Ok(Self {
            weight: weights.take1(&format!("{prefix}.weight"))?,
            eps,
        })
    }

    #[must_use]
    pub fn forward(&self, x: ndarray::ArrayView2<f32>) -> Array2<f32> {
        crate::tensor::rms_norm(x, self.weight.view(), self.eps)
    }

    /// Normalize a single vector in place (per-head query/key norms).
    pub fn forward_1d(&self, x: &mut [f32]) {
        let d = x.len();
        let mut ms = 0.0f32;
        for v in x.iter() {
            ms += *v * *v;
        }
        ms /= d as f32;
        let inv = 1.0 / (ms + self.eps).sqrt();
        for (i, v) in x.iter_mut().enumerate() {
            *v = *v * inv * self.weight[i];
        }
    }
}

/// Fold frozen batch-norm statistics into a convolution.
///
/// `W' = gamma * W / sqrt(var + eps)`, `b' = gamma * (b - mean) / sqrt(var + eps) + beta`.
/// Exact for inference with frozen statistics.
pub fn fuse_conv_bn(
    conv_weight: &mut Array4<f32>,
    conv_bias: Option<Array1<f32>>,
    bn_weight: &Array1<f32>,
    bn_bias: &Array1<f32>,
    bn_mean: &Array1<f32>,
    bn_var: &Array1<f32>,
    eps: f32,
) -> Result<Array1<f32>> {
    let out_channels = conv_weight.dim().0;
    for arr in [bn_weight, bn_bias, bn_mean, bn_var] {
        if arr.len() != out_channels {
            return Err(GlmOcrError::config(format!(
                "batch-norm parameter length {} does not match {out_channels} output channels",
                arr.len()
            )));
        }
    }
    let mut bias = conv_bias.unwrap_or_else(|| Array1::zeros(out_channels));
    for oc in 0..out_channels {
        let scale = bn_weight[oc] / (bn_var[oc] + eps).sqrt();
        conv_weight
            .index_axis_mut(ndarray::Axis(0), oc)
            .mapv_inplace(|w| w * scale);
        bias[oc] = scale * (bias[oc] - bn_mean[oc]) + bn_bias[oc];
    }
    Ok(bias)
}
