//! Layout checkpoint loading and name normalization.
//!
//! Converted checkpoints carry a `model.` prefix and batch-norm bookkeeping
//! buffers that have no runtime counterpart; both are normalized away before
//! the module constructors take the tensors.

use std::path::Path;

use crate::error::Result;
use crate::weights::TensorMap;

/// Load and normalize the detector checkpoint from a snapshot directory.
pub fn load_layout_weights(dir: &Path) -> Result<TensorMap> {
    let mut map = TensorMap::load_dir(dir)?;
    sanitize_layout_keys(&mut map);
    Ok(map)
}

/// Key rewrite applied to every layout checkpoint tensor.
pub fn sanitize_layout_keys(map: &mut TensorMap) {
    map.rewrite_keys(|key| {
        if key.contains("num_batches_tracked") {
            return None;
        }
        // Precomputed anchor buffers are regenerated at runtime.
        if key.contains("decoder.anchors") || key.contains("decoder.valid_mask") {
            return None;
        }
        Some(key.strip_prefix("model.").unwrap_or(key).to_string())
    });
}
