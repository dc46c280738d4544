//! Per-layer key/value cache for incremental decoding.
//!
//! Capacity grows in fixed 256-token blocks; `offset` is the live length and
//! only `[..offset]` is ever read. A cache belongs to exactly one
//! recognition stream and is never shared across concurrent calls.

use ndarray::{Array3, ArrayView3};

/// Cache block granularity in tokens.
pub const CACHE_BLOCK: usize = 256;

/// One attention layer's cache, `(H_kv, capacity, D)` with batch 1.
#[derive(Debug, Default)]
pub struct LayerKvCache {
    keys: Option<Array3<f32>>,
    values: Option<Array3<f32>>,
    offset: usize,
}

impl LayerKvCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Append `new_keys`/`new_values` of shape `(H_kv, L, D)` and return the
    /// live `(H_kv, offset, D)` views.
    pub fn update_and_fetch(
        &mut self,
        new_keys: ArrayView3<f32>,
        new_values: ArrayView3<f32>,
    ) -> (ArrayView3<f32>, ArrayView3<f32>) {
        let (h_kv, step, dk) = new_keys.dim();
        let dv = new_values.dim().2;
        debug_assert_eq!(new_values.dim().0, h_kv);
        debug_assert_eq!(new_values.dim().1, step);

        let needed = self.offset + step;
        let capacity = self.keys.as_ref().map_or(0, |k| k.dim().1);
        if needed > capacity {
            let new_capacity = needed.div_ceil(CACHE_BLOCK) * CACHE_BLOCK;
            let mut keys = Array3::<f32>::zeros((h_kv, new_capacity, dk));
            let mut values = Array3::<f32>::zeros((h_kv, new_capacity, dv));
            if let (Some(old_k), Some(old_v)) = (&self.keys, &self.values) {
                keys.slice_mut(ndarray::s![.., ..self.offset, ..])
                    .assign(&old_k.slice(ndarray::s![.., ..self.offset, ..]));
                values
                    .slice_mut(ndarray::s![.., ..self.offset, ..])
                    .assign(&old_v.slice(ndarray::s![.., ..self.offset, ..]));
            }
            self.keys = Some(keys);
            self.values = Some(values);
        }

        let keys = self.keys.as_mut().expect("cache allocated");
        let values = self.values.as_mut().expect("cache allocated");
        keys.slice_mut(ndarray::s![.., self.offset..needed, ..])
            .assign(&new_keys);
        values
            .slice_mut(ndarray::s![.., self.offset..needed, ..])
            .assign(&new_values);
        self.offset = needed;

        (
            self.keys
                .as_ref()
                .expect("cache allocated")
                .slice(ndarray::s![.., ..self.offset, ..]),
            self.values
                .as_ref()
                .expect("cache allocated")
                .slice(ndarray::s![.., ..self.offset, ..]),
        )
    }
}

/// The full stack of layer caches for one recognition stream.
#[derive(Debug, Default)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
}

impl KvCache {
    #[must_use]
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerKvCache::new()).collect(),
        }
    }

    #[inline]
    #[must_use]
    pub fn layer(&mut self, index: usize) -> &mut LayerKvCache {
        &mut self.layers[index]
    }

    /// Tokens cached so far (identical across layers after a full forward).
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.layers.first().map_or(0, LayerKvCache::offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_grows_in_blocks() {
        let mut cache = LayerKvCache::new();
        let keys = Array3::<f32>::ones((2, 10, 4));
        let values = Array3::<f32>::ones((2, 10, 4));
        let (k, v) = cache.update_and_fetch(keys.view(), values.view());
        assert_eq!(k.dim(), (2, 10, 4));
        assert_eq!(v.dim(), (2, 10, 4));
        assert_eq!(cache.offset(), 10);
        // Backing store is one 256 block.
        assert_eq!(cache.keys.as_ref().unwrap().dim().1, CACHE_BLOCK);
    }

    #[test]
    fn test_cache_appends_monotonically() {
        let mut cache = LayerKvCache::new();
        let a = Array3::<f32>::from_elem((1, 3, 2), 1.0);
        let b = Array3::<f32>::from_elem((1, 2, 2), 2.0);
        cache.update_and_fetch(a.view(), a.view());
        let (k, _) = cache.update_and_fetch(b.view(), b.view());
        assert_eq!(k[[0, 0, 0]], 1.0);
        assert_eq!(k[[0, 3, 0]], 2.0);
        drop(k);
        assert_eq!(cache.offset(), 5);
    }

    #[test]
    fn test_cache_reallocates_past_block() {
        let mut cache = LayerKvCache::new();
        let chunk = Array3::<f32>::ones((1, 200, 2));
        cache.update_and_fetch(chunk.view(), chunk.view());
        cache.update_and_fetch(chunk.view(), chunk.view());
        assert_eq!(cache.offset(), 400);
        assert_eq!(cache.keys.as_ref().unwrap().dim().1, 512);
    }

    #[test]
    fn test_stack_offsets() {
        let mut cache = KvCache::new(2);
        let k = Array3::<f32>::ones((1, 4, 2));
        cache.layer(0).update_and_fetch(k.view(), k.view());
        cache.layer(1).update_and_fetch(k.view(), k.view());
        assert_eq!(cache.offset(), 4);
    }
}
