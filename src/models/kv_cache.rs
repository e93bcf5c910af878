//! Concatenation-based KV cache for autoregressive generation.

use anyhow::Result;
use candle_core::Tensor;

/// Keys and values of every position seen so far, `[batch, heads, seq, head_dim]`.
#[derive(Debug, Clone, Default)]
pub struct KVCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append new keys/values along the sequence axis and return the full
    /// sequences.
    pub fn update(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let k = match &self.k {
            Some(prev) => Tensor::cat(&[prev, k], 2)?,
            None => k.clone(),
        };
        let v = match &self.v {
            Some(prev) => Tensor::cat(&[prev, v], 2)?,
            None => v.clone(),
        };
        self.k = Some(k.clone());
        self.v = Some(v.clone());
        Ok((k, v))
    }

    /// Cached positions
    pub fn seq_len(&self) -> usize {
        self.k.as_ref().and_then(|k| k.dim(2).ok()).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_update_concatenates_on_sequence_axis() {
        let device = Device::Cpu;
        let mut cache = KVCache::new();
        assert_eq!(cache.seq_len(), 0);

        let k = Tensor::zeros((1, 2, 3, 4), DType::F32, &device).unwrap();
        let v = Tensor::ones((1, 2, 3, 4), DType::F32, &device).unwrap();
        let (k_all, v_all) = cache.update(&k, &v).unwrap();
        assert_eq!(k_all.dims(), &[1, 2, 3, 4]);
        assert_eq!(v_all.dims(), &[1, 2, 3, 4]);

        let k1 = Tensor::zeros((1, 2, 1, 4), DType::F32, &device).unwrap();
        let (k_all, _) = cache.update(&k1, &k1).unwrap();
        assert_eq!(k_all.dims(), &[1, 2, 4, 4]);
        assert_eq!(cache.seq_len(), 4);

        cache.reset();
        assert_eq!(cache.seq_len(), 0);
    }
}
