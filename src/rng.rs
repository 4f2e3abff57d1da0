use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::sync::{Arc, Mutex};

/// Shared RNG wrapper used to support deterministic tests.
#[derive(Clone, Debug)]
pub struct SharedRng(pub Arc<Mutex<StdRng>>);

impl SharedRng {
    pub fn from_seed(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))))
    }

    pub fn from_entropy() -> Self {
        Self(Arc::new(Mutex::new(StdRng::from_entropy())))
    }

    pub fn fill_bytes(&self, buf: &mut [u8]) {
        if let Ok(mut rng) = self.0.lock() {
            rng.fill_bytes(buf);
        }
    }

    pub fn next_f64(&self) -> f64 {
        let mut buf = [0u8; 8];
        self.fill_bytes(&mut buf);
        (u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl Default for SharedRng {
    fn default() -> Self {
        Self::from_entropy()
    }
}
