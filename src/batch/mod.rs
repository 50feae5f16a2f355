//! Batch ingestion subsystem.
//!
//! Two entry points share the admission layer in [`memory`]: the stream
//! processor replays arrays of offline-buffered samples with adaptive
//! chunking, and the delta processor reconstructs full payloads from
//! partial samples against a per-device base state. Both report progress
//! as a stream of JSON events consumed by the SSE handlers.

pub mod delta;
pub mod memory;
pub mod stream;

pub use memory::{generate_batch_id, BatchMemoryConfig, BatchMemoryManager};

use std::sync::Arc;

/// Hook invoked under critical memory pressure: holders of reclaimable
/// scratch buffers drop what they can afford to lose.
pub trait ScratchRelease: Send + Sync {
    fn release_scratch(&self);
}

/// RAII batch reservation; dropping it releases the memory.
pub struct BatchReservation {
    memory: Arc<BatchMemoryManager>,
    batch_id: String,
}

impl BatchReservation {
    /// Reserve memory for a batch, failing with the admission error.
    pub fn acquire(
        memory: Arc<BatchMemoryManager>,
        batch_id: &str,
        estimated_mb: f64,
    ) -> Result<Self, crate::error::Backpressure> {
        // ---
        memory.request(batch_id, estimated_mb)?;
        Ok(Self {
            memory,
            batch_id: batch_id.to_string(),
        })
    }
}

impl Drop for BatchReservation {
    fn drop(&mut self) {
        self.memory.release(&self.batch_id);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use memory::FixedProbe;

    #[test]
    fn reservation_releases_on_drop() {
        // ---
        let memory = Arc::new(BatchMemoryManager::new(
            BatchMemoryConfig::default(),
            Arc::new(FixedProbe::new(100.0)),
        ));
        {
            let _r = BatchReservation::acquire(memory.clone(), "b1", 40.0).unwrap();
            assert_eq!(memory.reserved_mb(), 40.0);
        }
        assert_eq!(memory.reserved_mb(), 0.0);
        assert_eq!(memory.active_count(), 0);
    }

    #[test]
    fn reservation_releases_on_panic_path() {
        // ---
        let memory = Arc::new(BatchMemoryManager::new(
            BatchMemoryConfig::default(),
            Arc::new(FixedProbe::new(100.0)),
        ));
        let m = memory.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _r = BatchReservation::acquire(m, "b1", 40.0).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(memory.reserved_mb(), 0.0);
    }
}
