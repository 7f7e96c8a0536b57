//! Monotonic time source for window accounting.

use std::time::Instant;

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::Arc;

/// Clock handed to the RPM tracker. Anchored to [`Instant`], so wall-clock
/// jumps never expire or retain window entries spuriously.
#[derive(Clone)]
pub enum Clock {
    Monotonic { origin: Instant },
    /// Hand-advanced test clock, in milliseconds.
    #[cfg(test)]
    Manual(Arc<AtomicU64>),
}

impl Clock {
    pub fn monotonic() -> Self {
        Clock::Monotonic {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed on this clock.
    pub fn now_secs(&self) -> f64 {
        match self {
            Clock::Monotonic { origin } => origin.elapsed().as_secs_f64(),
            #[cfg(test)]
            Clock::Manual(ms) => ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }

    /// Manual clock plus the handle that advances it.
    #[cfg(test)]
    pub fn manual() -> (Self, Arc<AtomicU64>) {
        let ms = Arc::new(AtomicU64::new(0));
        (Clock::Manual(Arc::clone(&ms)), ms)
    }
}

/// Advance a manual clock by `secs`.
#[cfg(test)]
pub fn advance(handle: &Arc<AtomicU64>, secs: f64) {
    handle.fetch_add((secs * 1000.0) as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_decreases() {
        let clock = Clock::monotonic();
        let a = clock.now_secs();
        let b = clock.now_secs();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_starts_at_zero_and_advances() {
        let (clock, handle) = Clock::manual();
        assert_eq!(clock.now_secs(), 0.0);
        advance(&handle, 61.5);
        assert!((clock.now_secs() - 61.5).abs() < 1e-9);
    }

    #[test]
    fn test_manual_clones_share_time() {
        let (clock, handle) = Clock::manual();
        let other = clock.clone();
        advance(&handle, 2.0);
        assert_eq!(clock.now_secs(), other.now_secs());
    }
}
