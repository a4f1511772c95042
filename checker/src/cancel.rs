// Cooperative cancellation shared between the passes and an interrupt handler

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Continue,
    /// Skip the rest of the current pass
    SkipPass,
    /// Stop the whole run
    Abort,
}

impl CancelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CancelState::SkipPass,
            2 => CancelState::Abort,
            _ => CancelState::Continue,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CancelState::Continue => 0,
            CancelState::SkipPass => 1,
            CancelState::Abort => 2,
        }
    }
}

/// Cloneable handle; all clones see the same state
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, state: CancelState) {
        // An abort is never downgraded to a skip
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            if current == CancelState::Abort.as_u8() {
                None
            } else {
                Some(state.as_u8())
            }
        });
    }

    pub fn poll(&self) -> CancelState {
        CancelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Clear a pending skip once the skipped pass has ended
    pub fn clear_skip(&self) {
        let _ = self.state.compare_exchange(
            CancelState::SkipPass.as_u8(),
            CancelState::Continue.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
