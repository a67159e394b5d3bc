use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

static STATE: Mutex<Weak<Initialization>> = Mutex::new(Weak::new());

/// Token proving the library's process-wide setup is active.
///
/// Every [`Multi`](crate::Multi) and [`TransferHandle`](crate::TransferHandle)
/// holds one. Setup runs when the first token is acquired and teardown runs
/// when the last one is dropped, so the setup stays active for as long as any
/// component that needs it is alive.
#[derive(Debug)]
pub struct Initialization {
    _private: (),
}

impl Initialization {
    /// Returns a token for the active setup, performing setup if no token is
    /// currently alive.
    pub fn ensure() -> Arc<Self> {
        let mut state = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = state.upgrade() {
            return active;
        }
        debug!("Initializing transfer library");
        let token = Arc::new(Self { _private: () });
        *state = Arc::downgrade(&token);
        token
    }

    /// Returns true if any token is currently alive.
    pub fn is_active() -> bool {
        STATE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .strong_count()
            > 0
    }
}

impl Drop for Initialization {
    fn drop(&mut self) {
        debug!("Releasing transfer library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_share_one_setup() {
        let first = Initialization::ensure();
        let second = Initialization::ensure();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Initialization::is_active());
    }
}
