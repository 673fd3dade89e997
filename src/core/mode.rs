//! The process-wide system mode cell.
//!
//! There is exactly one writer, the [`ModeController`], which is handed to the
//! watcher at construction. Everyone else gets a [`ModeView`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::domain::SystemMode;

/// Read-only view of the system mode
#[derive(Debug, Clone)]
pub struct ModeView {
    safe: Arc<AtomicBool>,
}

impl ModeView {
    pub fn current(&self) -> SystemMode {
        if self.is_safe() {
            SystemMode::Safe
        } else {
            SystemMode::Auto
        }
    }

    pub fn is_safe(&self) -> bool {
        self.safe.load(Ordering::SeqCst)
    }
}

/// Sole writer of the system mode. Deliberately not `Clone`.
#[derive(Debug)]
pub struct ModeController {
    safe: Arc<AtomicBool>,
}

impl ModeController {
    /// Create a fresh mode cell in `auto`, returning its writer and a view
    pub fn new() -> (Self, ModeView) {
        let safe = Arc::new(AtomicBool::new(false));
        let view = ModeView { safe: safe.clone() };
        (Self { safe }, view)
    }

    pub fn view(&self) -> ModeView {
        ModeView {
            safe: self.safe.clone(),
        }
    }

    /// Switch to safe mode. Returns false when already safe.
    pub fn enter_safe(&self) -> bool {
        !self.safe.swap(true, Ordering::SeqCst)
    }

    /// Switch back to auto mode. Returns false when already auto.
    pub fn resume(&self) -> bool {
        self.safe.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_follow_controller() {
        let (controller, view) = ModeController::new();
        let other = controller.view();
        assert_eq!(view.current(), SystemMode::Auto);

        assert!(controller.enter_safe());
        assert!(!controller.enter_safe());
        assert_eq!(view.current(), SystemMode::Safe);
        assert!(other.is_safe());

        assert!(controller.resume());
        assert!(!controller.resume());
        assert_eq!(view.current(), SystemMode::Auto);
    }
}
