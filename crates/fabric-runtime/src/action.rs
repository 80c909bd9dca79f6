//! Reconcile outcomes.
//!
//! Reconcilers return the [`Action`] of `kube_runtime`. A body that has just
//! written to its own object asks for [`requeue`] so the next pass sees the
//! fresh version.

use std::time::Duration;

pub use kube_runtime::controller::Action;

/// Delay of [`requeue`]
pub const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Reconcile the same object again shortly
#[must_use]
pub fn requeue() -> Action {
    Action::requeue(REQUEUE_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_differs_from_await_change() {
        assert_eq!(requeue(), Action::requeue(REQUEUE_DELAY));
        assert_ne!(requeue(), Action::await_change());
    }
}
