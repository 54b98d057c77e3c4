//! Tickets for cooperative cancellation.
//!
//! Every native call gets a ticket. While it runs its ticket is `current`;
//! the instruction hook aborts the Lua code once `cancelled == current`.
//! Ticket `0` means nothing is running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub(crate) struct CancelState {
    next: Arc<AtomicU64>,
    current: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
}

impl CancelState {
    pub fn next_ticket(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Marks `ticket` as the running call until the guard drops.
    pub fn begin(&self, ticket: u64) -> Running<'_> {
        self.current.store(ticket, Ordering::SeqCst);
        Running {
            state: self,
            ticket,
        }
    }

    pub fn cancel(&self, ticket: u64) {
        self.cancelled.store(ticket, Ordering::SeqCst);
    }

    /// Cancels whatever is running. `false` when idle.
    pub fn cancel_current(&self) -> bool {
        let current = self.current.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        self.cancel(current);
        true
    }

    pub fn is_cancelled(&self, ticket: u64) -> bool {
        ticket != 0 && self.cancelled.load(Ordering::SeqCst) == ticket
    }

    pub fn current_is_cancelled(&self) -> bool {
        self.is_cancelled(self.current.load(Ordering::SeqCst))
    }
}

pub(crate) struct Running<'a> {
    state: &'a CancelState,
    ticket: u64,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let _ = self.state.current.compare_exchange(
            self.ticket,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_state_has_nothing_to_cancel() {
        let state = CancelState::default();
        assert!(!state.cancel_current());
        assert!(!state.current_is_cancelled());
    }

    #[test]
    fn cancel_applies_only_to_its_ticket() {
        let state = CancelState::default();
        let first = state.next_ticket();
        let second = state.next_ticket();
        assert_ne!(first, second);

        let running = state.begin(second);
        state.cancel(first);
        assert!(!state.current_is_cancelled());

        assert!(state.cancel_current());
        assert!(state.current_is_cancelled());
        drop(running);
        assert!(!state.current_is_cancelled());
    }
}
