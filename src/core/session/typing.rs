use std::time::{Duration, Instant};

/// Partner-typing flag with an auto-clear deadline.
///
/// Each inbound signal pushes the deadline out; the flag reads false once the
/// deadline passes even if nobody calls [`TypingIndicator::clear_if_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypingIndicator {
    expires_at: Option<Instant>,
}

impl TypingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a typing signal and returns the new deadline.
    pub fn signal(&mut self, now: Instant, ttl: Duration) -> Instant {
        let deadline = now + ttl;
        self.expires_at = Some(deadline);
        deadline
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now < deadline)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Returns true if the flag was set and has now been cleared.
    pub fn clear_if_expired(&mut self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) if now >= deadline => {
                self.expires_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.expires_at = None;
    }
}
