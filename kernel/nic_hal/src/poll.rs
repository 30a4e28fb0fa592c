//! Time and the bounded polling loop that every hardware wait is built on.

/// A monotonic millisecond clock that can also block the caller.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

/// What a single attempt inside [`poll_until`] observed.
#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus<T, E> {
    /// The condition holds; polling stops with this value.
    Ready(T),
    /// Not yet; try again after the next backoff interval.
    Pending,
    /// The condition can never be met; polling stops with this error.
    Failed(E),
}

/// The final result of [`poll_until`].
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    Ok(T),
    Timeout,
    Error(E),
}

impl<T, E> PollOutcome<T, E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollOutcome::Timeout)
    }
}

/// The sleep schedule between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    /// Sleeps the same amount between every attempt.
    pub const fn fixed(ms: u64) -> Backoff {
        Backoff { initial_ms: ms, max_ms: ms }
    }

    /// Doubles the sleep after every attempt, up to `max_ms`.
    pub const fn exponential(initial_ms: u64, max_ms: u64) -> Backoff {
        Backoff { initial_ms, max_ms }
    }
}

/// Calls `attempt` until it reports ready or failed, or until `timeout_ms` has elapsed.
///
/// `attempt` always runs at least once, even with a zero timeout.
/// Sleeps never overshoot the deadline and are at least one millisecond long.
pub fn poll_until<T, E, F>(clock: &dyn Clock, timeout_ms: u64, backoff: Backoff, mut attempt: F) -> PollOutcome<T, E>
where
    F: FnMut() -> PollStatus<T, E>,
{
    let deadline = clock.now_ms().saturating_add(timeout_ms);
    let mut interval = backoff.initial_ms.max(1);
    loop {
        match attempt() {
            PollStatus::Ready(v) => return PollOutcome::Ok(v),
            PollStatus::Failed(e) => return PollOutcome::Error(e),
            PollStatus::Pending => {}
        }
        let now = clock.now_ms();
        if now >= deadline {
            return PollOutcome::Timeout;
        }
        clock.sleep_ms(interval.min(deadline - now).max(1));
        interval = interval.saturating_mul(2).min(backoff.max_ms.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualClock;

    #[test]
    fn test_poll_ready_after_some_attempts() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let outcome: PollOutcome<u32, ()> = poll_until(&clock, 100, Backoff::fixed(1), || {
            calls += 1;
            if calls == 5 { PollStatus::Ready(7) } else { PollStatus::Pending }
        });
        assert_eq!(outcome, PollOutcome::Ok(7));
        assert_eq!(calls, 5);
        assert_eq!(clock.now_ms(), 4);
    }

    #[test]
    fn test_poll_times_out_at_deadline() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let outcome: PollOutcome<(), ()> = poll_until(&clock, 20, Backoff::fixed(3), || {
            calls += 1;
            PollStatus::Pending
        });
        assert!(outcome.is_timeout());
        assert_eq!(clock.now_ms(), 20);
        // attempts at t = 0, 3, 6, 9, 12, 15, 18, 20
        assert_eq!(calls, 8);
    }

    #[test]
    fn test_poll_error_stops_immediately() {
        let clock = ManualClock::new();
        let outcome: PollOutcome<(), &str> = poll_until(&clock, 1000, Backoff::fixed(10), || PollStatus::Failed("gone"));
        assert_eq!(outcome, PollOutcome::Error("gone"));
        assert_eq!(clock.now_ms(), 0);
    }

    #[test]
    fn test_zero_timeout_still_attempts_once() {
        let clock = ManualClock::new();
        let mut calls = 0;
        let outcome: PollOutcome<(), ()> = poll_until(&clock, 0, Backoff::fixed(1), || {
            calls += 1;
            PollStatus::Pending
        });
        assert!(outcome.is_timeout());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let clock = ManualClock::new();
        let mut stamps = alloc::vec::Vec::new();
        let _: PollOutcome<(), ()> = poll_until(&clock, 40, Backoff::exponential(1, 8), || {
            stamps.push(clock.now_ms());
            PollStatus::Pending
        });
        assert_eq!(stamps, [0, 1, 3, 7, 15, 23, 31, 39, 40]);
    }
}
