//! Beacon schedule arithmetic and schedule-aligned waits
//!
//! Rounds are derived from the genesis time and the period only:
//! `round(t) = floor((t - genesis) / period) + 1` for `t >= genesis`, and `0`
//! before genesis. Every wait helper sleeps past the computed boundary by a
//! fixed margin so that all nodes have produced the round before it is
//! checked.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Margin slept after genesis before the first check
pub const GENESIS_MARGIN: Duration = Duration::from_secs(3);

/// Margin slept after a transition or a period boundary
pub const AFTER_PERIOD_WAIT: Duration = Duration::from_secs(5);

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Current unix time in whole seconds
    fn unix(&self) -> i64 {
        self.now().timestamp()
    }
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock read once at construction and advanced by tokio's monotonic
/// timer afterwards, so it follows a paused runtime clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl MonotonicClock {
    /// Anchor the clock at the current wall-clock time
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor the clock at a given time
    pub fn anchored_at(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }
}

fn period_secs(period: Duration) -> i64 {
    period.as_secs().max(1) as i64
}

/// Round produced at unix time `t`, `0` before genesis
pub fn round_at(t: i64, genesis: i64, period: Duration) -> u64 {
    if t < genesis {
        return 0;
    }
    ((t - genesis) / period_secs(period)) as u64 + 1
}

/// Unix time at which `round` starts
pub fn round_start(round: u64, genesis: i64, period: Duration) -> i64 {
    if round == 0 {
        return genesis;
    }
    genesis + (round as i64 - 1) * period_secs(period)
}

/// Next round to be produced after `t` and the time it starts
pub fn next_round(t: i64, genesis: i64, period: Duration) -> (u64, i64) {
    if t < genesis {
        return (1, genesis);
    }
    let next = round_at(t, genesis, period) + 1;
    (next, round_start(next, genesis, period))
}

/// Time left from `now` until unix time `target`, zero if already passed
pub fn until(now: DateTime<Utc>, target: i64) -> Duration {
    let millis = target * 1000 - now.timestamp_millis();
    Duration::from_millis(millis.max(0) as u64)
}

/// Schedule-aligned waits over an injectable clock
#[derive(Clone)]
pub struct ScheduleClock {
    clock: Arc<dyn Clock>,
}

impl ScheduleClock {
    /// Create a schedule over a clock
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Underlying clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current unix time
    pub fn now_unix(&self) -> i64 {
        self.clock.unix()
    }

    /// Round being produced right now
    pub fn current_round(&self, genesis: i64, period: Duration) -> u64 {
        round_at(self.clock.unix(), genesis, period)
    }

    /// Next round and its start time, as seen now
    pub fn next_round(&self, genesis: i64, period: Duration) -> (u64, i64) {
        next_round(self.clock.unix(), genesis, period)
    }

    /// Sleep until genesis, then leave some time for the first rounds
    pub async fn wait_for_genesis(&self, genesis: i64) {
        let to = until(self.clock.now(), genesis);
        info!(secs = to.as_secs(), "Sleeping until genesis");
        tokio::time::sleep(to).await;
        info!(margin = ?GENESIS_MARGIN, "Sleeping after genesis to leave time for rounds");
        tokio::time::sleep(GENESIS_MARGIN).await;
    }

    /// Sleep until the transition to a reshared group, then leave some time
    /// for the new group to produce
    pub async fn wait_for_transition(&self, transition: i64, genesis: i64, period: Duration) {
        let to = until(self.clock.now(), transition);
        let transition_round = round_at(transition, genesis, period);
        info!(
            wait = ?to,
            transition,
            round = transition_round,
            "Sleeping until transition"
        );
        tokio::time::sleep(to).await;
        info!(margin = ?AFTER_PERIOD_WAIT, "Sleeping after transition to leave time for nodes");
        tokio::time::sleep(AFTER_PERIOD_WAIT).await;
    }

    /// Sleep until the next round boundary plus a margin
    pub async fn wait_for_next_period(&self, genesis: i64, period: Duration) {
        let (round, start) = self.next_round(genesis, period);
        let to = until(self.clock.now(), start) + AFTER_PERIOD_WAIT;
        info!(secs = to.as_secs(), round, "Sleeping to reach next round");
        tokio::time::sleep(to).await;
    }

    /// Plain pacing sleep
    pub async fn wait(&self, duration: Duration) {
        info!(?duration, "Sleeping to leave time to sync and start again");
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PERIOD: Duration = Duration::from_secs(2);

    #[test]
    fn test_round_at() {
        let genesis = 1_000;
        assert_eq!(round_at(999, genesis, PERIOD), 0);
        assert_eq!(round_at(0, genesis, PERIOD), 0);
        assert_eq!(round_at(1_000, genesis, PERIOD), 1);
        assert_eq!(round_at(1_001, genesis, PERIOD), 1);
        assert_eq!(round_at(1_002, genesis, PERIOD), 2);
        assert_eq!(round_at(1_009, genesis, PERIOD), 5);
    }

    #[test]
    fn test_round_at_matches_formula() {
        let genesis = 1_700_000_000;
        for period in [1u64, 2, 3, 30] {
            let period = Duration::from_secs(period);
            for offset in 0..200i64 {
                let expected = (offset / period.as_secs() as i64) as u64 + 1;
                assert_eq!(round_at(genesis + offset, genesis, period), expected);
            }
        }
    }

    #[test]
    fn test_next_round() {
        let genesis = 1_000;
        assert_eq!(next_round(900, genesis, PERIOD), (1, 1_000));
        assert_eq!(next_round(1_000, genesis, PERIOD), (2, 1_002));
        assert_eq!(next_round(1_003, genesis, PERIOD), (3, 1_004));

        // the last completed round is always the current one
        let (next, _) = next_round(1_007, genesis, PERIOD);
        assert_eq!(next - 1, round_at(1_007, genesis, PERIOD));
    }

    #[test]
    fn test_round_start_inverts_round_at() {
        let genesis = 500;
        for round in 1..50 {
            let start = round_start(round, genesis, PERIOD);
            assert_eq!(round_at(start, genesis, PERIOD), round);
            assert_eq!(round_at(start - 1, genesis, PERIOD), round - 1);
        }
    }

    #[test]
    fn test_until() {
        let now = Utc.timestamp_millis_opt(10_500).unwrap();
        assert_eq!(until(now, 12), Duration::from_millis(1_500));
        assert_eq!(until(now, 10), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_genesis_lands_past_genesis() {
        let clock = Arc::new(MonotonicClock::anchored_at(Utc.timestamp_opt(1_000, 0).unwrap()));
        let schedule = ScheduleClock::new(clock.clone());

        schedule.wait_for_genesis(1_010).await;

        assert_eq!(clock.unix(), 1_010 + GENESIS_MARGIN.as_secs() as i64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_next_period() {
        let clock = Arc::new(MonotonicClock::anchored_at(Utc.timestamp_opt(1_003, 0).unwrap()));
        let schedule = ScheduleClock::new(clock.clone());

        schedule.wait_for_next_period(1_000, PERIOD).await;

        // next boundary after 1003 is 1004, plus the margin
        assert_eq!(clock.unix(), 1_004 + AFTER_PERIOD_WAIT.as_secs() as i64);
    }
}
