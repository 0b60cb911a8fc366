//! Idle detection from observed traffic timing.
//!
//! A connection is active while it has sent something within
//! `idle_after`. Past that it gets one heartbeat per idle period, and past
//! `evict_after` it is considered dead whether or not the heartbeat was
//! answered.

use crate::runtime::connection::Connection;
use crate::runtime::transport::Transport;
use std::time::{Duration, Instant};

/// What the scheduler should do with a connection this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Recent traffic; nothing to do.
    Active,
    /// Idle with no heartbeat outstanding; send one now.
    SendPing,
    /// Idle and a heartbeat is already outstanding.
    AwaitingReply,
    /// Silent past the deadline.
    Evict,
}

/// Idle and eviction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub idle_after: Duration,
    pub evict_after: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(60),
            evict_after: Duration::from_secs(80),
        }
    }
}

impl LivenessPolicy {
    pub fn new(idle_after: Duration, evict_after: Duration) -> Self {
        Self {
            idle_after,
            evict_after,
        }
    }

    /// Classify a connection from its timing fields alone.
    pub fn evaluate(&self, last_activity: Instant, ping_pending: bool, now: Instant) -> Verdict {
        let elapsed = now.saturating_duration_since(last_activity);
        if elapsed > self.evict_after {
            Verdict::Evict
        } else if elapsed > self.idle_after {
            if ping_pending {
                Verdict::AwaitingReply
            } else {
                Verdict::SendPing
            }
        } else {
            Verdict::Active
        }
    }

    /// Evaluate `conn` and record the heartbeat as outstanding when one
    /// is due. The caller sends it.
    pub fn assess<T: Transport>(&self, conn: &mut Connection<T>, now: Instant) -> Verdict {
        let verdict = self.evaluate(conn.last_activity, conn.ping_pending, now);
        if verdict == Verdict::SendPing {
            conn.ping_pending = true;
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::mock::MockTransport;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_thresholds() {
        let policy = LivenessPolicy::default();
        let t0 = Instant::now();

        assert_eq!(policy.evaluate(t0, false, t0), Verdict::Active);
        assert_eq!(policy.evaluate(t0, false, t0 + secs(60)), Verdict::Active);
        assert_eq!(policy.evaluate(t0, false, t0 + secs(61)), Verdict::SendPing);
        assert_eq!(policy.evaluate(t0, false, t0 + secs(80)), Verdict::SendPing);
        assert_eq!(policy.evaluate(t0, true, t0 + secs(80)), Verdict::AwaitingReply);
        assert_eq!(policy.evaluate(t0, false, t0 + secs(81)), Verdict::Evict);
        assert_eq!(policy.evaluate(t0, true, t0 + secs(81)), Verdict::Evict);
    }

    #[test]
    fn test_clock_before_last_activity_is_active() {
        let policy = LivenessPolicy::default();
        let t0 = Instant::now();
        assert_eq!(policy.evaluate(t0 + secs(5), false, t0), Verdict::Active);
    }

    #[test]
    fn test_assess_pings_once_per_idle_period() {
        let policy = LivenessPolicy::default();
        let (transport, _) = MockTransport::new();
        let t0 = Instant::now();
        let mut conn = Connection::new("user-1".into(), transport, t0);

        assert_eq!(policy.assess(&mut conn, t0 + secs(70)), Verdict::SendPing);
        assert!(conn.ping_pending);
        assert_eq!(policy.assess(&mut conn, t0 + secs(71)), Verdict::AwaitingReply);

        // traffic starts a new period
        conn.touch(t0 + secs(72));
        assert_eq!(policy.assess(&mut conn, t0 + secs(100)), Verdict::Active);
        assert_eq!(policy.assess(&mut conn, t0 + secs(140)), Verdict::SendPing);
    }
}
