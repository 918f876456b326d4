use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::gateway::Activity;

pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    IdleTimeout,
    HardTimeout,
    Signal,
    ServiceExited,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IdleTimeout => "idle timeout",
            Self::HardTimeout => "hard timeout",
            Self::Signal => "signal",
            Self::ServiceExited => "service exited",
        })
    }
}

/// Resolves once the instance should be torn down: at `hard_deadline`
/// regardless of activity, or once nothing has been in flight for `idle`.
///
/// The deadline is fixed when the instance starts, so time spent starting
/// up counts against it.
pub async fn watch(activity: Arc<Activity>, idle: Duration, hard_deadline: Instant) -> StopReason {
    let hard = sleep_until(hard_deadline);
    tokio::pin!(hard);
    let mut tick = interval(TICK.min(idle).max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut hard => {
                tracing::warn!("hard timeout reached");
                return StopReason::HardTimeout;
            }
            _ = tick.tick() => {
                if activity.in_flight() == 0 && activity.idle_for() >= idle {
                    tracing::info!(idle_secs = idle.as_secs(), "instance idle, scaling down");
                    return StopReason::IdleTimeout;
                }
            }
        }
    }
}
