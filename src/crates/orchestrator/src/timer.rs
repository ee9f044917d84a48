//! Per-job deadlines
//!
//! A job has a sliding inactivity deadline that every activity signal pushes
//! to `now + sliding`, and an optional hard wall-clock cap. Both are owned
//! exclusively by the job's orchestrator and dropped on its terminal
//! transition, so finished jobs leave no timers behind.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Sleep};

/// Which deadline fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerExpiry {
    Inactivity,
    HardCap,
}

impl TimerExpiry {
    pub fn describe(&self, sliding: Duration, hard: Option<Duration>) -> String {
        match self {
            TimerExpiry::Inactivity => {
                format!("no activity for {}ms", sliding.as_millis())
            }
            TimerExpiry::HardCap => format!(
                "exceeded hard limit of {}ms",
                hard.map(|d| d.as_millis()).unwrap_or_default()
            ),
        }
    }
}

/// Sliding and hard deadlines of one job
#[derive(Debug)]
pub struct JobTimers {
    sliding: Duration,
    hard: Option<Duration>,
    activity: Option<Pin<Box<Sleep>>>,
    hard_cap: Option<Pin<Box<Sleep>>>,
    suspended: bool,
}

fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

impl JobTimers {
    /// Create unarmed timers. Nothing fires until [`JobTimers::arm`].
    pub fn new(sliding: Duration, hard: Option<Duration>) -> Self {
        Self {
            sliding,
            hard,
            activity: None,
            hard_cap: None,
            suspended: false,
        }
    }

    /// Start both deadlines from now
    pub fn arm(&mut self) {
        self.activity = Some(Box::pin(sleep_until(deadline_after(self.sliding))));
        self.hard_cap = self.hard.map(|d| Box::pin(sleep_until(deadline_after(d))));
        self.suspended = false;
    }

    /// Reset the inactivity deadline to `now + sliding`
    pub fn touch(&mut self) {
        let deadline = deadline_after(self.sliding);
        if let Some(activity) = self.activity.as_mut() {
            activity.as_mut().reset(deadline);
        }
    }

    /// Stop the inactivity deadline while waiting on something with its own
    /// bound, such as a human answer
    pub fn suspend_activity(&mut self) {
        self.suspended = true;
    }

    /// Resume the inactivity deadline from now
    pub fn resume_activity(&mut self) {
        self.suspended = false;
        self.touch();
    }

    /// Drop both deadlines
    pub fn clear(&mut self) {
        self.activity = None;
        self.hard_cap = None;
    }

    pub fn is_armed(&self) -> bool {
        self.activity.is_some()
    }

    pub fn sliding(&self) -> Duration {
        self.sliding
    }

    pub fn hard(&self) -> Option<Duration> {
        self.hard
    }

    /// Current inactivity deadline
    pub fn activity_deadline(&self) -> Option<Instant> {
        self.activity.as_ref().map(|s| s.deadline())
    }

    /// Resolve when either deadline elapses. Cancel-safe.
    pub async fn expired(&mut self) -> TimerExpiry {
        let Self {
            activity,
            hard_cap,
            suspended,
            ..
        } = self;

        let inactivity = async move {
            match activity {
                Some(sleep) if !*suspended => sleep.as_mut().await,
                _ => pending::<()>().await,
            }
        };
        let hard = async move {
            match hard_cap {
                Some(sleep) => sleep.as_mut().await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = hard => TimerExpiry::HardCap,
            _ = inactivity => TimerExpiry::Inactivity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, timeout};

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_timers_never_fire() {
        let mut timers = JobTimers::new(Duration::from_millis(10), None);
        assert!(!timers.is_armed());
        assert!(timeout(Duration::from_secs(60), timers.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_slides_deadline() {
        let mut timers = JobTimers::new(Duration::from_millis(2_000), None);
        timers.arm();

        advance(Duration::from_millis(1_900)).await;
        timers.touch();
        let start = Instant::now();

        assert_eq!(timers.expired().await, TimerExpiry::Inactivity);
        assert!(start.elapsed() >= Duration::from_millis(2_000));
        assert!(start.elapsed() < Duration::from_millis(2_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_cap_wins_over_activity() {
        let mut timers =
            JobTimers::new(Duration::from_millis(1_000), Some(Duration::from_millis(2_500)));
        timers.arm();

        for _ in 0..4 {
            advance(Duration::from_millis(800)).await;
            timers.touch();
        }
        // 3200ms elapsed, the hard cap is already due
        assert_eq!(timers.expired().await, TimerExpiry::HardCap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_activity_does_not_fire() {
        let mut timers = JobTimers::new(Duration::from_millis(1_000), None);
        timers.arm();
        timers.suspend_activity();
        assert!(timeout(Duration::from_secs(30), timers.expired()).await.is_err());

        timers.resume_activity();
        let start = Instant::now();
        assert_eq!(timers.expired().await, TimerExpiry::Inactivity);
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert!(start.elapsed() < Duration::from_millis(1_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_deadlines() {
        let mut timers = JobTimers::new(Duration::from_millis(10), Some(Duration::from_millis(20)));
        timers.arm();
        timers.clear();
        assert!(timers.activity_deadline().is_none());
        assert!(timeout(Duration::from_secs(1), timers.expired()).await.is_err());
    }

    #[test]
    fn test_describe() {
        let sliding = Duration::from_millis(2_000);
        assert_eq!(
            TimerExpiry::Inactivity.describe(sliding, None),
            "no activity for 2000ms"
        );
        assert_eq!(
            TimerExpiry::HardCap.describe(sliding, Some(Duration::from_secs(5))),
            "exceeded hard limit of 5000ms"
        );
    }
}
