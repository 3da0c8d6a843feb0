use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Uplink bookkeeping, mutated only by the manager loop
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkState {
    pub radio_on: bool,
    /// Last time the queue was seen non-empty
    pub last_activity: DateTime<Utc>,
    pub consecutive_failure_since: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// Radio state surviving restarts
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRadio {
    radio_on: bool,
    updated_at: DateTime<Utc>,
}

/// Timing knobs of the radio and backoff policy
#[derive(Debug, Clone, Copy)]
pub struct UplinkPolicy {
    pub failure_window: Duration,
    pub retry_cooldown: Duration,
    pub radio_idle_timeout: Duration,
    pub keep_radio_on: bool,
}

impl UplinkState {
    pub fn new(radio_on: bool, now: DateTime<Utc>) -> Self {
        Self {
            radio_on,
            last_activity: now,
            consecutive_failure_since: None,
            backoff_until: None,
        }
    }

    /// Restore the last known radio state, falling back to `radio_on_at_boot`
    pub async fn load(path: &Path, radio_on_at_boot: bool, now: DateTime<Utc>) -> Self {
        let radio_on = match tokio::fs::read(path).await {
            Ok(raw) => match serde_json::from_slice::<PersistedRadio>(&raw) {
                Ok(persisted) => {
                    debug!(
                        "Restored radio state {} from {}",
                        persisted.radio_on,
                        path.display()
                    );
                    persisted.radio_on
                }
                Err(e) => {
                    warn!("Ignoring unreadable uplink state {}: {}", path.display(), e);
                    radio_on_at_boot
                }
            },
            Err(_) => radio_on_at_boot,
        };
        Self::new(radio_on, now)
    }

    pub async fn persist(&self, path: &Path, now: DateTime<Utc>) -> std::io::Result<()> {
        let body = serde_json::to_vec(&PersistedRadio {
            radio_on: self.radio_on,
            updated_at: now,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.map_or(false, |until| now < until)
    }

    /// Clear an expired backoff together with its failure timer.
    /// Returns true when a backoff ended.
    pub fn expire_backoff(&mut self, now: DateTime<Utc>) -> bool {
        match self.backoff_until {
            Some(until) if now >= until => {
                self.backoff_until = None;
                self.consecutive_failure_since = None;
                true
            }
            _ => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failure_since = None;
    }

    /// Record a delivery failure; returns the backoff deadline when the
    /// failure window has been exhausted
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        policy: &UplinkPolicy,
    ) -> Option<DateTime<Utc>> {
        let since = *self.consecutive_failure_since.get_or_insert(now);
        if now - since >= policy.failure_window {
            let until = since + policy.retry_cooldown;
            self.backoff_until = Some(until);
            Some(until)
        } else {
            None
        }
    }

    /// Radio state the policy asks for right now
    pub fn desired_radio(&self, now: DateTime<Utc>, queue_empty: bool, policy: &UplinkPolicy) -> bool {
        if self.in_backoff(now) {
            return false;
        }
        if policy.keep_radio_on || !queue_empty {
            return true;
        }
        self.radio_on && now - self.last_activity < policy.radio_idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> UplinkPolicy {
        UplinkPolicy {
            failure_window: Duration::seconds(150),
            retry_cooldown: Duration::seconds(900),
            radio_idle_timeout: Duration::seconds(120),
            keep_radio_on: false,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_backoff_starts_at_window_and_ends_after_cooldown() {
        let mut state = UplinkState::new(true, t(0));

        assert_eq!(state.record_failure(t(0), &policy()), None);
        assert_eq!(state.record_failure(t(149), &policy()), None);
        assert!(!state.in_backoff(t(149)));

        // measured from the first failure
        assert_eq!(state.record_failure(t(150), &policy()), Some(t(900)));
        assert!(state.in_backoff(t(899)));
        assert!(!state.expire_backoff(t(899)));

        assert!(state.expire_backoff(t(900)));
        assert!(!state.in_backoff(t(900)));
        assert_eq!(state.consecutive_failure_since, None);
    }

    #[test]
    fn test_success_clears_failure_timer() {
        let mut state = UplinkState::new(true, t(0));
        state.record_failure(t(0), &policy());
        state.record_success();
        // a new streak starts from scratch
        assert_eq!(state.record_failure(t(200), &policy()), None);
        assert_eq!(state.consecutive_failure_since, Some(t(200)));
    }

    #[test]
    fn test_radio_policy() {
        let mut state = UplinkState::new(false, t(0));
        assert!(state.desired_radio(t(0), false, &policy()));
        assert!(!state.desired_radio(t(0), true, &policy()));

        state.radio_on = true;
        state.last_activity = t(10);
        assert!(state.desired_radio(t(129), true, &policy()));
        assert!(!state.desired_radio(t(130), true, &policy()));

        let keep_on = UplinkPolicy {
            keep_radio_on: true,
            ..policy()
        };
        assert!(state.desired_radio(t(1000), true, &keep_on));

        state.backoff_until = Some(t(2000));
        assert!(!state.desired_radio(t(1000), false, &keep_on));
    }

    #[tokio::test]
    async fn test_radio_state_survives_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("uplink_state.json");

        assert!(UplinkState::load(&path, true, t(0)).await.radio_on);

        let mut state = UplinkState::new(true, t(0));
        state.radio_on = false;
        state.persist(&path, t(5)).await.unwrap();
        assert!(!UplinkState::load(&path, true, t(10)).await.radio_on);

        tokio::fs::write(&path, b"{garbage").await.unwrap();
        assert!(UplinkState::load(&path, true, t(10)).await.radio_on);
    }
}
