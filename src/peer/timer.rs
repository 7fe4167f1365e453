//! Keepalive timer state machine
//!
//! A timer is a `{period, deadline, armed}` triple behind a mutex plus a
//! wakeup for its driver task. Arming and disarming report what actually
//! changed so the caller can apply the matching peer-refcount delta; the
//! deltas must balance exactly or a keepalive reconfiguration could leak or
//! over-release the peer.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// What a `schedule` call actually did to the armed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rearm {
    /// Armed state unchanged (deadline may have moved).
    Unchanged,
    /// Went from disarmed to armed; the caller owes the peer a reference.
    Armed,
    /// Went from armed to disarmed; the caller must release a reference.
    Disarmed,
}

#[derive(Debug)]
struct TimerState {
    period: Option<Duration>,
    deadline: Option<Instant>,
    armed: bool,
}

#[derive(Debug)]
pub(crate) struct KeepaliveTimer {
    name: &'static str,
    state: Mutex<TimerState>,
    notify: Notify,
}

impl KeepaliveTimer {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(TimerState {
                period: None,
                deadline: None,
                armed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Set the period. Zero means "disarm on the next schedule".
    pub(crate) fn set_period(&self, period: Duration) {
        let mut state = self.state.lock();
        state.period = if period.is_zero() { None } else { Some(period) };
    }

    /// (Re)schedule against the current period.
    ///
    /// With a period set this arms the timer (or pushes the deadline of an
    /// already-armed one); with no period it disarms. The caller holds the
    /// peer spinlock and translates the outcome into a refcount delta.
    pub(crate) fn schedule(&self) -> Rearm {
        let mut state = self.state.lock();
        match state.period {
            Some(period) => {
                state.deadline = Some(Instant::now() + period);
                let newly_armed = !state.armed;
                state.armed = true;
                drop(state);
                self.notify.notify_one();
                if newly_armed {
                    Rearm::Armed
                } else {
                    Rearm::Unchanged
                }
            }
            None => {
                if state.armed {
                    state.armed = false;
                    state.deadline = None;
                    drop(state);
                    self.notify.notify_one();
                    Rearm::Disarmed
                } else {
                    Rearm::Unchanged
                }
            }
        }
    }

    /// Disarm. Returns whether the timer was armed, in which case the
    /// caller must release the reference the arming took.
    pub(crate) fn disarm(&self) -> bool {
        let mut state = self.state.lock();
        let was_armed = state.armed;
        state.armed = false;
        state.deadline = None;
        drop(state);
        self.notify.notify_one();
        was_armed
    }

    /// Traffic reset: push the deadline of an armed timer forward by one
    /// period. A disarmed timer is left alone.
    pub(crate) fn event(&self) {
        let mut state = self.state.lock();
        if state.armed {
            if let Some(period) = state.period {
                state.deadline = Some(Instant::now() + period);
            }
        }
    }

    /// Deadline the driver should sleep to, or `None` while disarmed.
    pub(crate) fn armed_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        if state.armed {
            state.deadline
        } else {
            None
        }
    }

    /// Consume the arming if the deadline has truly passed. Returns false
    /// when a traffic reset moved the deadline since the driver went to
    /// sleep, in which case the driver just sleeps again.
    pub(crate) fn try_fire(&self) -> bool {
        let mut state = self.state.lock();
        match state.deadline {
            Some(deadline) if state.armed && Instant::now() >= deadline => {
                state.armed = false;
                state.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Wait until the armed state or deadline may have changed.
    pub(crate) async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_without_period_is_a_disarm() {
        let timer = KeepaliveTimer::new("xmit");
        assert_eq!(timer.schedule(), Rearm::Unchanged);
        assert!(!timer.is_armed());
    }

    #[test]
    fn arming_and_rearming_report_balanced_outcomes() {
        let timer = KeepaliveTimer::new("xmit");
        timer.set_period(Duration::from_secs(1));

        assert_eq!(timer.schedule(), Rearm::Armed);
        assert!(timer.is_armed());

        // Same parameters again: the armed state is unchanged, so the net
        // refcount delta of a repeated set_keepalive is zero.
        assert_eq!(timer.schedule(), Rearm::Unchanged);
        assert_eq!(timer.schedule(), Rearm::Unchanged);

        timer.set_period(Duration::ZERO);
        assert_eq!(timer.schedule(), Rearm::Disarmed);
        assert_eq!(timer.schedule(), Rearm::Unchanged);
    }

    #[test]
    fn disarm_reports_prior_state() {
        let timer = KeepaliveTimer::new("expire");
        timer.set_period(Duration::from_secs(1));
        timer.schedule();
        assert!(timer.disarm());
        assert!(!timer.disarm());
    }

    #[test]
    fn event_pushes_deadline_of_armed_timer() {
        let timer = KeepaliveTimer::new("expire");
        timer.set_period(Duration::from_millis(50));
        timer.schedule();
        let before = timer.armed_deadline().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        timer.event();
        let after = timer.armed_deadline().unwrap();
        assert!(after > before);
    }

    #[test]
    fn event_on_disarmed_timer_is_a_no_op() {
        let timer = KeepaliveTimer::new("expire");
        timer.set_period(Duration::from_millis(50));
        timer.event();
        assert_eq!(timer.armed_deadline(), None);
    }

    #[test]
    fn fire_consumes_the_arming_once() {
        let timer = KeepaliveTimer::new("xmit");
        timer.set_period(Duration::from_millis(1));
        timer.schedule();

        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.try_fire());
        assert!(!timer.try_fire());
        assert!(!timer.is_armed());
    }

    #[test]
    fn fire_respects_a_moved_deadline() {
        let timer = KeepaliveTimer::new("xmit");
        timer.set_period(Duration::from_secs(60));
        timer.schedule();
        // Deadline is a minute out; a premature fire must not consume the
        // arming.
        assert!(!timer.try_fire());
        assert!(timer.is_armed());
    }
}
