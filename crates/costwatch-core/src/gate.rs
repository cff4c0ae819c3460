//! Notification dedup gate.
//!
//! A pure decision over `(state, exceeded, today)`. The caller applies the
//! state update only after acting on the decision; the notification date
//! moves only when delivery actually succeeded.

use chrono::NaiveDate;

use crate::state::MonitorState;

/// Outcome of [`decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub send: bool,
}

/// Decide whether to alert for this sample
pub fn decide(state: &MonitorState, exceeded: bool, today: NaiveDate) -> Decision {
    let send = match (exceeded, state.notified_on(today), state.exceeded_on(today)) {
        (false, _, _) => false,
        // already notified today
        (true, true, _) => false,
        // first breach seen today
        (true, false, false) => true,
        // breach continues, nothing delivered yet today
        (true, false, true) => true,
    };
    Decision { send }
}

/// State after acting on `decision`.
///
/// `delivered` is whether the alert actually went out; it is ignored when
/// the decision was not to send.
pub fn next_state(
    state: &MonitorState,
    exceeded: bool,
    decision: Decision,
    delivered: bool,
    today: NaiveDate,
) -> MonitorState {
    if !exceeded {
        return *state;
    }
    if decision.send && delivered {
        return MonitorState {
            last_notification_date: Some(today),
            last_exceedance_date: Some(today),
        };
    }
    MonitorState {
        last_exceedance_date: Some(today),
        ..*state
    }
}
