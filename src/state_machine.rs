//! Pure, deterministic state machine (§4.3). No I/O; concurrent callers are
//! serialized upstream by the payment-level lock, so this module owns no
//! synchronization of its own.

use crate::types::PaymentStatus;

/// A lifecycle event. `Initialize` is the only event valid with no prior
/// status (payment creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Initialize,
    ShowForm,
    Authorize,
    Confirm,
    Cancel,
    Refund,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Ok,
    IllegalFrom,
    GuardFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionResult {
    pub valid: bool,
    pub error_kind: ErrorKind,
    pub to: Option<PaymentStatus>,
}

fn ok(to: PaymentStatus) -> TransitionResult {
    TransitionResult {
        valid: true,
        error_kind: ErrorKind::Ok,
        to: Some(to),
    }
}

fn illegal() -> TransitionResult {
    TransitionResult {
        valid: false,
        error_kind: ErrorKind::IllegalFrom,
        to: None,
    }
}

/// Decide whether `event` is legal when the payment has no prior status
/// (i.e. is being created), returning the resulting status.
pub fn transition_initial(event: Event) -> TransitionResult {
    match event {
        Event::Initialize => ok(PaymentStatus::New),
        _ => illegal(),
    }
}

/// Decide whether `event` is legal from `from`, returning `{valid, errorKind, to}`.
/// Terminal states accept no outbound edges (§4.3).
pub fn transition(from: PaymentStatus, event: Event) -> TransitionResult {
    use Event::*;
    use PaymentStatus::*;

    if from.is_terminal() {
        return illegal();
    }

    match (from, event) {
        (New, ShowForm) => ok(FormShowed),
        (FormShowed, Authorize) => ok(Authorized),
        (Authorized, Confirm) => ok(Confirmed),
        (New, Cancel) | (FormShowed, Cancel) | (Authorized, Cancel) => ok(Cancelled),
        (Confirmed, Refund) => ok(Refunded),
        (New, Reject) | (FormShowed, Reject) => ok(Rejected),
        _ => illegal(),
    }
}

/// Every legal edge as `(from, event, to)`, used to validate observed status
/// sequences in tests against the declared edge set (P1).
pub fn legal_edges() -> &'static [(PaymentStatus, Event, PaymentStatus)] {
    use Event::*;
    use PaymentStatus::*;
    &[
        (New, ShowForm, FormShowed),
        (FormShowed, Authorize, Authorized),
        (Authorized, Confirm, Confirmed),
        (New, Cancel, Cancelled),
        (FormShowed, Cancel, Cancelled),
        (Authorized, Cancel, Cancelled),
        (Confirmed, Refund, Refunded),
        (New, Reject, Rejected),
        (FormShowed, Reject, Rejected),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(transition_initial(Event::Initialize).valid);
        assert!(transition(PaymentStatus::New, Event::ShowForm).valid);
        assert!(transition(PaymentStatus::FormShowed, Event::Authorize).valid);
        assert!(transition(PaymentStatus::Authorized, Event::Confirm).valid);
    }

    #[test]
    fn confirm_from_new_is_illegal() {
        let result = transition(PaymentStatus::New, Event::Confirm);
        assert!(!result.valid);
        assert_eq!(result.error_kind, ErrorKind::IllegalFrom);
    }

    #[test]
    fn terminal_states_accept_no_edges() {
        for status in [
            PaymentStatus::Confirmed,
            PaymentStatus::Cancelled,
            PaymentStatus::Refunded,
            PaymentStatus::Rejected,
        ] {
            for event in [
                Event::ShowForm,
                Event::Authorize,
                Event::Confirm,
                Event::Cancel,
                Event::Refund,
                Event::Reject,
            ] {
                assert!(!transition(status, event).valid, "{status:?} + {event:?}");
            }
        }
    }

    #[test]
    fn cancel_legal_from_three_states() {
        for status in [
            PaymentStatus::New,
            PaymentStatus::FormShowed,
            PaymentStatus::Authorized,
        ] {
            let result = transition(status, Event::Cancel);
            assert!(result.valid);
            assert_eq!(result.to, Some(PaymentStatus::Cancelled));
        }
    }

    #[test]
    fn refund_only_from_confirmed() {
        assert!(transition(PaymentStatus::Confirmed, Event::Refund).valid);
        assert!(!transition(PaymentStatus::Authorized, Event::Refund).valid);
    }
}
