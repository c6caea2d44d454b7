//! Pure triage logic: the keyword heuristic, upstream status
//! classification, and the lifecycle transition tables.

use conductor_rs::model::run::RunStatus;
use conductor_rs::model::task::TaskStatus;
use conductor_rs::triage::intent::{IntentKind, keyword_intent};
use conductor_rs::triage::is_active_upstream_status;

#[test]
fn imperative_comments_are_commands() {
    for text in [
        "Please rerun the pipeline with the new config",
        "fix the failing import",
        "update the README to mention the new flag",
        "try again, the provider was down",
    ] {
        assert_eq!(keyword_intent(text).kind, IntentKind::Command, "{text}");
    }
}

#[test]
fn questions_are_questions() {
    for text in [
        "Why did this fail?",
        "Can you fix this one too?", // question mark wins over "fix"
        "what happens on retry?",
    ] {
        assert_eq!(keyword_intent(text).kind, IntentKind::Question, "{text}");
    }
}

#[test]
fn chatter_is_noop() {
    for text in ["LGTM", "thanks!", "nice work everyone", ""] {
        assert_eq!(keyword_intent(text).kind, IntentKind::Noop, "{text:?}");
    }
}

#[test]
fn terminal_upstream_statuses_do_not_reactivate() {
    for status in ["done", "Closed", "COMPLETED", "resolved", " cancelled "] {
        assert!(!is_active_upstream_status(status), "{status}");
    }
    for status in ["active", "open", "in_progress", "reopened", "todo"] {
        assert!(is_active_upstream_status(status), "{status}");
    }
}

#[test]
fn task_status_transitions() {
    use TaskStatus::*;

    assert!(Pending.can_transition_to(Processing));
    assert!(Processing.can_transition_to(Completed));
    assert!(Processing.can_transition_to(Failed));

    // Reactivation is the one sanctioned exit from a terminal state.
    assert!(Completed.can_transition_to(Processing));
    assert!(Failed.can_transition_to(Processing));

    assert!(!Completed.can_transition_to(Failed));
    assert!(!Pending.can_transition_to(Completed));
    assert!(Completed.is_terminal());
    assert!(Failed.is_terminal());
    assert!(!Processing.is_terminal());
}

#[test]
fn run_status_transitions() {
    use RunStatus::*;

    assert!(Started.can_transition_to(Running));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Failed));
    assert!(Running.can_transition_to(Suspended));
    assert!(Suspended.can_transition_to(Running));

    // Terminal means terminal.
    assert!(!Completed.can_transition_to(Running));
    assert!(!Failed.can_transition_to(Running));
    assert!(Completed.is_terminal());
    assert!(Failed.is_terminal());
    assert!(!Suspended.is_terminal());
}

#[test]
fn statuses_round_trip_through_strings() {
    for status in [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        let parsed: TaskStatus = status.to_string().parse().unwrap();
        assert_eq!(parsed, status);
    }
    assert!("bogus".parse::<TaskStatus>().is_err());
}
