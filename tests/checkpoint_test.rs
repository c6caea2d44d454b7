//! Pure checkpoint policies: payload truncation, step-name normalization,
//! and progress arithmetic.

use conductor_rs::db::runs::{normalize_step_name, progress_for_step, truncate_payload};

#[test]
fn small_payloads_pass_through() {
    let text = r#"{"ok":true}"#;
    assert_eq!(truncate_payload(text, 1024), text);
}

#[test]
fn oversized_payloads_truncate_with_marker() {
    let text = "x".repeat(10_000);
    let capped = truncate_payload(&text, 256);

    assert!(capped.len() <= 256, "got {} bytes", capped.len());
    assert!(capped.contains("[truncated, original_size=10000]"));
    assert!(capped.starts_with("xxx"));
}

#[test]
fn truncation_respects_utf8_boundaries() {
    let text = "é".repeat(500); // 2 bytes each
    let capped = truncate_payload(&text, 100);

    assert!(capped.len() <= 100);
    // Must still be a valid string — slicing mid-codepoint would have
    // panicked inside truncate_payload already, but be explicit.
    assert!(capped.contains("[truncated, original_size=1000]"));
}

#[test]
fn degenerate_cap_still_bounded() {
    let text = "x".repeat(100);
    let capped = truncate_payload(&text, 10);
    assert!(capped.len() <= 10);
}

#[test]
fn step_names_normalize() {
    assert_eq!(normalize_step_name("Generate Code"), "generate-code");
    assert_eq!(normalize_step_name("  generate   code  "), "generate-code");
    assert_eq!(normalize_step_name("plan"), "plan");
}

#[test]
fn progress_rises_and_holds_at_90() {
    let progress: Vec<i32> = (1..=8).map(progress_for_step).collect();

    assert_eq!(progress, vec![15, 30, 45, 60, 75, 90, 90, 90]);
    // Monotonic, never 100 before the terminal write snaps it there.
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| *p <= 90));
}
