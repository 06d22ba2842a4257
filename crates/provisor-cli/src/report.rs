//! Human-readable run output.

use provisor_core::{Action, ActionResult, ActionStatus, AttemptOutcome};
use provisor_runtime::FinalState;

pub fn print_report(state: &FinalState) {
    println!("=== Provisor Run {} ===", state.run_id);
    println!();
    for result in &state.results {
        println!("{}", result_line(result));
        for attempt in &result.attempts {
            if !attempt.succeeded() {
                println!("      {} -> {}", attempt.strategy, outcome_text(&attempt.outcome));
            }
        }
    }

    if !state.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for w in &state.warnings {
            println!("  - {}", w);
        }
    }

    if let Some(err) = &state.error {
        println!();
        println!("Error ({}): {}", err.kind, err.message);
    }

    println!();
    println!("Applied:       {}", state.executed());
    println!("Skipped:       {}", state.skipped());
    println!(
        "Content hash:  {}",
        state.content_hash.as_deref().unwrap_or("unknown")
    );
    println!("Status:        {:?} ({:?})", state.phase, state.exit_class());
}

pub fn print_plan(actions: &[Action]) {
    if actions.is_empty() {
        println!("Nothing to do: environment matches the desired state.");
        return;
    }
    println!("{} action(s) would be applied:", actions.len());
    for (i, action) in actions.iter().enumerate() {
        println!("  {}. {}", i + 1, action);
    }
}

fn result_line(result: &ActionResult) -> String {
    let status = match &result.status {
        ActionStatus::Succeeded if result.is_degraded() => "ok*".to_string(),
        ActionStatus::Succeeded => "ok".to_string(),
        ActionStatus::Skipped => "skip".to_string(),
        ActionStatus::Failed { kind, .. } => format!("FAIL {}", kind),
    };
    format!("  [{}] {}", status, result.key)
}

fn outcome_text(outcome: &AttemptOutcome) -> String {
    match outcome {
        AttemptOutcome::Succeeded => "ok".into(),
        AttemptOutcome::Failed { reason } => reason.clone(),
        AttemptOutcome::TimedOut { after_ms } => format!("timed out after {}ms", after_ms),
    }
}
