// Output formatting helpers for CLI commands

use pipeline_engine::{InstanceResult, InstanceState, RunResult, RunStatus};

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Print step output, prefixed with the instance it came from
pub fn step_output(instance: &str, line: &str) {
    println!("\x1b[2m[{}]\x1b[0m | {}", instance, line);
}

/// Print a state transition of an instance
pub fn transition(instance: &str, state: InstanceState, reason: Option<&str>) {
    let color = state_color(state);
    match reason {
        Some(reason) => eprintln!(
            "\x1b[{}m{:>12}\x1b[0m {} ({})",
            color,
            state.as_str(),
            instance,
            reason
        ),
        None => eprintln!("\x1b[{}m{:>12}\x1b[0m {}", color, state.as_str(), instance),
    }
}

/// Print the final table of a run: one line per instance, then the status
pub fn summary(result: &RunResult) {
    println!();
    header(&format!("Run '{}' ({})", result.pipeline, result.run_id));

    let width = result
        .instances
        .iter()
        .map(|i| i.name.len())
        .max()
        .unwrap_or(0);

    for instance in &result.instances {
        summary_line(instance, width);
    }

    println!();
    let elapsed = result.duration().as_secs_f64();
    match result.status {
        RunStatus::Succeeded => success(&format!("Run succeeded in {:.2}s", elapsed)),
        RunStatus::NotTriggered => info("Triggers did not match, nothing was run"),
        RunStatus::Failed => failure(&format!("Run failed after {:.2}s", elapsed)),
        RunStatus::Cancelled => warning(&format!("Run cancelled after {:.2}s", elapsed)),
    }
}

fn summary_line(instance: &InstanceResult, width: usize) {
    let duration = instance
        .duration()
        .map(|d| format!("{:.2}s", d.as_secs_f64()))
        .unwrap_or_else(|| "-".to_string());
    let mut state = instance.state.as_str().to_string();
    if instance.warnings {
        state.push_str(" (with warnings)");
    }

    let line = format!(
        "  {:<width$}  {:<24} {:>8}",
        instance.name,
        state,
        duration,
        width = width
    );
    match instance.reason_string() {
        Some(reason) => eprintln!("\x1b[{}m{}\x1b[0m  {}", state_color(instance.state), line, reason),
        None => eprintln!("\x1b[{}m{}\x1b[0m", state_color(instance.state), line),
    }
}

fn state_color(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Succeeded => "32",
        InstanceState::Failed => "1;31",
        InstanceState::Cancelled => "33",
        InstanceState::Skipped => "2",
        InstanceState::Running => "1;36",
        _ => "36",
    }
}
