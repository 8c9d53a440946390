//! CLI output formatting

use crate::{
    core::{ExecutionStatus, StepResult},
    execution::ExecutionEvent,
    persistence::ExecutionSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar().template(PROGRESS_TEMPLATE) {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Succeeded => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Pending => INFO,
    };

    format!(
        "{} {} - {} - {} ({}/{}) - {} @ {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.completed_steps,
        summary.total_steps,
        summary.event.git_ref,
        style(short_sha(&summary.event.sha)).dim(),
    )
}

fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// One line per step: icon, id, duration and the error if it failed
pub fn format_step_result(result: &StepResult) -> String {
    let duration = format_duration(result.duration());
    match &result.error {
        None => format!("{} {} ({})", CHECK, style(&result.step_id).green(), duration),
        Some(error) => {
            let icon = if result.aborts_run() { CROSS } else { WARN };
            format!(
                "{} {} ({}) {}: {}",
                icon,
                style(&result.step_id).red(),
                duration,
                style(error.kind()).bold(),
                style(error.message()).dim()
            )
        }
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::RunSkipped {
            pipeline_name,
            git_ref,
        } => format!(
            "{} {} not triggered by {}",
            INFO,
            style(pipeline_name).dim(),
            style(git_ref).dim()
        ),
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            total_steps,
        } => format!(
            "{} Starting pipeline {} ({}, {} steps)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(run_id)).dim(),
            total_steps
        ),
        ExecutionEvent::StepStarted {
            step_id,
            name,
            index,
            total,
            ..
        } => {
            if name != step_id {
                format!(
                    "{} [{}/{}] {} {}",
                    SPINNER,
                    index + 1,
                    total,
                    style(step_id).cyan(),
                    style(name).dim()
                )
            } else {
                format!("{} [{}/{}] {}", SPINNER, index + 1, total, style(step_id).cyan())
            }
        }
        ExecutionEvent::StepFinished { result, .. } => format_step_result(result),
        ExecutionEvent::RunFinished {
            run_id,
            pipeline_name,
            status,
        } => {
            let status_str = match status {
                ExecutionStatus::Succeeded => style("succeeded").green().to_string(),
                ExecutionStatus::Failed => style("failed").red().to_string(),
                other => other.to_string(),
            };
            format!(
                "{} Pipeline {} ({}) {}",
                INFO,
                style(pipeline_name).bold(),
                style(short_id(run_id)).dim(),
                status_str
            )
        }
    }
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}

/// Format duration for display
pub fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds().max(0);
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else if total_secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", duration.num_milliseconds().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FailurePolicy, PipelineError};
    use chrono::Utc;

    fn result(error: Option<PipelineError>, policy: FailurePolicy) -> StepResult {
        let now = Utc::now();
        StepResult {
            step_id: "push".to_string(),
            name: "Push image".to_string(),
            started_at: now,
            completed_at: now + chrono::Duration::seconds(3),
            exit_code: None,
            success: error.is_none(),
            policy,
            output: String::new(),
            outputs: Default::default(),
            error,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(250)), "250ms");
        assert_eq!(format_duration(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_duration(chrono::Duration::seconds(125)), "2m 5s");
        assert_eq!(format_duration(chrono::Duration::seconds(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_output_truncates() {
        let output = "a\nb\nc\nd";
        assert_eq!(format_output(output, 10), output);

        let truncated = format_output(output, 2);
        assert!(truncated.starts_with("a\nb\n"));
        assert!(truncated.contains("(2 more lines)"));
    }

    #[test]
    fn test_format_step_result_shows_error_kind() {
        let failed = result(
            Some(PipelineError::PublishError("denied: push rejected".to_string())),
            FailurePolicy::Abort,
        );
        let line = format_step_result(&failed);
        assert!(line.contains("push"));
        assert!(line.contains("PublishError"));
        assert!(line.contains("denied: push rejected"));

        let ok = format_step_result(&result(None, FailurePolicy::Abort));
        assert!(ok.contains("3s"));
    }

    #[test]
    fn test_format_run_events() {
        let run_id = Uuid::new_v4();
        let started = format_execution_event(&ExecutionEvent::RunStarted {
            run_id,
            pipeline_name: "backend".to_string(),
            total_steps: 4,
        });
        assert!(started.contains("backend"));
        assert!(started.contains("4 steps"));

        let step = format_execution_event(&ExecutionEvent::StepStarted {
            run_id,
            step_id: "build".to_string(),
            name: "build".to_string(),
            index: 1,
            total: 4,
        });
        assert!(step.contains("[2/4]"));

        let skipped = format_execution_event(&ExecutionEvent::RunSkipped {
            pipeline_name: "frontend".to_string(),
            git_ref: "refs/heads/feature-x".to_string(),
        });
        assert!(skipped.contains("not triggered"));
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short_sha("abc123def456"), "abc123d");
        assert_eq!(short_sha("abc"), "abc");
    }
}
