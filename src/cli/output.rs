//! CLI output formatting

use crate::{
    core::{ExecutionStatus, JobState, Plan, StageStatus},
    execution::{ExecutionEvent, RunReport},
    persistence::ExecutionSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write as _;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "# ");

/// Create a progress bar over the jobs of a run
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(template) =
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(template.progress_chars("#>-"));
    }
    progress
}

/// Format a job state for display
pub fn format_job_state(state: &JobState) -> String {
    match state {
        JobState::Pending => style("PENDING").dim().to_string(),
        JobState::Manual => style("MANUAL").blue().to_string(),
        JobState::Running { attempt, .. } => style(format!("RUNNING (attempt {})", attempt)).yellow().to_string(),
        JobState::Succeeded { .. } => style("SUCCEEDED").green().to_string(),
        JobState::Failed { allowed: true, .. } => style("FAILED (allowed)").yellow().to_string(),
        JobState::Failed { .. } => style("FAILED").red().to_string(),
        JobState::Cancelled { .. } => style("CANCELLED").yellow().to_string(),
        JobState::Skipped { .. } => style("SKIPPED").dim().to_string(),
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

pub fn format_stage_status(status: StageStatus) -> String {
    match status {
        StageStatus::Pending => style("pending").dim().to_string(),
        StageStatus::Running => style("running").yellow().to_string(),
        StageStatus::Succeeded => style("passed").green().to_string(),
        StageStatus::PartiallyFailedAllowed => style("passed with warnings").yellow().to_string(),
        StageStatus::Failed => style("failed").red().to_string(),
        StageStatus::Skipped => style("skipped").dim().to_string(),
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Succeeded => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        ExecutionStatus::Cancelled => SKIP,
        ExecutionStatus::Pending => INFO,
    };

    format!(
        "{} {} - {} @ {} ({}) - {} ({}/{}) - {}",
        status_icon,
        style(short_id(&summary.execution_id)).dim(),
        style(&summary.pipeline_name).bold(),
        style(&summary.ref_name).cyan(),
        summary.source,
        format_status(summary.status),
        summary.succeeded_jobs,
        summary.total_jobs,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            total_jobs,
        } => format!(
            "{} Starting pipeline {} ({}, {} jobs)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(execution_id)).dim(),
            total_jobs
        ),
        ExecutionEvent::StageStarted { stage } => {
            format!("{} Stage {}", INFO, style(stage).bold().underlined())
        }
        ExecutionEvent::JobStarted { job, attempt } => {
            if *attempt > 1 {
                format!("{} {} (attempt {})", SPINNER, style(job).cyan(), style(attempt).dim())
            } else {
                format!("{} {}", SPINNER, style(job).cyan())
            }
        }
        ExecutionEvent::JobRetrying { job, attempt, class } => format!(
            "{} {} hit {}, retrying (attempt {})",
            WARN,
            style(job).yellow(),
            class,
            attempt
        ),
        ExecutionEvent::JobSucceeded { job, attempts } => {
            if *attempts > 1 {
                format!("{} {} ({} attempts)", CHECK, style(job).green(), attempts)
            } else {
                format!("{} {}", CHECK, style(job).green())
            }
        }
        ExecutionEvent::JobFailed {
            job,
            error,
            class,
            allowed,
        } => {
            if *allowed {
                format!(
                    "{} {} failed, allowed: {} ({})",
                    WARN,
                    style(job).yellow(),
                    style(error).dim(),
                    class
                )
            } else {
                format!("{} {}: {} ({})", CROSS, style(job).red(), style(error).dim(), class)
            }
        }
        ExecutionEvent::JobCancelled { job, reason } => {
            format!("{} {} cancelled: {}", SKIP, style(job).yellow(), style(reason).dim())
        }
        ExecutionEvent::JobSkipped { job, reason } => {
            format!("{} {} skipped: {}", SKIP, style(job).dim(), style(reason).dim())
        }
        ExecutionEvent::StageFinished { stage, status } => {
            format!("{} Stage {} {}", INFO, style(stage).bold(), format_stage_status(*status))
        }
        ExecutionEvent::PipelineCompleted { execution_id, status } => format!(
            "{} Pipeline ({}) {}",
            INFO,
            style(short_id(execution_id)).dim(),
            format_status(*status)
        ),
    }
}

/// Render a dry-run plan
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} for {} ({})",
        INFO,
        style(&plan.pipeline).bold(),
        style(&plan.ref_name).cyan(),
        plan.source
    );

    if plan.stages.is_empty() {
        let _ = writeln!(out, "  {}", style("no jobs match this trigger").dim());
    }
    for stage in &plan.stages {
        let _ = writeln!(out, "  {}", style(&stage.name).bold().underlined());
        for job in &stage.jobs {
            let mut flags = Vec::new();
            if job.manual {
                flags.push("manual".to_string());
            }
            if job.allow_failure {
                flags.push("allow failure".to_string());
            }
            if !job.needs.is_empty() {
                flags.push(format!("needs {}", job.needs.join(", ")));
            }
            if flags.is_empty() {
                let _ = writeln!(out, "    - {}", job.name);
            } else {
                let _ = writeln!(out, "    - {} {}", job.name, style(format!("[{}]", flags.join("; "))).dim());
            }
        }
    }
    if !plan.excluded.is_empty() {
        let _ = writeln!(out, "  {} {}", style("excluded:").dim(), style(plan.excluded.join(", ")).dim());
    }
    out
}

/// Render the final per-job report
pub fn format_report(report: &RunReport) -> String {
    let mut out = String::new();
    for job in &report.jobs {
        let detail = match (&job.failure_class, &job.error) {
            (Some(class), Some(error)) => format!(" {} ({})", style(error).dim(), class),
            (None, Some(reason)) => format!(" {}", style(reason).dim()),
            _ => String::new(),
        };
        let _ = writeln!(
            out,
            "  {:<32} {:<10} x{}{}",
            job.name,
            job.state,
            job.attempts,
            detail
        );
        if let Some(publish) = &job.publish {
            if !publish.pushed.is_empty() {
                let _ = writeln!(out, "    {} {}", PACKAGE, publish.pushed.join(", "));
            }
        }
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "{} {}", WARN, style(warning).yellow());
    }
    out
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[lines.len() - max_lines..].join("\n");
        format!(
            "{}... ({} earlier lines)\n{}",
            style("[truncated]").dim(),
            lines.len() - max_lines,
            truncated
        )
    }
}
