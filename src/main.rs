use railyard::{
    artifact::ArtifactStore,
    cli::{
        commands::{HistoryCommand, PlanCommand, RunCommand, TriggerArgs, ValidateCommand},
        output::*,
        Cli, Command,
    },
    core::{config::PipelineConfig, JobGraph, Pipeline, TriggerContext},
    execution::{CancelFlag, ExecutionEngine, ExecutionEvent, JobExecutor, ShellRunner},
    persistence::{create_summary, ExecutionSummary, InMemoryPersistence, PersistenceBackend},
    publish::{BuildahCli, Credentials, DockerHubClient, PublishWorkflow},
};

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Plan(cmd) => plan_pipeline(cmd)?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

/// Load a pipeline and apply `--var` overrides
fn load_pipeline(file: &Path, vars: &[(String, String)]) -> Result<Pipeline> {
    let config = PipelineConfig::from_file(file).context("Failed to load pipeline config")?;
    let mut pipeline = config.to_pipeline().context("Invalid pipeline definition")?;

    for (key, value) in vars {
        pipeline.variables.insert(key.clone(), value.clone());
    }
    Ok(pipeline)
}

fn resolve_trigger(pipeline: &Pipeline, args: &TriggerArgs, vars: &[(String, String)]) -> Result<TriggerContext> {
    let raw = args.to_raw(pipeline.schedule_variable.as_deref(), vars);
    TriggerContext::resolve(raw).context("Invalid trigger")
}

async fn history_store(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }

    #[cfg(feature = "sqlite")]
    {
        let store = railyard::persistence::SqliteExecutionStore::with_default_path().await?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        warn!("Built without the sqlite feature; history is kept in memory only");
        Ok(Arc::new(InMemoryPersistence::new()))
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let pipeline = load_pipeline(&cmd.file, &cmd.var)?;
    println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());

    for (key, value) in &cmd.var {
        println!("{} Variable override: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let trigger = resolve_trigger(&pipeline, &cmd.trigger, &cmd.var)?;
    let mut graph = JobGraph::build(&pipeline, &trigger).context("Failed to build job graph")?;

    if graph.is_empty() {
        println!("{} No jobs match {} ({})", WARN, style(trigger.ref_name()).cyan(), trigger.source());
        return Ok(());
    }

    let store = history_store(cmd.no_history).await?;

    let artifact_root = cmd
        .artifacts
        .clone()
        .unwrap_or_else(|| cmd.workspace.join(".railyard").join("artifacts"));
    let artifacts = Arc::new(ArtifactStore::new(artifact_root));

    let mut executor = JobExecutor::new(ShellRunner::default(), artifacts).with_workspace(&cmd.workspace);
    if let Some(config) = &pipeline.publish {
        let credentials = Credentials::from_env(config);
        if credentials.is_none() {
            info!(
                "No registry credentials in {}/{}; publish jobs will fail",
                config.username_env, config.password_env
            );
        }
        let workflow = PublishWorkflow::new(
            config.clone(),
            credentials,
            Arc::new(BuildahCli::default()),
            Arc::new(DockerHubClient::new(&config.description.api_url)),
        );
        executor = executor.with_publisher(Arc::new(workflow));
    }

    let engine = ExecutionEngine::new(executor, cmd.strategy);

    let progress = create_progress_bar(graph.len());
    let bar = progress.clone();
    engine
        .add_event_handler(move |event| {
            bar.println(format_execution_event(&event));
            match &event {
                ExecutionEvent::JobSucceeded { .. }
                | ExecutionEvent::JobFailed { .. }
                | ExecutionEvent::JobCancelled { .. }
                | ExecutionEvent::JobSkipped { .. } => bar.inc(1),
                ExecutionEvent::JobStarted { job, .. } => bar.set_message(job.clone()),
                _ => {}
            }
        })
        .await;

    let cancel = CancelFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pipeline");
            on_interrupt.raise();
        }
    });

    println!();
    let report = engine.execute(&mut graph, &cancel).await;
    progress.finish_and_clear();

    println!("\n{}", format_report(&report));

    if !cmd.no_history {
        let summary = create_summary(&graph);
        store.save_execution(&summary).await?;
        println!(
            "{} Execution saved to history (ID: {})",
            INFO,
            style(summary.execution_id.to_string().chars().take(8).collect::<String>()).dim()
        );
    }

    if report.succeeded() {
        println!(
            "\n{} {} {}",
            CHECK,
            style(&report.pipeline).bold(),
            style("succeeded").green()
        );
        Ok(())
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&report.pipeline).bold(),
            format_status(report.status)
        );
        error!("Pipeline {} ended {}", report.pipeline, report.status);
        std::process::exit(1);
    }
}

fn plan_pipeline(cmd: &PlanCommand) -> Result<()> {
    let pipeline = load_pipeline(&cmd.file, &cmd.var)?;
    let trigger = resolve_trigger(&pipeline, &cmd.trigger, &cmd.var)?;
    let graph = JobGraph::build(&pipeline, &trigger).context("Failed to build job graph")?;
    let plan = graph.plan();

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{}", format_plan(&plan));
    }
    Ok(())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    let result = PipelineConfig::from_file(&cmd.file)
        .and_then(|config| config.to_pipeline().map(|p| (config, p)).map_err(Into::into));

    match result {
        Ok((config, pipeline)) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&pipeline.name).bold());
            println!("  Stages: {}", style(pipeline.stages.join(", ")).cyan());
            println!("  Jobs: {}", style(pipeline.jobs.len()).cyan());
            println!("  Rule sets: {}", style(config.rule_sets.len()).cyan());
            println!("  Variables: {}", style(pipeline.variables.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = history_store(false).await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;
        match store.load_execution(exec_id).await? {
            Some(summary) => print_execution_details(&summary, cmd.verbose, cmd.json)?,
            None => bail!("Execution {} not found", exec_id),
        }
        return Ok(());
    }

    let mut executions = match &cmd.pipeline {
        Some(pipeline_name) => store.list_executions(pipeline_name).await?,
        None => store.list_recent(cmd.limit).await?,
    };
    executions.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    println!("{} Execution history (showing latest {}):", INFO, executions.len());
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
    }

    Ok(())
}

fn print_execution_details(summary: &ExecutionSummary, verbose: bool, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Ref: {} ({})", style(&summary.ref_name).cyan(), summary.source);
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Jobs: {} succeeded, {} failed, {} total ({})",
        style(summary.succeeded_jobs).green(),
        style(summary.failed_jobs).red(),
        summary.total_jobs,
        style(format!("{:.0}%", summary.progress * 100.0)).cyan()
    );

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
