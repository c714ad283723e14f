//! `geoharvest run`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use geoharvest_cli_utils::{IndicatifProgress, MultiProgress, stage_spinner};
use geoharvest_export::ExportFormat;
use geoharvest_pipeline::{Pipeline, PipelineEvent, PipelineRequest, RunOutcome, spawn_pipeline};
use geoharvest_service::transport::HttpTransport;

/// Loads `config`, applies the command-line overrides and runs it.
///
/// # Errors
///
/// Returns an error if the request is invalid, the HTTP client cannot be
/// built, or the run fails.
pub async fn run(
    multi: &MultiProgress,
    config: &Path,
    output: Option<PathBuf>,
    format: Option<ExportFormat>,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut request = PipelineRequest::load(config).await?;
    apply_overrides(&mut request, output, format);
    let format = request.output.resolved_format()?;

    log::info!(
        "{} datasets -> {} ({format})",
        request.datasets.len(),
        request.output.path.display()
    );

    let pipeline = Pipeline::new(Arc::new(HttpTransport::new()?))
        .with_progress(IndicatifProgress::features_bar(multi, "Downloading"));
    let mut handle = spawn_pipeline(pipeline, request);

    let token = handle.token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; stopping at the next checkpoint");
            token.cancel();
        }
    });

    let spinner = stage_spinner(multi);
    while let Some(event) = handle.events.recv().await {
        match event {
            PipelineEvent::StageStarted {
                stage,
                dataset: Some(dataset),
            } => spinner.set_message(format!("{stage}: {dataset}")),
            PipelineEvent::StageStarted {
                stage,
                dataset: None,
            } => spinner.set_message(stage.to_string()),
            PipelineEvent::StageFinished { stage, features } => {
                log::debug!("{stage}: {features} features");
            }
            PipelineEvent::Warning { message } => spinner.println(format!("warning: {message}")),
            PipelineEvent::Finished { .. }
            | PipelineEvent::Cancelled { .. }
            | PipelineEvent::Failed { .. } => spinner.finish_and_clear(),
        }
    }

    match handle.task.await?? {
        RunOutcome::Completed(report) => {
            println!();
            println!(
                "Wrote {} features in {:.1}s:",
                report.features,
                start.elapsed().as_secs_f64()
            );
            for file in &report.output.files {
                println!("  {}", file.display());
            }
            println!();
            println!("Processing log:");
            for entry in &report.log {
                println!(
                    "  {} {:<18} {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.operation,
                    entry.summary
                );
            }
            if !report.warnings.is_empty() {
                println!();
                println!("{} warnings:", report.warnings.len());
                for warning in &report.warnings {
                    println!("  {warning}");
                }
            }
        }
        RunOutcome::Cancelled { stage } => {
            println!("Cancelled during {stage}; no output was written.");
        }
    }

    Ok(())
}

fn apply_overrides(
    request: &mut PipelineRequest,
    output: Option<PathBuf>,
    format: Option<ExportFormat>,
) {
    if let Some(path) = output {
        // A new extension implies a new format unless one is given.
        request.output.format = format
            .or_else(|| ExportFormat::from_path(&path))
            .or(request.output.format);
        request.output.path = path;
    } else if format.is_some() {
        request.output.format = format;
    }
}
