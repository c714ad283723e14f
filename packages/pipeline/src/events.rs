//! Background runs.
//!
//! [`spawn_pipeline`] moves a [`Pipeline`] onto the runtime and returns a
//! [`PipelineHandle`] holding the run's cancellation token, the event
//! receiver and the task. The last event is always one of
//! [`PipelineEvent::Finished`], [`PipelineEvent::Cancelled`] or
//! [`PipelineEvent::Failed`].

use std::path::PathBuf;

use geoharvest_feature_models::CancellationToken;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Pipeline, PipelineError, PipelineRequest, RunOutcome, Stage};

/// Channel capacity for [`spawn_pipeline`].
pub const EVENT_BUFFER: usize = 64;

/// Progress of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A stage began.
    StageStarted {
        /// The stage.
        stage: Stage,
        /// Dataset label for per-dataset stages.
        dataset: Option<String>,
    },
    /// A stage produced its output.
    StageFinished {
        /// The stage.
        stage: Stage,
        /// Features in the stage output.
        features: usize,
    },
    /// Something was skipped or bypassed.
    Warning {
        /// What happened.
        message: String,
    },
    /// Output was written.
    Finished {
        /// Features exported.
        features: usize,
        /// Files created.
        files: Vec<PathBuf>,
    },
    /// The run stopped on cancellation.
    Cancelled {
        /// Stage that observed the token.
        stage: Stage,
    },
    /// The run failed.
    Failed {
        /// Error text.
        message: String,
    },
}

/// A run in progress.
pub struct PipelineHandle {
    /// The run's token. Cancelling it stops the run at the next checkpoint.
    pub token: CancellationToken,
    /// Stage events, in order.
    pub events: mpsc::Receiver<PipelineEvent>,
    /// The run itself.
    pub task: JoinHandle<Result<RunOutcome, PipelineError>>,
}

impl PipelineHandle {
    /// Requests cancellation.
    pub fn cancel(&self) {
        if self.token.cancel() {
            log::info!("Cancellation requested");
        }
    }
}

/// Starts `request` on a background task.
///
/// The caller must keep draining [`PipelineHandle::events`] (or drop it);
/// a full channel pauses the run.
#[must_use]
pub fn spawn_pipeline(pipeline: Pipeline, request: PipelineRequest) -> PipelineHandle {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let token = CancellationToken::new();
    let run_token = token.clone();
    let pipeline = pipeline.with_events(tx.clone());

    let task = tokio::spawn(async move {
        let result = pipeline.run(&request, &run_token).await;

        let last = match &result {
            Ok(RunOutcome::Completed(report)) => PipelineEvent::Finished {
                features: report.features,
                files: report.output.files.clone(),
            },
            Ok(RunOutcome::Cancelled { stage }) => PipelineEvent::Cancelled { stage: *stage },
            Err(e) => PipelineEvent::Failed {
                message: e.to_string(),
            },
        };
        let _ = tx.send(last).await;

        result
    });

    PipelineHandle {
        token,
        events: rx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{HarvestStub, request};

    async fn drain(handle: &mut PipelineHandle) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn background_run_reports_stages_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(HarvestStub::new(10));
        let mut handle = spawn_pipeline(
            Pipeline::new(stub),
            request(&dir.path().join("bg.fgb"), ""),
        );

        let events = drain(&mut handle).await;
        let outcome = handle.task.await.unwrap().unwrap();

        assert!(!outcome.is_cancelled());
        assert_eq!(outcome.report().unwrap().features, 10);
        assert_eq!(
            events.first(),
            Some(&PipelineEvent::StageStarted {
                stage: Stage::Resolve,
                dataset: Some("prodes/cerrado/yearly".to_string()),
            })
        );
        assert!(events.contains(&PipelineEvent::StageFinished {
            stage: Stage::Assemble,
            features: 10,
        }));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::Finished { features: 10, files }) if files.len() == 1
        ));
    }

    #[tokio::test]
    async fn cancelled_background_run() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bg.fgb");
        let stub = Arc::new(HarvestStub::new(10));
        let mut handle = spawn_pipeline(Pipeline::new(stub), request(&dest, ""));
        handle.cancel();

        let events = drain(&mut handle).await;
        let outcome = handle.task.await.unwrap().unwrap();

        assert!(outcome.is_cancelled());
        assert!(matches!(events.last(), Some(PipelineEvent::Cancelled { .. })));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn failed_background_run() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(HarvestStub::new(10));
        let mut req = request(&dir.path().join("bg.fgb"), "");
        req.datasets[0].family = "unknown".to_string();
        let mut handle = spawn_pipeline(Pipeline::new(stub), req);

        let events = drain(&mut handle).await;
        let err = handle.task.await.unwrap().unwrap_err();

        assert_eq!(err.stage, Stage::Resolve);
        assert!(matches!(events.last(), Some(PipelineEvent::Failed { .. })));
    }
}
