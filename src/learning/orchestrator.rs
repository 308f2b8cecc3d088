//! Learn orchestrator
//!
//! Runs learn jobs through reflect → curate → apply on a pool of workers.
//! Progress is checkpointed on the job record: a stored reflection or
//! curation is reused instead of calling the capability again, so a job picked
//! up after a restart continues where it stopped. The apply step commits the
//! playbook changes and the job's completion in one transaction.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::applier::{ApplyReport, CurationApplier};
use super::capability::{Curator, CuratorInput, Reflector, ReflectorInput, CURATOR, REFLECTOR};
use super::retry::RetryPolicy;
use crate::config::LearningConfig;
use crate::error::{AceError, AceResult};
use crate::prompt::{extract_playbook_block, render_bullets, EMPTY_PLAYBOOK};
use crate::store::PlaybookStore;
use crate::types::{Curation, LearnJob, LearnRequest, Reflection};

/// How jobs are executed
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub reflector_timeout: Duration,
    pub curator_timeout: Duration,
    pub apply_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&LearningConfig::default())
    }
}

impl From<&LearningConfig> for OrchestratorSettings {
    fn from(config: &LearningConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            retry: RetryPolicy::from(&config.retry),
            reflector_timeout: config.timeouts.reflector(),
            curator_timeout: config.timeouts.curator(),
            apply_timeout: config.timeouts.apply(),
        }
    }
}

struct Pipeline {
    store: PlaybookStore,
    reflector: Arc<dyn Reflector>,
    curator: Arc<dyn Curator>,
    applier: CurationApplier,
    settings: OrchestratorSettings,
    /// Queued or running job ids, so a job never runs twice at once
    claimed: Mutex<HashSet<String>>,
}

/// Accepts learn requests and drives them to a terminal state
pub struct LearnOrchestrator {
    pipeline: Arc<Pipeline>,
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl LearnOrchestrator {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        store: PlaybookStore,
        reflector: Arc<dyn Reflector>,
        curator: Arc<dyn Curator>,
        applier: CurationApplier,
        settings: OrchestratorSettings,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<String>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let worker_count = settings.workers.max(1);

        let pipeline = Arc::new(Pipeline {
            store,
            reflector,
            curator,
            applier,
            settings,
            claimed: Mutex::new(HashSet::new()),
        });

        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker_loop(id, pipeline.clone(), receiver.clone())))
            .collect();

        info!(workers = worker_count, "Learn orchestrator started");

        Self {
            pipeline,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Validate the request, create a pending job and queue it.
    ///
    /// Returns as soon as the job is persisted; the pipeline runs later.
    pub async fn start_learn(&self, playbook_id: &str, request: LearnRequest) -> AceResult<LearnJob> {
        request.validate()?;

        let store = &self.pipeline.store;
        store.get_or_create_playbook(playbook_id).await?;
        let job = store.create_job(playbook_id, &request).await?;
        info!(job_id = %job.id, playbook_id, "Learn job created");

        self.enqueue(&job.id)?;
        Ok(job)
    }

    /// Current state of a job
    pub async fn get_job(&self, playbook_id: &str, job_id: &str) -> AceResult<LearnJob> {
        self.pipeline
            .store
            .get_job(playbook_id, job_id)
            .await?
            .ok_or_else(|| AceError::not_found(format!("learn job {}", job_id)))
    }

    /// Poll until the job is terminal or `timeout` passes
    pub async fn wait_for_job(
        &self,
        playbook_id: &str,
        job_id: &str,
        timeout: Duration,
    ) -> AceResult<LearnJob> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.get_job(playbook_id, job_id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AceError::Internal(format!(
                    "learn job {} still {} after {:?}",
                    job_id, job.status, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Re-queue every pending or running job. Called once at startup.
    pub async fn resume_incomplete(&self) -> AceResult<usize> {
        let ids = self.pipeline.store.list_incomplete_jobs().await?;
        let mut queued = 0;
        for id in &ids {
            if self.enqueue(id)? {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(jobs = queued, "Resuming unfinished learn jobs");
        }
        Ok(queued)
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Learn worker panicked: {}", e);
            }
        }
        info!("Learn orchestrator stopped");
    }

    /// Queue a job unless it is already queued or running
    fn enqueue(&self, job_id: &str) -> AceResult<bool> {
        if !self.pipeline.claim(job_id) {
            debug!(job_id, "Learn job already queued");
            return Ok(false);
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sent = sender
            .as_ref()
            .map(|tx| tx.send(job_id.to_string()).is_ok())
            .unwrap_or(false);

        if sent {
            Ok(true)
        } else {
            self.pipeline.release(job_id);
            Err(AceError::Internal(
                "learn orchestrator is shut down; job will resume on next start".to_string(),
            ))
        }
    }
}

async fn worker_loop(
    id: usize,
    pipeline: Arc<Pipeline>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(job_id) = next else { break };

        let span = tracing::info_span!("learn_job", job_id = %job_id, worker = id);
        if let Err(e) = pipeline.run_job(&job_id).instrument(span).await {
            error!(job_id = %job_id, "Learn job could not be processed: {}", e);
        }
        pipeline.release(&job_id);
    }
    debug!(worker = id, "Learn worker stopped");
}

impl Pipeline {
    fn claim(&self, job_id: &str) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_id.to_string())
    }

    fn release(&self, job_id: &str) {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(job_id);
    }

    /// Drive one job to a terminal state
    async fn run_job(&self, job_id: &str) -> AceResult<()> {
        let Some((job, request)) = self.store.get_job_with_input(job_id).await? else {
            warn!(job_id, "Queued learn job no longer exists");
            return Ok(());
        };

        if job.status.is_terminal() {
            debug!(job_id, status = %job.status, "Skipping finished learn job");
            return Ok(());
        }
        if !self.store.mark_job_running(job_id).await? {
            return Ok(());
        }
        info!(job_id, playbook_id = %job.playbook_id, "Learn job running");

        match self.execute(&job, &request).await {
            Ok(report) => {
                info!(
                    job_id,
                    playbook_id = %job.playbook_id,
                    added = report.added.len(),
                    updated = report.updated,
                    tagged = report.tagged,
                    removed = report.removed,
                    "Learn job completed"
                );
            }
            Err(e) => {
                let message = e.to_string();
                warn!(job_id, playbook_id = %job.playbook_id, "Learn job failed: {}", message);
                self.store.mark_job_failed(job_id, &message).await?;
            }
        }

        Ok(())
    }

    async fn execute(&self, job: &LearnJob, request: &LearnRequest) -> AceResult<ApplyReport> {
        let reflection = match &job.reflection {
            Some(reflection) => {
                debug!(job_id = %job.id, "Reusing stored reflection");
                reflection.clone()
            }
            None => self.reflect(job, request).await?,
        };

        let curation = match &job.curation {
            Some(curation) => {
                debug!(job_id = %job.id, "Reusing stored curation");
                curation.clone()
            }
            None => self.curate(job, request, reflection).await?,
        };

        let timeout = self.settings.apply_timeout;
        tokio::time::timeout(
            timeout,
            self.applier.apply_for_job(&job.playbook_id, &job.id, &curation),
        )
        .await
        .map_err(|_| {
            AceError::Internal(format!("applying curation timed out after {}s", timeout.as_secs()))
        })?
    }

    async fn reflect(&self, job: &LearnJob, request: &LearnRequest) -> AceResult<Reflection> {
        let input = ReflectorInput {
            playbook_id: job.playbook_id.clone(),
            retrieved_playbook: retrieved_playbook(request),
            trajectory: request.trajectory.clone(),
            ground_truth: request.ground_truth.clone(),
            evaluation: request.evaluation.clone(),
            additional_instructions: request.reflector_additional_instructions.clone(),
        };

        let reflection = self
            .settings
            .retry
            .run(REFLECTOR, self.settings.reflector_timeout, || {
                self.reflector.reflect(&input)
            })
            .await?;

        self.store.store_reflection(&job.id, &reflection).await?;
        debug!(
            job_id = %job.id,
            tags = reflection.bullet_tags.len(),
            "Reflection stored"
        );
        Ok(reflection)
    }

    async fn curate(
        &self,
        job: &LearnJob,
        request: &LearnRequest,
        reflection: Reflection,
    ) -> AceResult<Curation> {
        // The curator sees the playbook as it is now, not as the agent saw it
        let bullets = self.store.list_bullets(&job.playbook_id).await?;
        let input = CuratorInput {
            playbook_id: job.playbook_id.clone(),
            user_message: request.user_message.clone(),
            global_playbook: render_bullets(&bullets),
            trajectory: request.trajectory.clone(),
            reflection,
            additional_instructions: request.curator_additional_instructions.clone(),
        };

        let curation = self
            .settings
            .retry
            .run(CURATOR, self.settings.curator_timeout, || {
                self.curator.curate(&input)
            })
            .await?;

        self.store.store_curation(&job.id, &curation).await?;
        debug!(
            job_id = %job.id,
            operations = curation.operations.len(),
            "Curation stored"
        );
        Ok(curation)
    }
}

/// The playbook text the agent saw: supplied directly, else recovered from
/// the trajectory markers, else the empty placeholder
pub fn retrieved_playbook(request: &LearnRequest) -> String {
    request
        .retrieved_playbook
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .or_else(|| {
            extract_playbook_block(&request.trajectory).filter(|text| !text.trim().is_empty())
        })
        .unwrap_or(EMPTY_PLAYBOOK)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::learning::capability::{MockCurator, MockReflector};
    use crate::learning::locks::PlaybookLocks;
    use crate::types::{JobStatus, Operation, Tag};
    use std::sync::atomic::{AtomicU32, Ordering};

    const WAIT: Duration = Duration::from_secs(5);

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            workers: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            reflector_timeout: Duration::from_secs(2),
            curator_timeout: Duration::from_secs(2),
            apply_timeout: Duration::from_secs(2),
        }
    }

    fn reflection() -> Reflection {
        Reflection {
            reasoning: "agent created a duplicate".into(),
            error_identification: "no lookup".into(),
            root_cause_analysis: "skipped search".into(),
            correct_approach: "search first".into(),
            key_insight: "search the CRM before creating leads".into(),
            bullet_tags: Vec::new(),
        }
    }

    fn add_one() -> Curation {
        Curation {
            reasoning: "new lesson".into(),
            operations: vec![Operation::Add {
                content: "Search the CRM before creating a lead".into(),
            }],
        }
    }

    fn orchestrator(
        store: &PlaybookStore,
        reflector: MockReflector,
        curator: MockCurator,
    ) -> LearnOrchestrator {
        LearnOrchestrator::start(
            store.clone(),
            Arc::new(reflector),
            Arc::new(curator),
            CurationApplier::new(store.clone(), PlaybookLocks::new()),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_job_runs_to_completion() {
        let store = PlaybookStore::open_in_memory().unwrap();
        let mut reflector = MockReflector::new();
        reflector
            .expect_reflect()
            .withf(|input| input.retrieved_playbook == EMPTY_PLAYBOOK)
            .times(1)
            .returning(|_| Ok(reflection()));
        let mut curator = MockCurator::new();
        curator
            .expect_curate()
            .withf(|input| input.global_playbook.is_empty() && input.user_message == "add ACME")
            .times(1)
            .returning(|_| Ok(add_one()));

        let orch = orchestrator(&store, reflector, curator);
        let job = orch
            .start_learn("pb", LearnRequest::new("add ACME", "created lead twice"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = orch.wait_for_job("pb", &job.id, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.reflection, Some(reflection()));
        assert_eq!(done.curation, Some(add_one()));

        let bullets = store.list_bullets("pb").await.unwrap();
        assert_eq!(bullets.len(), 1);
        assert_eq!(bullets[0].content, "Search the CRM before creating a lead");
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_request_creates_no_job() {
        let store = PlaybookStore::open_in_memory().unwrap();
        let orch = orchestrator(&store, MockReflector::new(), MockCurator::new());

        let result = orch.start_learn("pb", LearnRequest::new("", "trace")).await;
        assert!(matches!(result, Err(AceError::Validation(_))));
        assert!(store.list_incomplete_jobs().await.unwrap().is_empty());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_stored_reflection_is_not_recomputed() {
        let store = PlaybookStore::open_in_memory().unwrap();
        store.get_or_create_playbook("pb").await.unwrap();
        let job = store
            .create_job("pb", &LearnRequest::new("m", "t"))
            .await
            .unwrap();
        store.store_reflection(&job.id, &reflection()).await.unwrap();

        let mut reflector = MockReflector::new();
        reflector.expect_reflect().never();
        let mut curator = MockCurator::new();
        curator
            .expect_curate()
            .withf(|input| input.reflection == reflection())
            .times(1)
            .returning(|_| Ok(add_one()));

        let orch = orchestrator(&store, reflector, curator);
        assert_eq!(orch.resume_incomplete().await.unwrap(), 1);

        let done = orch.wait_for_job("pb", &job.id, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_stored_curation_skips_both_capabilities() {
        let store = PlaybookStore::open_in_memory().unwrap();
        store.get_or_create_playbook("pb").await.unwrap();
        let job = store
            .create_job("pb", &LearnRequest::new("m", "t"))
            .await
            .unwrap();
        store.mark_job_running(&job.id).await.unwrap();
        store.store_reflection(&job.id, &reflection()).await.unwrap();
        store.store_curation(&job.id, &add_one()).await.unwrap();

        let mut reflector = MockReflector::new();
        reflector.expect_reflect().never();
        let mut curator = MockCurator::new();
        curator.expect_curate().never();

        let orch = orchestrator(&store, reflector, curator);
        orch.resume_incomplete().await.unwrap();

        let done = orch.wait_for_job("pb", &job.id, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(store.list_bullets("pb").await.unwrap().len(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_curator_failure_is_retried() {
        let store = PlaybookStore::open_in_memory().unwrap();
        let mut reflector = MockReflector::new();
        reflector
            .expect_reflect()
            .times(1)
            .returning(|_| Ok(reflection()));

        let calls = AtomicU32::new(0);
        let mut curator = MockCurator::new();
        curator.expect_curate().times(2).returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CapabilityError::Transport {
                    capability: CURATOR,
                    message: "503 Service Unavailable".into(),
                })
            } else {
                Ok(add_one())
            }
        });

        let orch = orchestrator(&store, reflector, curator);
        let job = orch
            .start_learn("pb", LearnRequest::new("m", "t"))
            .await
            .unwrap();
        let done = orch.wait_for_job("pb", &job.id, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_reflector_failure_fails_job() {
        let store = PlaybookStore::open_in_memory().unwrap();
        let mut reflector = MockReflector::new();
        reflector.expect_reflect().times(3).returning(|_| {
            Err(CapabilityError::Refused {
                capability: REFLECTOR,
                message: "cannot comply".into(),
            })
        });
        let mut curator = MockCurator::new();
        curator.expect_curate().never();

        let orch = orchestrator(&store, reflector, curator);
        let job = orch
            .start_learn("pb", LearnRequest::new("m", "t"))
            .await
            .unwrap();
        let done = orch.wait_for_job("pb", &job.id, WAIT).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("cannot comply"));
        assert!(done.reflection.is_none());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_reference_fails_without_retry() {
        let store = PlaybookStore::open_in_memory().unwrap();
        let mut reflector = MockReflector::new();
        reflector
            .expect_reflect()
            .times(1)
            .returning(|_| Ok(reflection()));
        let mut curator = MockCurator::new();
        curator.expect_curate().times(1).returning(|_| {
            Ok(Curation {
                reasoning: "r".into(),
                operations: vec![
                    Operation::Add {
                        content: "A".into(),
                    },
                    Operation::Tag {
                        bullet_id: "ghost".into(),
                        tag: Tag::Helpful,
                    },
                ],
            })
        });

        let orch = orchestrator(&store, reflector, curator);
        let job = orch
            .start_learn("pb", LearnRequest::new("m", "t"))
            .await
            .unwrap();
        let done = orch.wait_for_job("pb", &job.id, WAIT).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("ghost"));
        // partial results stay visible
        assert!(done.reflection.is_some());
        assert!(done.curation.is_some());
        assert!(store.list_bullets("pb").await.unwrap().is_empty());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let store = PlaybookStore::open_in_memory().unwrap();
        let orch = orchestrator(&store, MockReflector::new(), MockCurator::new());
        orch.shutdown().await;

        let result = orch.start_learn("pb", LearnRequest::new("m", "t")).await;
        assert!(result.is_err());
        // the job is persisted and will be resumed on the next start
        assert_eq!(store.list_incomplete_jobs().await.unwrap().len(), 1);
    }

    #[test]
    fn test_retrieved_playbook_sources() {
        let mut request = LearnRequest::new("m", "no markers");
        assert_eq!(retrieved_playbook(&request), EMPTY_PLAYBOOK);

        request.trajectory =
            "sys: **PLAYBOOK_BEGIN**\n- [b1] helpful=0 harmful=0 :: x\n**PLAYBOOK_END**".into();
        assert_eq!(retrieved_playbook(&request), "- [b1] helpful=0 harmful=0 :: x");

        request.retrieved_playbook = Some("- [b2] helpful=0 harmful=0 :: y".into());
        assert_eq!(retrieved_playbook(&request), "- [b2] helpful=0 harmful=0 :: y");

        request.trajectory = "**PLAYBOOK_BEGIN**\n\n**PLAYBOOK_END**".into();
        request.retrieved_playbook = Some("   ".into());
        assert_eq!(retrieved_playbook(&request), EMPTY_PLAYBOOK);
    }
}
