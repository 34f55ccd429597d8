//! Job coordinator: fast acknowledgment, single-flight job table and the
//! detached pipeline run that owns when a read marker may advance.

use crate::config::JobsConfig;
use crate::enrich::{self, NormalizedMessage};
use crate::error::JobError;
use crate::job::{AckStatus, JobKey, JobState, SummaryJob, SummaryMode, SummaryRequest, derive_job_id};
use crate::read_state::{AdvanceOutcome, ReadStateStore};
use crate::report::{self, DisplayPayload};
use crate::retry::RetryPolicy;
use crate::summarizer::{SummaryEngine, SummaryWindow, Summarizer};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use recap_channels::{
    AuthorDirectory, ChannelId, DeliveryError, DeliveryNotifier, FetchWindow, MessageSource,
    OutboundReport, Position, SourceError, UserId, Visibility,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// External collaborators, constructed once by the owning process.
pub struct Collaborators {
    pub source: Arc<dyn MessageSource>,
    pub directory: Arc<dyn AuthorDirectory>,
    pub engine: Arc<dyn SummaryEngine>,
    pub notifier: Arc<dyn DeliveryNotifier>,
    pub read_state: Arc<dyn ReadStateStore>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub lookback: Duration,
    pub job_budget: Duration,
    pub fetch_timeout: Duration,
    pub summarize_timeout: Duration,
    pub delivery_timeout: Duration,
    pub source_retry: RetryPolicy,
    pub summarizer_retry: RetryPolicy,
    pub delivery_retry: RetryPolicy,
    pub retention: Duration,
    pub max_contributors: usize,
}

impl CoordinatorSettings {
    pub fn from_config(jobs: &JobsConfig) -> Self {
        let base = Duration::from_millis(jobs.retry_base_ms);
        let max = Duration::from_millis(jobs.retry_max_ms);
        Self {
            lookback: jobs.window(),
            job_budget: Duration::from_secs(jobs.job_budget_seconds),
            fetch_timeout: Duration::from_secs(jobs.fetch_timeout_seconds),
            summarize_timeout: Duration::from_secs(jobs.summarize_timeout_seconds),
            delivery_timeout: Duration::from_secs(jobs.delivery_timeout_seconds),
            source_retry: RetryPolicy::new(jobs.source_retries, base, max),
            summarizer_retry: RetryPolicy::new(jobs.summarizer_retries(), base, max),
            delivery_retry: RetryPolicy::new(jobs.delivery_retries, base, max),
            retention: Duration::from_secs(jobs.retention_seconds),
            max_contributors: jobs.max_contributors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AckResult {
    pub job_id: String,
    pub status: AckStatus,
    pub payload: DisplayPayload,
}

struct JobEntry {
    job: SummaryJob,
    state: Arc<watch::Sender<JobState>>,
    finished_at: Option<Instant>,
}

/// Everything a freshly registered run needs once the table guard is released.
type Launch = (SummaryJob, Arc<watch::Sender<JobState>>, CancellationToken);

struct MarkerAdvance {
    channel_id: ChannelId,
    position: Position,
}

/// Resolved identity of a run: spelling-independent, unlike [`JobKey`].
type ChannelSlot = (UserId, ChannelId, SummaryMode);

struct SlotHolder {
    epoch: u64,
    job_id: String,
}

/// Releases the slot when the run that claimed it ends, however it ends.
struct SlotClaim<'a> {
    slots: &'a DashMap<ChannelSlot, SlotHolder>,
    slot: ChannelSlot,
    epoch: u64,
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        self.slots
            .remove_if(&self.slot, |_, holder| holder.epoch == self.epoch);
    }
}

enum Prepared<'a> {
    Report {
        payload: DisplayPayload,
        advance: Option<MarkerAdvance>,
        claim: SlotClaim<'a>,
    },
    /// Another run already holds the resolved slot.
    Joined { holder: String },
}

pub struct JobCoordinator {
    collaborators: Collaborators,
    summarizer: Summarizer,
    settings: CoordinatorSettings,
    jobs: DashMap<JobKey, JobEntry>,
    slots: DashMap<ChannelSlot, SlotHolder>,
    epochs: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl JobCoordinator {
    pub fn new(collaborators: Collaborators, settings: CoordinatorSettings) -> Arc<Self> {
        let summarizer = Summarizer::new(
            collaborators.engine.clone(),
            settings.summarize_timeout,
            settings.summarizer_retry,
            settings.max_contributors,
        );
        Arc::new(Self {
            collaborators,
            summarizer,
            settings,
            jobs: DashMap::new(),
            slots: DashMap::new(),
            epochs: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Register the request and return an acknowledgment without waiting on any I/O.
    ///
    /// Only the job table is touched here; the pipeline runs on a tracked task.
    pub fn submit(self: &Arc<Self>, request: SummaryRequest) -> AckResult {
        let key = JobKey::new(request.user_id.clone(), &request.channel, request.mode);
        let label = channel_label(&request.channel);
        let mode = request.mode;

        let (status, job_id, spawn) = match self.jobs.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let finished_at = existing.finished_at;
                let same_callback = existing.job.callback == request.callback;
                let existing_id = existing.job.id.clone();
                match finished_at {
                    None => (AckStatus::Joined, existing_id, None),
                    Some(finished)
                        if same_callback && finished.elapsed() < self.settings.retention =>
                    {
                        (AckStatus::Duplicate, existing_id, None)
                    }
                    Some(_) => {
                        let (entry, spawn) = self.new_entry(key, request);
                        let job_id = entry.job.id.clone();
                        occupied.insert(entry);
                        (AckStatus::Started, job_id, Some(spawn))
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (entry, spawn) = self.new_entry(key, request);
                let job_id = entry.job.id.clone();
                vacant.insert(entry);
                (AckStatus::Started, job_id, Some(spawn))
            }
        };

        if let Some((job, state, cancel)) = spawn {
            let span = tracing::info_span!(
                "summary_job",
                job_id = %job.id,
                user_id = %job.key.user_id,
                channel = %job.channel,
                mode = %job.mode()
            );
            self.tracker
                .spawn(self.clone().run(job, state, cancel).instrument(span));
        }

        tracing::info!(job_id = %job_id, status = ?status, %mode, "summary request acknowledged");
        AckResult {
            payload: report::build_ack(status, mode, &label),
            job_id,
            status,
        }
    }

    fn new_entry(&self, key: JobKey, request: SummaryRequest) -> (JobEntry, Launch) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let job = SummaryJob {
            id: derive_job_id(&key, epoch),
            key,
            epoch,
            channel: request.channel,
            visibility: request.visibility,
            callback: request.callback,
            lookback: self.settings.lookback,
            created_at: Utc::now(),
        };
        let (state, _) = watch::channel(JobState::Pending);
        let state = Arc::new(state);
        let cancel = self.shutdown.child_token();
        let entry = JobEntry {
            job: job.clone(),
            state: state.clone(),
            finished_at: None,
        };
        (entry, (job, state, cancel))
    }

    async fn run(
        self: Arc<Self>,
        job: SummaryJob,
        state: Arc<watch::Sender<JobState>>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let mut label = channel_label(&job.channel);
        let budget = self.settings.job_budget;
        let deadline = tokio::time::Instant::now() + budget;

        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.prepare(&job, &state, &mut label)) => {
                result.unwrap_or(Err(JobError::DeadlineExceeded(budget)))
            }
        };

        // Once a post has started the callback may already hold it, so delivery
        // errors are logged and never followed by a failure report.
        let final_state = match prepared {
            Ok(Prepared::Report {
                payload,
                advance,
                claim,
            }) => {
                state.send_replace(JobState::Delivering);
                let delivered = self
                    .deliver_within(&job, payload, job.visibility, &cancel, deadline)
                    .await;
                let final_state = match delivered {
                    Ok(()) => {
                        if let Some(advance) = advance {
                            self.advance_marker(&job, advance).await;
                        }
                        JobState::Delivered
                    }
                    Err(error) => delivery_abandoned(&error),
                };
                drop(claim);
                final_state
            }
            Ok(Prepared::Joined { holder }) => {
                tracing::info!(holder_job_id = %holder, "channel already being summarized; joined");
                state.send_replace(JobState::Delivering);
                let notice = report::build_ack(AckStatus::Joined, job.mode(), &label);
                match self
                    .deliver_within(&job, notice, Visibility::Private, &cancel, deadline)
                    .await
                {
                    Ok(()) => JobState::Delivered,
                    Err(error) => delivery_abandoned(&error),
                }
            }
            Err(error) => self.fail(&job, &label, error).await,
        };

        if let Some(mut entry) = self.jobs.get_mut(&job.key) {
            if entry.job.epoch == job.epoch {
                entry.finished_at = Some(Instant::now());
            }
        }
        state.send_replace(final_state);
        tracing::info!(
            state = final_state.as_str(),
            created_at = %job.created_at,
            latency_ms = started.elapsed().as_millis() as u64,
            "summary job finished"
        );
    }

    async fn fail(&self, job: &SummaryJob, label: &str, error: JobError) -> JobState {
        tracing::warn!(%error, kind = error.kind().as_str(), "summary job failed");
        if error.deliverable() {
            self.deliver_failure(job, label, &error).await;
        } else {
            tracing::error!(%error, "summary could not be delivered; callback target is unusable");
        }
        JobState::Failed(error.kind())
    }

    /// Stages up to a rendered report. Nothing is posted from here.
    async fn prepare<'a>(
        &'a self,
        job: &SummaryJob,
        state: &watch::Sender<JobState>,
        label: &mut String,
    ) -> Result<Prepared<'a>, JobError> {
        let source = self.collaborators.source.as_ref();
        let mode = job.mode();
        let user = &job.key.user_id;
        let set_state = |next: JobState| {
            tracing::debug!(state = next.as_str(), "summary job stage");
            state.send_replace(next);
        };

        set_state(JobState::Fetching);
        let reference = job.channel.as_str();
        let channel = self
            .source_call("resolve_channel", move |_| source.resolve_channel(reference))
            .await?;
        *label = channel.label();
        let channel_ref = &channel;
        self.source_call("check_access", move |_| source.check_access(channel_ref, user))
            .await?;

        let claim = match self.claim_slot(job, &channel.id) {
            Ok(claim) => claim,
            Err(holder) => return Ok(Prepared::Joined { holder }),
        };

        let marker = match mode {
            SummaryMode::Unread => self
                .collaborators
                .read_state
                .get(user, &channel.id)
                .await
                .map_err(|e| JobError::StateUnavailable(e.to_string()))?
                .map(|marker| marker.position),
            SummaryMode::Complete => None,
        };

        let now = Utc::now();
        let lookback_start = now
            .checked_sub_signed(TimeDelta::from_std(job.lookback).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let oldest = match marker {
            Some(marker) => marker.max(Position::from_datetime(lookback_start)),
            None => Position::from_datetime(lookback_start),
        };
        let window = FetchWindow {
            oldest: Some(oldest),
            latest: Some(Position::from_datetime(now)),
        };
        let summary_window = SummaryWindow {
            start: oldest.to_datetime().unwrap_or(lookback_start),
            end: now,
        };
        let window_ref = &window;
        let batch = self
            .source_call("fetch_messages", move |_| source.fetch_messages(channel_ref, window_ref))
            .await?;
        tracing::debug!(
            source = source.source_id(),
            fetched = batch.messages.len(),
            truncated = batch.truncated,
            marker = ?marker,
            "messages fetched"
        );
        if batch.truncated {
            tracing::warn!(
                fetched = batch.messages.len(),
                "history truncated; summarizing the newest messages and holding the read marker"
            );
        }

        set_state(JobState::Enriching);
        let names = enrich::resolve_authors(self.collaborators.directory.as_ref(), &batch.messages).await;
        let mut messages: Vec<NormalizedMessage> = enrich::enrich(&batch.messages, &names);

        if mode == SummaryMode::Unread {
            set_state(JobState::Filtering);
            messages = enrich::filter_after(messages, marker);
        }

        set_state(JobState::Summarizing);
        let mut result = self
            .summarizer
            .summarize(&messages, mode, summary_window)
            .await?;
        result.partial = batch.truncated;

        set_state(JobState::Formatting);
        let payload = report::build(&result, label);

        // A truncated fetch is missing the oldest unread messages; moving past them would skip them.
        let advance = match mode {
            SummaryMode::Unread if !batch.truncated => {
                result.latest_position.map(|position| MarkerAdvance {
                    channel_id: channel.id.clone(),
                    position,
                })
            }
            SummaryMode::Unread | SummaryMode::Complete => None,
        };
        Ok(Prepared::Report {
            payload,
            advance,
            claim,
        })
    }

    /// Claim the resolved (user, channel, mode) slot, or name the job already holding it.
    fn claim_slot(&self, job: &SummaryJob, channel_id: &ChannelId) -> Result<SlotClaim<'_>, String> {
        let slot = (job.key.user_id.clone(), channel_id.clone(), job.mode());
        match self.slots.entry(slot.clone()) {
            Entry::Occupied(held) => Err(held.get().job_id.clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(SlotHolder {
                    epoch: job.epoch,
                    job_id: job.id.clone(),
                });
                Ok(SlotClaim {
                    slots: &self.slots,
                    slot,
                    epoch: job.epoch,
                })
            }
        }
    }

    async fn source_call<'a, T, F>(&self, operation: &'static str, mut op: F) -> Result<T, JobError>
    where
        F: FnMut(u32) -> BoxFuture<'a, Result<T, SourceError>>,
        T: 'a,
    {
        let timeout = self.settings.fetch_timeout;
        self.settings
            .source_retry
            .run(
                operation,
                move |attempt| {
                    let call = op(attempt);
                    async move {
                        tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                            Err(SourceError::Unavailable(format!("{operation} timed out")))
                        })
                    }
                    .boxed()
                },
                SourceError::is_transient,
            )
            .await
            .map_err(|attempted| JobError::from_source(attempted.error, attempted.attempts))
    }

    async fn deliver(
        &self,
        job: &SummaryJob,
        payload: DisplayPayload,
        visibility: Visibility,
    ) -> Result<(), JobError> {
        let report = &OutboundReport {
            text: payload.text,
            blocks: payload.blocks,
            visibility,
            replace_original: true,
        };
        let notifier = self.collaborators.notifier.as_ref();
        let callback = &job.callback;
        let timeout = self.settings.delivery_timeout;
        self.settings
            .delivery_retry
            .run(
                "deliver",
                move |_| {
                    async move {
                        tokio::time::timeout(timeout, notifier.post(callback, report))
                            .await
                            .unwrap_or_else(|_| {
                                Err(DeliveryError::Transport("delivery timed out".to_string()))
                            })
                    }
                    .boxed()
                },
                DeliveryError::is_transient,
            )
            .await
            .map_err(|attempted| JobError::DeliveryFailed {
                attempts: attempted.attempts,
                detail: attempted.error.to_string(),
            })
    }

    /// [`Self::deliver`] under what is left of the job budget.
    async fn deliver_within(
        &self,
        job: &SummaryJob,
        payload: DisplayPayload,
        visibility: Visibility,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<(), JobError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.deliver(job, payload, visibility)) => {
                result.unwrap_or(Err(JobError::DeadlineExceeded(self.settings.job_budget)))
            }
        }
    }

    async fn deliver_failure(&self, job: &SummaryJob, label: &str, error: &JobError) {
        let payload = report::build_failure(error, label);
        if let Err(delivery_error) = self.deliver(job, payload, Visibility::Private).await {
            tracing::error!(error = %delivery_error, "failure report could not be delivered");
        }
    }

    async fn advance_marker(&self, job: &SummaryJob, advance: MarkerAdvance) {
        let result = self
            .collaborators
            .read_state
            .advance(&job.key.user_id, &advance.channel_id, advance.position)
            .await;
        match result {
            Ok(AdvanceOutcome::Stale { current }) => tracing::info!(
                %current,
                requested = %advance.position,
                "read marker already past delivered messages"
            ),
            Ok(outcome) => tracing::info!(
                position = %advance.position,
                outcome = ?outcome,
                "read marker advanced"
            ),
            Err(error) => tracing::error!(
                %error,
                position = %advance.position,
                "read marker advance failed after delivery"
            ),
        }
    }

    #[cfg(test)]
    pub fn subscribe(&self, key: &JobKey) -> Option<watch::Receiver<JobState>> {
        self.jobs.get(key).map(|entry| entry.state.subscribe())
    }

    /// Wait for the current job under `key` to reach a terminal state.
    #[cfg(test)]
    pub async fn wait(&self, key: &JobKey) -> Option<JobState> {
        let mut rx = self.subscribe(key)?;
        let state = *rx.wait_for(|state| state.is_terminal()).await.ok()?;
        Some(state)
    }

    pub fn in_flight_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.finished_at.is_none())
            .count()
    }

    /// Drop terminal entries older than the retention window.
    pub fn sweep(&self) -> usize {
        let before = self.jobs.len();
        let retention = self.settings.retention;
        self.jobs.retain(|_, entry| {
            entry
                .finished_at
                .is_none_or(|finished| finished.elapsed() < retention)
        });
        before.saturating_sub(self.jobs.len())
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let coordinator = self.clone();
        let shutdown = self.shutdown.child_token();
        self.tracker.spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("job sweeper received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = coordinator.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "expired jobs swept");
                        }
                    }
                }
            }
        });
    }

    /// Cancel every job and wait up to `grace` for the detached tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tracker.len(),
                "timed out waiting for summary jobs to finish"
            );
        } else {
            tracing::info!("summary jobs drained");
        }
    }
}

fn delivery_abandoned(error: &JobError) -> JobState {
    tracing::error!(
        %error,
        kind = error.kind().as_str(),
        "delivery did not complete; no further post to this callback"
    );
    JobState::Failed(error.kind())
}

/// `#name` for a raw reference before it has been resolved.
pub fn channel_label(reference: &str) -> String {
    let trimmed = reference.trim();
    if let Some(inner) = trimmed.strip_prefix("<#").and_then(|s| s.strip_suffix('>')) {
        return match inner.split_once('|') {
            Some((_, name)) if !name.trim().is_empty() => format!("#{}", name.trim()),
            Some((id, _)) => format!("#{}", id.trim()),
            None => format!("#{}", inner.trim()),
        };
    }
    format!("#{}", trimmed.trim_start_matches('#'))
}
