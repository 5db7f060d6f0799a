use super::backoff::Backoff;
use super::ports::{ManualWorkSource, PrimeNetTransport, RenewOutcome, ResultSubmission, SubmitResponse, TransportError};
use super::result_buffer::SharedResultBuffer;
use super::session::{CommMode, CoordinatorHealth, CoordinatorSession};
use crate::common::CoordinatorError;
use crate::domains::status::{Alert, AlertKind};
use crate::domains::work_queue::{Assignment, AssignmentId, SharedWorkQueue};
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub request_timeout: std::time::Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures before falling back to manual mode.
    pub failure_threshold: u32,
    /// Renew reservations that lapse within this window.
    pub renew_ahead: Duration,
    pub low_water_mark: usize,
    pub pull_batch: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            request_timeout: std::time::Duration::from_secs(30),
            backoff_base: Duration::seconds(30),
            backoff_max: Duration::hours(1),
            failure_threshold: 3,
            renew_ahead: Duration::days(1),
            low_water_mark: 2,
            pull_batch: 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    pub accepted: usize,
    pub rejected: Vec<(AssignmentId, String)>,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub flushed: FlushSummary,
    pub renewed: usize,
    /// Checked-out work whose reservation lapsed. The caller stops the slot.
    pub expired_in_flight: Vec<AssignmentId>,
    pub confirmed: usize,
    pub abandoned: Vec<AssignmentId>,
    pub pulled: usize,
}

/// Client half of the work distribution protocol.
///
/// Every call is bounded by a timeout and gated by backoff; a failing server
/// never blocks the caller. After `failure_threshold` consecutive failures
/// work comes only from the manual source until a probe succeeds.
pub struct PrimeNetCoordinator {
    settings: CoordinatorSettings,
    session: CoordinatorSession,
    transport: Arc<dyn PrimeNetTransport>,
    manual_source: Option<Arc<dyn ManualWorkSource>>,
    backoff: Backoff,
    mode: CommMode,
    alerts: Vec<Alert>,
}

impl PrimeNetCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        session: CoordinatorSession,
        transport: Arc<dyn PrimeNetTransport>,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
        Self {
            settings,
            session,
            transport,
            manual_source: None,
            backoff,
            mode: CommMode::Online,
            alerts: Vec::new(),
        }
    }

    pub fn with_manual_source(mut self, source: Arc<dyn ManualWorkSource>) -> Self {
        self.manual_source = Some(source);
        self
    }

    pub fn session(&self) -> &CoordinatorSession {
        &self.session
    }

    pub fn results(&self) -> &SharedResultBuffer {
        &self.session.results
    }

    pub fn mode(&self) -> CommMode {
        self.mode
    }

    pub fn is_manual(&self) -> bool {
        self.mode != CommMode::Online
    }

    pub fn health(&self) -> CoordinatorHealth {
        match self.mode {
            CommMode::ForcedManual => CoordinatorHealth::Manual,
            CommMode::AutoManual => CoordinatorHealth::Degraded,
            CommMode::Online if self.backoff.failures() > 0 => CoordinatorHealth::Degraded,
            CommMode::Online => CoordinatorHealth::Healthy,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.failures()
    }

    pub fn take_alerts(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.alerts)
    }

    pub fn set_manual_mode(&mut self, enabled: bool, now: DateTime<Utc>) {
        if enabled {
            info!("manual communication enabled");
            self.mode = CommMode::ForcedManual;
        } else if self.mode != CommMode::Online {
            info!("manual communication disabled");
            self.mode = CommMode::Online;
            self.backoff.success();
            self.session.refresh(now);
        }
    }

    /// Fetch up to `count` assignments. In manual mode they come from the
    /// local source; a failed fetch that trips the fallback does too.
    pub async fn pull(&mut self, count: usize, now: DateTime<Utc>) -> Result<Vec<Assignment>, CoordinatorError> {
        if self.is_manual() {
            return self.draw_manual(count);
        }
        self.ensure_ready(now)?;
        let transport = self.transport.clone();
        match self
            .guarded(now, "get assignments", async move { transport.get_assignments(count).await })
            .await
        {
            Ok(assignments) => {
                debug!(count = assignments.len(), "assignments received");
                Ok(assignments)
            }
            Err(e) if self.is_manual() => {
                debug!(error = %e, "pull failed, drawing local work");
                self.draw_manual(count)
            }
            Err(e) => Err(e),
        }
    }

    /// Buffer a result for submission. Returns false for duplicates.
    pub fn record_result(&self, submission: ResultSubmission) -> bool {
        self.session.results.record(submission)
    }

    /// Submit one result. Safe to repeat: a result the server already
    /// accepted is answered locally.
    pub async fn push(
        &mut self,
        submission: ResultSubmission,
        now: DateTime<Utc>,
    ) -> Result<SubmitResponse, CoordinatorError> {
        let id = submission.assignment_id.clone();
        if self.session.results.is_accepted(&id) {
            return Ok(SubmitResponse::Accepted);
        }
        self.session.results.record(submission.clone());
        if self.is_manual() {
            return Err(CoordinatorError::ManualMode);
        }
        self.ensure_ready(now)?;

        let transport = self.transport.clone();
        let response = self
            .guarded(now, "submit result", async move { transport.submit_result(&submission).await })
            .await?;
        match &response {
            SubmitResponse::Accepted => {
                info!(assignment = %id, "result accepted");
                self.session.results.mark_accepted(&id, now);
            }
            SubmitResponse::Retry(reason) => {
                debug!(assignment = %id, %reason, "server deferred result");
            }
            SubmitResponse::Rejected { reason } => {
                warn!(assignment = %id, %reason, "result rejected");
                self.session.results.mark_rejected(&id, reason, now);
                let condition = CoordinatorError::SubmissionRejected {
                    assignment_id: id.to_string(),
                    reason: reason.clone(),
                };
                self.alerts.push(Alert::critical(AlertKind::SubmissionRejected, condition.to_string(), now));
            }
        }
        Ok(response)
    }

    /// Submit everything buffered. Stops at the first network failure.
    pub async fn flush(&mut self, now: DateTime<Utc>) -> FlushSummary {
        let mut summary = FlushSummary::default();
        for submission in self.session.results.pending() {
            let id = submission.assignment_id.clone();
            match self.push(submission, now).await {
                Ok(SubmitResponse::Accepted) => summary.accepted += 1,
                Ok(SubmitResponse::Rejected { reason }) => summary.rejected.push((id, reason)),
                Ok(SubmitResponse::Retry(_)) => {}
                Err(_) => break,
            }
        }
        summary.remaining = self.session.results.len();
        summary
    }

    /// Extend the reservation on `id`.
    pub async fn renew(
        &mut self,
        id: &AssignmentId,
        fraction_done: f64,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CoordinatorError> {
        if self.is_manual() {
            return Err(CoordinatorError::ManualMode);
        }
        self.ensure_ready(now)?;
        let transport = self.transport.clone();
        let target = id.clone();
        let outcome = self
            .guarded(now, "renew reservation", async move {
                transport.renew(&target, fraction_done).await
            })
            .await?;
        match outcome {
            RenewOutcome::Renewed { expires_at } => Ok(expires_at),
            RenewOutcome::Expired => Err(CoordinatorError::AssignmentExpired {
                assignment_id: id.to_string(),
            }),
        }
    }

    /// Check whether the server is back. Only meaningful after an automatic fallback.
    pub async fn probe(&mut self, now: DateTime<Utc>) -> bool {
        if self.mode != CommMode::AutoManual || !self.backoff.ready(now) {
            return false;
        }
        let transport = self.transport.clone();
        self.guarded(now, "probe", async move { transport.ping().await })
            .await
            .is_ok()
    }

    /// One round of housekeeping: probe, flush results, reconfirm and renew
    /// reservations, then top the queue up.
    pub async fn sync(
        &mut self,
        queue: &SharedWorkQueue,
        in_progress: &[(AssignmentId, f64)],
        now: DateTime<Utc>,
    ) -> SyncReport {
        let mut report = SyncReport::default();
        if self.mode == CommMode::AutoManual {
            self.probe(now).await;
        }

        if self.mode == CommMode::Online && self.backoff.ready(now) {
            report.flushed = self.flush(now).await;
            self.reconfirm(queue, now, &mut report).await;
            self.renew_due(queue, in_progress, now, &mut report).await;
        }

        if queue.depth() < self.settings.low_water_mark {
            match self.pull(self.settings.pull_batch, now).await {
                Ok(assignments) => {
                    for assignment in assignments {
                        let id = assignment.id.clone();
                        if self.session.results.knows(&id) {
                            debug!(assignment = %id, "skipping pulled assignment with a recorded result");
                            continue;
                        }
                        match queue.enqueue(assignment) {
                            Ok(()) => report.pulled += 1,
                            Err(e) => debug!(assignment = %id, error = %e, "skipping pulled assignment"),
                        }
                    }
                }
                Err(e) => debug!(error = %e, "queue refill skipped"),
            }
        }
        report
    }

    async fn reconfirm(&mut self, queue: &SharedWorkQueue, now: DateTime<Utc>, report: &mut SyncReport) {
        let waiting = queue.with(|q| q.awaiting_confirmation());
        for id in waiting {
            match self.renew(&id, 0.0, now).await {
                Ok(expires_at) => {
                    if queue.confirm(&id, expires_at).is_ok() {
                        info!(assignment = %id, "reservation reconfirmed");
                        report.confirmed += 1;
                    }
                }
                Err(CoordinatorError::AssignmentExpired { .. }) => {
                    if let Err(e) = queue.abandon(&id, "reservation lost on the server") {
                        warn!(assignment = %id, error = %e, "could not abandon expired work");
                        continue;
                    }
                    self.alerts.push(Alert::critical(
                        AlertKind::AssignmentExpired,
                        format!("assignment {id} is no longer reserved for this computer; dropped"),
                        now,
                    ));
                    report.abandoned.push(id);
                }
                Err(_) => break,
            }
        }
    }

    async fn renew_due(
        &mut self,
        queue: &SharedWorkQueue,
        in_progress: &[(AssignmentId, f64)],
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) {
        let due = queue.with(|q| q.reservations_due(now + self.settings.renew_ahead));
        for (id, _) in due {
            let fraction = in_progress
                .iter()
                .find(|(running, _)| *running == id)
                .map(|(_, f)| *f)
                .unwrap_or(0.0);
            match self.renew(&id, fraction, now).await {
                Ok(expires_at) => {
                    if queue.renew_reservation(&id, expires_at).is_ok() {
                        report.renewed += 1;
                    }
                }
                Err(CoordinatorError::AssignmentExpired { .. }) => {
                    self.alerts.push(Alert::warning(
                        AlertKind::AssignmentExpired,
                        format!("reservation for {id} lapsed; holding it for reconfirmation"),
                        now,
                    ));
                    let checked_out = queue.with(|q| q.entry(&id).map_or(false, |e| e.is_checked_out()));
                    if checked_out {
                        report.expired_in_flight.push(id);
                    } else if let Err(e) = queue.expire(&id) {
                        warn!(assignment = %id, error = %e, "could not mark assignment expired");
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn draw_manual(&self, count: usize) -> Result<Vec<Assignment>, CoordinatorError> {
        match &self.manual_source {
            Some(source) => source.draw(count).map_err(CoordinatorError::Transport),
            None => Ok(Vec::new()),
        }
    }

    fn ensure_ready(&self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        if self.backoff.ready(now) {
            return Ok(());
        }
        let until = self
            .backoff
            .next_attempt_at()
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
        Err(CoordinatorError::NetworkUnavailable(format!("backing off until {until}")))
    }

    async fn guarded<T, F>(&mut self, now: DateTime<Utc>, what: &str, call: F) -> Result<T, CoordinatorError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let outcome = match tokio::time::timeout(self.settings.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };
        match outcome {
            Ok(value) => {
                self.on_success(now);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(now, what, &e);
                Err(match e {
                    TransportError::Timeout | TransportError::Unreachable(_) => {
                        CoordinatorError::NetworkUnavailable(e.to_string())
                    }
                    TransportError::Unauthorized | TransportError::Protocol(_) => {
                        CoordinatorError::Transport(e.to_string())
                    }
                })
            }
        }
    }

    fn on_success(&mut self, now: DateTime<Utc>) {
        self.backoff.success();
        if self.mode == CommMode::AutoManual {
            info!(endpoint = %self.session.endpoint, "server reachable again, leaving manual mode");
            self.mode = CommMode::Online;
            self.session.refresh(now);
        } else {
            self.session.touch(now);
        }
    }

    fn on_failure(&mut self, now: DateTime<Utc>, what: &str, error: &TransportError) {
        let retry_at = self.backoff.failure(now);
        let failures = self.backoff.failures();
        warn!(
            call = what,
            error = %error,
            failures,
            retry_at = %retry_at.to_rfc3339(),
            "server call failed"
        );
        if self.mode == CommMode::Online && failures >= self.settings.failure_threshold {
            self.mode = CommMode::AutoManual;
            self.alerts.push(Alert::warning(
                AlertKind::NetworkUnavailable,
                format!("{failures} consecutive server failures; switching to manual mode"),
                now,
            ));
        }
    }
}
