//! Experiment controller: drives one participant session end to end.
//!
//! The controller owns the state machine and the devices. A presentation
//! layer talks to it only through [`SessionHandle`]: it renders
//! [`SessionEvent`]s and forwards [`OperatorCommand`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use entrain_core::{
    resume_plan, Allocation, Ear, FailedTrial, FailureKind, ParticipantId, Pause, PauseKind, Phase, PhaseEntry,
    QualityCheck, SequenceSlot, SessionState, Step, StimulusSchedule, SummaryRow, TrialDescriptor, TrialId,
    TrialMetrics, TrialRecord, TrialSequencer,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::allocator::{AllocationError, Allocator};
use crate::analysis::{detect_tap, AnalysisBridge, AnalysisError};
use crate::audio_io::DuplexDevice;
use crate::capture::{CaptureCoordinator, CaptureError, ChannelMap};
use crate::store::{OutputStore, StoreError};

/// Operator input forwarded by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Continue past a prompt
    Acknowledge,
    /// End the running pause early
    CancelPause,
    /// Repeat a failed ear check
    RetryCheck,
    /// Accept a failed ear check and move on
    SkipCheck,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    StartPractice(SequenceSlot),
    StartTrials(SequenceSlot),
    EarCheckRetry(Ear),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SessionStarted {
        participant: ParticipantId,
        allocation: Allocation,
        resumed: bool,
        pending_trials: usize,
    },
    EarCheckStarted(Ear),
    EarCheckPassed(Ear),
    EarCheckFailed(Ear),
    AwaitingOperator(Prompt),
    PhaseStarted(PhaseEntry),
    TrialStarted(TrialDescriptor),
    /// Listen-only trial played
    TrialPresented(TrialDescriptor),
    TrialPersisted {
        trial: TrialDescriptor,
        id: TrialId,
        metrics: TrialMetrics,
        quality: QualityCheck,
    },
    TrialFailed {
        trial: TrialDescriptor,
        kind: FailureKind,
        reason: String,
    },
    PauseStarted {
        kind: PauseKind,
        duration: Duration,
    },
    PauseEnded {
        kind: PauseKind,
        elapsed: Duration,
        cancelled: bool,
    },
    SessionFinished(SessionReport),
    SessionAborted,
    SessionFailed(String),
}

/// Outcome of a session run
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub participant: ParticipantId,
    pub allocation: Allocation,
    pub persisted: Vec<TrialId>,
    pub failed: Vec<FailedTrial>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub response_window_ms: f64,
    pub ear_check: bool,
    /// Wait for an operator acknowledge before practice and before test trials
    pub await_operator: bool,
    /// Attempts per trial; 1 means no automatic retry
    pub trial_attempts: u32,
    pub max_consecutive_capture_failures: u32,
    /// Silence between the two practice playbacks
    pub practice_gap: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_window_ms: 1000.0,
            ear_check: true,
            await_operator: true,
            trial_attempts: 1,
            max_consecutive_capture_failures: 3,
            practice_gap: Duration::from_secs(1),
        }
    }
}

/// Trial-local failure; the session carries on after logging it
#[derive(Debug, Error)]
pub enum TrialError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TrialError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Capture(_) => FailureKind::Capture,
            Self::Analysis(_) => FailureKind::Analysis,
            Self::Store(_) => FailureKind::Store,
        }
    }

    /// Operator-facing reason. Device, collaborator and filesystem detail
    /// stays in the log.
    pub fn operator_reason(&self) -> &'static str {
        match self {
            Self::Capture(e) => match e {
                CaptureError::Overrun => "Recording dropped audio",
                CaptureError::LateCapture { .. } => "Recording started after playback",
                CaptureError::NotArmed | CaptureError::Timeout => "Audio device stopped responding",
                CaptureError::ChannelMissing(_) | CaptureError::SampleRateMismatch { .. } => {
                    "Audio device configuration does not match the session"
                }
                CaptureError::DeviceUnavailable(_) | CaptureError::Stream(_) => "Audio device error",
                CaptureError::Aborted => "Aborted by operator",
            },
            Self::Analysis(e) => match e {
                AnalysisError::Rejected(_) => "Analysis rejected the recording",
                AnalysisError::Panicked => "Analysis crashed",
                AnalysisError::Malformed(_) => "Analysis returned an invalid result",
            },
            Self::Store(_) => "Trial could not be saved",
        }
    }
}

/// Session-fatal conditions
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Allocation failed: {0}")]
    Allocation(#[from] AllocationError),
    #[error("No allocation on record for participant {0}")]
    MissingAllocation(ParticipantId),
    #[error("{consecutive} consecutive capture failures, check the audio devices")]
    DeviceFault { consecutive: u32 },
    #[error("Session aborted by operator")]
    Aborted,
    #[error("Operator channel closed")]
    OperatorGone,
    #[error("Session state could not be stored: {0}")]
    Store(#[from] StoreError),
}

/// Presentation-side end of the controller's channels
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<OperatorCommand>,
    events: Receiver<SessionEvent>,
    abort: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn send(&self, command: OperatorCommand) {
        if command == OperatorCommand::Abort {
            self.abort.store(true, Ordering::SeqCst);
        }
        let _ = self.commands.send(command);
    }

    pub fn abort(&self) {
        self.send(OperatorCommand::Abort);
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }
}

pub struct ExperimentController<D: DuplexDevice> {
    store: OutputStore,
    allocator: Allocator,
    coordinator: CaptureCoordinator<D>,
    bridge: AnalysisBridge,
    config: SessionConfig,
    commands: Receiver<OperatorCommand>,
    events: Sender<SessionEvent>,
    abort: Arc<AtomicBool>,
}

/// Mutable bookkeeping of one run
struct RunState {
    session: SessionState,
    persisted: Vec<TrialId>,
    consecutive_capture_failures: u32,
}

impl<D: DuplexDevice> ExperimentController<D> {
    pub fn new(
        device: D,
        channels: ChannelMap,
        bridge: AnalysisBridge,
        store: OutputStore,
        allocator: Allocator,
        config: SessionConfig,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let abort = Arc::new(AtomicBool::new(false));

        let controller = Self {
            store,
            allocator,
            coordinator: CaptureCoordinator::new(device, channels, abort.clone()),
            bridge,
            config,
            commands: command_rx,
            events: event_tx,
            abort: abort.clone(),
        };
        let handle = SessionHandle { commands: command_tx, events: event_rx, abort };
        (controller, handle)
    }

    /// Allocate a new participant and run the full design
    pub fn run_session(&mut self, pid: &ParticipantId) -> Result<SessionReport, SessionError> {
        let allocation = self.allocator.allocate(pid)?;
        let steps: Vec<Step> = TrialSequencer::new(allocation).collect();
        let pending = count_recorded(&steps);

        info!(participant = %pid, condition = %allocation, trials = pending, "Starting session");
        let state = SessionState::new(pid.clone(), allocation);
        self.run(state, steps, false)
    }

    /// Replay only the trials missing from the output tree
    pub fn resume(&mut self, pid: &ParticipantId) -> Result<SessionReport, SessionError> {
        let allocation = match self.store.read_allocation(pid) {
            Ok(allocation) => allocation,
            Err(StoreError::MissingAllocation(_)) => return Err(SessionError::MissingAllocation(pid.clone())),
            Err(e) => return Err(e.into()),
        };
        let persisted = self.store.inventory(pid)?;
        let steps = resume_plan(allocation, &persisted);

        let mut state = self
            .store
            .read_session_state(pid)
            .unwrap_or_else(|e| {
                warn!(participant = %pid, "Ignoring unreadable session state: {}", e);
                None
            })
            .unwrap_or_else(|| SessionState::new(pid.clone(), allocation));
        state.reconcile(&persisted);

        info!(
            participant = %pid,
            persisted = persisted.len(),
            missing = count_recorded(&steps),
            "Resuming session"
        );
        self.run(state, steps, true)
    }

    fn run(&mut self, session: SessionState, steps: Vec<Step>, resumed: bool) -> Result<SessionReport, SessionError> {
        let mut run = RunState { session, persisted: Vec::new(), consecutive_capture_failures: 0 };
        self.emit(SessionEvent::SessionStarted {
            participant: run.session.participant_id.clone(),
            allocation: run.session.allocation,
            resumed,
            pending_trials: count_recorded(&steps),
        });

        let outcome = self.drive(&mut run, steps);

        match outcome {
            Ok(()) => {
                run.session.finished = true;
                self.flush(&run.session);
                let report = SessionReport {
                    participant: run.session.participant_id.clone(),
                    allocation: run.session.allocation,
                    persisted: run.persisted,
                    failed: run.session.failed_trials.clone(),
                };
                info!(
                    participant = %report.participant,
                    persisted = report.persisted.len(),
                    failed = report.failed.len(),
                    "Session finished"
                );
                self.emit(SessionEvent::SessionFinished(report.clone()));
                Ok(report)
            }
            Err(SessionError::Aborted) => {
                self.flush(&run.session);
                warn!(participant = %run.session.participant_id, "Session aborted");
                self.emit(SessionEvent::SessionAborted);
                Err(SessionError::Aborted)
            }
            Err(e) => {
                self.flush(&run.session);
                error!(participant = %run.session.participant_id, "Session failed: {}", e);
                self.emit(SessionEvent::SessionFailed(e.to_string()));
                Err(e)
            }
        }
    }

    fn drive(&mut self, run: &mut RunState, steps: Vec<Step>) -> Result<(), SessionError> {
        self.store.write_session_state(&run.session)?;
        if self.config.ear_check && count_recorded(&steps) > 0 {
            self.ear_check()?;
        }
        self.run_steps(run, steps)
    }

    fn run_steps(&mut self, run: &mut RunState, steps: Vec<Step>) -> Result<(), SessionError> {
        for step in steps {
            self.check_abort()?;
            match step {
                Step::EnterPhase(entry) => self.enter_phase(entry)?,
                Step::Pause(pause) => self.pause(pause)?,
                Step::Trial(trial) => match trial.trial_id() {
                    Some(id) => self.recorded_trial(run, trial, id)?,
                    None => self.practice_trial(run, trial)?,
                },
            }
        }
        Ok(())
    }

    fn enter_phase(&mut self, entry: PhaseEntry) -> Result<(), SessionError> {
        info!(
            stimulus = entry.slot.number(),
            rhythm = %entry.rhythm,
            ear = %entry.ear,
            phase = %entry.phase,
            "Entering phase"
        );
        self.emit(SessionEvent::PhaseStarted(entry));

        let prompt = match entry.phase {
            Phase::Practice => Some(Prompt::StartPractice(entry.slot)),
            Phase::TestBlock1 => Some(Prompt::StartTrials(entry.slot)),
            Phase::TestBlock2 => None,
        };
        match prompt {
            Some(prompt) if self.config.await_operator => self.await_acknowledge(prompt),
            _ => Ok(()),
        }
    }

    fn practice_trial(&mut self, run: &mut RunState, trial: TrialDescriptor) -> Result<(), SessionError> {
        if trial.index > 1 {
            self.interruptible_wait(self.config.practice_gap)?;
        }
        self.emit(SessionEvent::TrialStarted(trial));
        let schedule = StimulusSchedule::new(trial.rhythm, self.coordinator.sample_rate(), 0.0);

        match self.coordinator.present(&trial, &schedule) {
            Ok(()) => {
                run.consecutive_capture_failures = 0;
                self.emit(SessionEvent::TrialPresented(trial));
                Ok(())
            }
            Err(CaptureError::Aborted) => Err(SessionError::Aborted),
            Err(e) => {
                warn!(%trial, "Practice playback failed: {}", e);
                let reason = TrialError::from(e).operator_reason().to_string();
                self.emit(SessionEvent::TrialFailed { trial, kind: FailureKind::Capture, reason });
                self.count_capture_failure(run)
            }
        }
    }

    fn recorded_trial(&mut self, run: &mut RunState, trial: TrialDescriptor, id: TrialId) -> Result<(), SessionError> {
        run.session.begin_trial(&trial);
        let attempts = self.config.trial_attempts.max(1);

        for attempt in 1..=attempts {
            self.check_abort()?;
            self.emit(SessionEvent::TrialStarted(trial));

            match self.execute_trial(&run.session, &trial, id) {
                Ok(record) => {
                    run.consecutive_capture_failures = 0;
                    run.session.complete_trial(id);
                    run.persisted.push(id);
                    info!(
                        stimulus = id.stimulus,
                        trial = id.trial,
                        phase = %trial.phase,
                        quality_failed = record.quality.failed,
                        "Trial persisted"
                    );
                    self.emit(SessionEvent::TrialPersisted {
                        trial,
                        id,
                        metrics: record.metrics,
                        quality: record.quality,
                    });
                    self.flush(&run.session);
                    return Ok(());
                }
                Err(TrialError::Capture(CaptureError::Aborted)) => return Err(SessionError::Aborted),
                Err(e) => {
                    let kind = e.kind();
                    warn!(
                        stimulus = id.stimulus,
                        trial = id.trial,
                        phase = %trial.phase,
                        rhythm = %trial.rhythm,
                        ear = %trial.ear,
                        attempt,
                        kind = kind.as_str(),
                        "Trial failed: {}",
                        e
                    );

                    let last_attempt = attempt == attempts;
                    if kind == FailureKind::Capture {
                        run.consecutive_capture_failures += 1;
                    } else {
                        run.consecutive_capture_failures = 0;
                    }
                    let fatal = run.consecutive_capture_failures >= self.config.max_consecutive_capture_failures;

                    if last_attempt || fatal {
                        let reason = e.operator_reason();
                        run.session.fail_trial(id, kind, reason);
                        self.emit(SessionEvent::TrialFailed { trial, kind, reason: reason.to_string() });
                        self.flush(&run.session);
                    }
                    if fatal {
                        return Err(SessionError::DeviceFault { consecutive: run.consecutive_capture_failures });
                    }
                }
            }
        }
        Ok(())
    }

    /// Capture, analyze and persist one trial. Nothing of the trial is left
    /// on disk unless this returns `Ok`.
    fn execute_trial(
        &mut self,
        session: &SessionState,
        trial: &TrialDescriptor,
        id: TrialId,
    ) -> Result<TrialRecord, TrialError> {
        let pid = &session.participant_id;
        let schedule =
            StimulusSchedule::new(trial.rhythm, self.coordinator.sample_rate(), self.config.response_window_ms);

        let capture = self.coordinator.run_trial(trial, &schedule)?;
        if self.abort.load(Ordering::SeqCst) {
            return Err(CaptureError::Aborted.into());
        }

        let analysis = self.bridge.analyze(&capture, &schedule, &id.to_string())?;
        self.store.write_trial(pid, id, &capture, &analysis.record, &analysis.plot_png)?;

        let row = SummaryRow::new(pid, &session.allocation, trial, &analysis.record);
        if let Err(e) = self.store.append_summary_row(pid, &row) {
            if let Err(discard) = self.store.discard_trial(pid, id) {
                error!(trial = %id, "Could not discard trial after summary failure: {}", discard);
            }
            return Err(e.into());
        }
        Ok(analysis.record)
    }

    fn count_capture_failure(&self, run: &mut RunState) -> Result<(), SessionError> {
        run.consecutive_capture_failures += 1;
        if run.consecutive_capture_failures >= self.config.max_consecutive_capture_failures {
            return Err(SessionError::DeviceFault { consecutive: run.consecutive_capture_failures });
        }
        Ok(())
    }

    /// Right ear then left ear; a failed check can be retried or skipped
    fn ear_check(&mut self) -> Result<(), SessionError> {
        for ear in [Ear::Right, Ear::Left] {
            loop {
                self.check_abort()?;
                self.emit(SessionEvent::EarCheckStarted(ear));

                let passed = match self.coordinator.ear_check(ear) {
                    Ok(mic) => detect_tap(&mic, self.coordinator.sample_rate()),
                    Err(CaptureError::Aborted) => return Err(SessionError::Aborted),
                    Err(e) => {
                        warn!(%ear, "Ear check capture failed: {}", e);
                        false
                    }
                };

                if passed {
                    info!(%ear, "Ear check passed");
                    self.emit(SessionEvent::EarCheckPassed(ear));
                    break;
                }
                warn!(%ear, "No tap detected in ear check");
                self.emit(SessionEvent::EarCheckFailed(ear));
                if !self.config.await_operator {
                    break;
                }

                self.discard_stale_commands()?;
                self.emit(SessionEvent::AwaitingOperator(Prompt::EarCheckRetry(ear)));
                match self.next_command()? {
                    OperatorCommand::SkipCheck => break,
                    _ => continue,
                }
            }
        }
        Ok(())
    }

    fn pause(&mut self, pause: Pause) -> Result<(), SessionError> {
        info!(kind = ?pause.kind, seconds = pause.duration.as_secs(), "Pause");
        self.discard_stale_commands()?;
        self.emit(SessionEvent::PauseStarted { kind: pause.kind, duration: pause.duration });

        let started = Instant::now();
        let deadline = started + pause.duration;
        let cancelled = loop {
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            match self.commands.recv_timeout(deadline - now) {
                Ok(OperatorCommand::CancelPause) => break true,
                Ok(OperatorCommand::Abort) => return Err(SessionError::Aborted),
                Ok(other) => debug!(?other, "Command ignored during pause"),
                Err(RecvTimeoutError::Timeout) => break false,
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    break false;
                }
            }
        };

        let elapsed = started.elapsed();
        debug!(kind = ?pause.kind, elapsed_ms = elapsed.as_millis() as u64, cancelled, "Pause ended");
        self.emit(SessionEvent::PauseEnded { kind: pause.kind, elapsed, cancelled });
        Ok(())
    }

    /// Sleep that still honours an abort
    fn interruptible_wait(&self, duration: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            match self.commands.recv_timeout(deadline - now) {
                Ok(OperatorCommand::Abort) => return Err(SessionError::Aborted),
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return Ok(());
                }
            }
        }
    }

    fn await_acknowledge(&self, prompt: Prompt) -> Result<(), SessionError> {
        self.discard_stale_commands()?;
        self.emit(SessionEvent::AwaitingOperator(prompt));
        loop {
            match self.next_command()? {
                OperatorCommand::Acknowledge => return Ok(()),
                other => debug!(?other, ?prompt, "Command ignored while waiting"),
            }
        }
    }

    /// Drop commands typed before the current prompt or pause was shown;
    /// only an abort survives.
    fn discard_stale_commands(&self) -> Result<(), SessionError> {
        for command in self.commands.try_iter() {
            if command == OperatorCommand::Abort {
                return Err(SessionError::Aborted);
            }
            debug!(?command, "Discarding stale command");
        }
        Ok(())
    }

    fn next_command(&self) -> Result<OperatorCommand, SessionError> {
        match self.commands.recv() {
            Ok(OperatorCommand::Abort) => Err(SessionError::Aborted),
            Ok(command) => Ok(command),
            Err(_) => Err(SessionError::OperatorGone),
        }
    }

    fn check_abort(&self) -> Result<(), SessionError> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(SessionError::Aborted);
        }
        Ok(())
    }

    fn flush(&self, state: &SessionState) {
        if let Err(e) = self.store.write_session_state(state) {
            warn!(participant = %state.participant_id, "Session state not saved: {}", e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn count_recorded(steps: &[Step]) -> usize {
    steps
        .iter()
        .filter(|s| matches!(s, Step::Trial(t) if t.trial_id().is_some()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::FakeCollaborator;
    use crate::capture::tests::FakeDevice;
    use entrain_core::sequencer::{LONG_BREAK, SHORT_BREAK};
    use entrain_core::{Complexity, SequenceOrder};
    use std::fs;
    use std::thread;

    fn pid() -> ParticipantId {
        ParticipantId::new("000000001").unwrap()
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig { ear_check: false, await_operator: false, practice_gap: Duration::ZERO, ..SessionConfig::default() }
    }

    fn controller(
        root: &std::path::Path,
        device: FakeDevice,
        collaborator: FakeCollaborator,
        config: SessionConfig,
    ) -> (ExperimentController<FakeDevice>, SessionHandle) {
        let store = OutputStore::new(root);
        let allocator = Allocator::with_rng(store.clone(), fastrand::Rng::with_seed(1));
        ExperimentController::new(
            device,
            ChannelMap::default(),
            AnalysisBridge::new(Box::new(collaborator)),
            store,
            allocator,
            config,
        )
    }

    /// Acknowledges every prompt and cancels every pause once it is shown.
    /// Returns all events once the controller is dropped.
    fn operator(handle: &SessionHandle) -> thread::JoinHandle<Vec<SessionEvent>> {
        let handle = handle.clone();
        thread::spawn(move || {
            let mut seen = Vec::new();
            for event in handle.events().iter() {
                match &event {
                    SessionEvent::PauseStarted { .. } => handle.send(OperatorCommand::CancelPause),
                    SessionEvent::AwaitingOperator(_) => handle.send(OperatorCommand::Acknowledge),
                    _ => {}
                }
                seen.push(event);
            }
            seen
        })
    }

    fn finish(ctl: ExperimentController<FakeDevice>, operator: thread::JoinHandle<Vec<SessionEvent>>) -> Vec<SessionEvent> {
        drop(ctl);
        operator.join().unwrap()
    }

    fn drain(handle: &SessionHandle) -> Vec<SessionEvent> {
        handle.events().try_iter().collect()
    }

    fn summary_rows(root: &std::path::Path) -> Vec<String> {
        let text = fs::read_to_string(root.join("000000001/participant_analysis.csv")).unwrap();
        text.lines().skip(1).map(str::to_string).collect()
    }

    fn pause_ended(events: &[SessionEvent]) -> (Duration, bool) {
        events
            .iter()
            .find_map(|e| match e {
                SessionEvent::PauseEnded { elapsed, cancelled, .. } => Some((*elapsed, *cancelled)),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_full_session_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        finish(ctl, op);
        assert_eq!(report.persisted.len(), 24);
        assert!(report.failed.is_empty());

        let store = OutputStore::new(tmp.path());
        let inventory = store.inventory(&pid()).unwrap();
        assert_eq!(inventory.len(), 24);
        for stimulus in [1u8, 2] {
            let trials: Vec<u32> = inventory.iter().filter(|t| t.stimulus == stimulus).map(|t| t.trial).collect();
            assert_eq!(trials, (1..=12).collect::<Vec<_>>());
        }
        assert_eq!(summary_rows(tmp.path()).len(), 24);
        assert!(store.has_allocation(&pid()));

        // creation order within each stimulus is strictly increasing
        for stimulus in [1u8, 2] {
            let order: Vec<u32> = report.persisted.iter().filter(|t| t.stimulus == stimulus).map(|t| t.trial).collect();
            assert!(order.windows(2).all(|w| w[0] < w[1]));
        }

        let state = store.read_session_state(&pid()).unwrap().unwrap();
        assert!(state.finished);
        assert_eq!(state.completed_trials, 24);
    }

    #[test]
    fn test_pauses_are_placed_and_sized() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let op = operator(&handle);
        ctl.run_session(&pid()).unwrap();
        let events = finish(ctl, op);

        let durations: Vec<Duration> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::PauseStarted { duration, .. } => Some(*duration),
                _ => None,
            })
            .collect();
        assert_eq!(durations, vec![SHORT_BREAK, LONG_BREAK, SHORT_BREAK]);

        // nothing runs between a pause's start and end
        let mut in_pause = false;
        for event in &events {
            match event {
                SessionEvent::PauseStarted { .. } => in_pause = true,
                SessionEvent::PauseEnded { cancelled, .. } => {
                    assert!(*cancelled);
                    in_pause = false;
                }
                SessionEvent::TrialStarted(_) | SessionEvent::TrialPersisted { .. } => assert!(!in_pause),
                _ => {}
            }
        }
    }

    #[test]
    fn test_uncancelled_pause_runs_its_full_duration() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let duration = Duration::from_millis(100);

        ctl.pause(Pause { kind: PauseKind::BetweenBlocks, duration }).unwrap();
        let (elapsed, cancelled) = pause_ended(&drain(&handle));
        assert!(elapsed >= duration);
        assert!(!cancelled);
    }

    #[test]
    fn test_cancel_sent_before_pause_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let duration = Duration::from_millis(100);

        handle.send(OperatorCommand::CancelPause);
        ctl.pause(Pause { kind: PauseKind::BetweenSequences, duration }).unwrap();
        let (elapsed, cancelled) = pause_ended(&drain(&handle));
        assert!(elapsed >= duration);
        assert!(!cancelled);
    }

    #[test]
    fn test_abort_sent_before_pause_still_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());

        handle.send(OperatorCommand::Abort);
        let result = ctl.pause(Pause { kind: PauseKind::BetweenBlocks, duration: Duration::from_secs(5) });
        assert!(matches!(result, Err(SessionError::Aborted)));
    }

    #[test]
    fn test_acknowledge_sent_before_prompt_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let (ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let delay = Duration::from_millis(50);

        handle.send(OperatorCommand::Acknowledge);
        let late = {
            let handle = handle.clone();
            thread::spawn(move || {
                for event in handle.events().iter() {
                    if matches!(event, SessionEvent::AwaitingOperator(_)) {
                        thread::sleep(delay);
                        handle.send(OperatorCommand::Acknowledge);
                        return;
                    }
                }
            })
        };

        let started = Instant::now();
        ctl.await_acknowledge(Prompt::StartPractice(SequenceSlot::First)).unwrap();
        assert!(started.elapsed() >= delay);
        late.join().unwrap();
    }

    /// Practice only plays, so trial 5 of the first block is the 5th recording
    #[test]
    fn test_capture_failure_skips_only_that_trial() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new();
        device.fail_on.insert(5);
        let (mut ctl, handle) = controller(tmp.path(), device, FakeCollaborator::new(), quiet_config());
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        let events = finish(ctl, op);
        assert_eq!(report.persisted.len(), 23);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].trial, TrialId { stimulus: 1, trial: 5 });
        assert_eq!(report.failed[0].kind, FailureKind::Capture);

        let store = OutputStore::new(tmp.path());
        assert!(!store.trial_dir(&pid(), TrialId { stimulus: 1, trial: 5 }).exists());
        assert!(store.trial_dir(&pid(), TrialId { stimulus: 1, trial: 6 }).exists());

        let rows = summary_rows(tmp.path());
        assert_eq!(rows.len(), 23);
        let has_row = |stimulus: &str, trial: &str| {
            rows.iter().any(|r| {
                let cells: Vec<&str> = r.split(',').collect();
                cells[2] == stimulus && cells[6] == trial
            })
        };
        assert!(!has_row("1", "5"));
        assert!(has_row("1", "6"));

        let reasons: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::TrialFailed { kind: FailureKind::Capture, reason, .. } => Some(reason.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec!["Recording dropped audio"]);
    }

    #[test]
    fn test_three_consecutive_capture_failures_are_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new();
        device.fail_on.extend([2, 3, 4]);
        let (mut ctl, handle) = controller(tmp.path(), device, FakeCollaborator::new(), quiet_config());

        let err = ctl.run_session(&pid()).unwrap_err();
        assert!(matches!(err, SessionError::DeviceFault { consecutive: 3 }));
        assert_eq!(OutputStore::new(tmp.path()).inventory(&pid()).unwrap().len(), 1);
        assert!(drain(&handle).iter().any(|e| matches!(e, SessionEvent::SessionFailed(_))));
    }

    #[test]
    fn test_retry_recovers_a_transient_capture_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new();
        device.fail_on.insert(5);
        let calls = device.calls.clone();
        let config = SessionConfig { trial_attempts: 2, ..quiet_config() };
        let (mut ctl, handle) = controller(tmp.path(), device, FakeCollaborator::new(), config);
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        let events = finish(ctl, op);
        assert_eq!(report.persisted.len(), 24);
        assert!(report.failed.is_empty());
        assert_eq!(*calls.lock().unwrap(), 25);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::TrialFailed { .. })));

        let started = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::TrialStarted(t) if t.trial_id() == Some(TrialId { stimulus: 1, trial: 5 })))
            .count();
        assert_eq!(started, 2);
    }

    #[test]
    fn test_failed_retries_count_toward_device_fault() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new();
        // trial 5 fails both attempts, trial 6 fails its first
        device.fail_on.extend([5, 6, 7]);
        let config = SessionConfig { trial_attempts: 2, ..quiet_config() };
        let (mut ctl, _handle) = controller(tmp.path(), device, FakeCollaborator::new(), config);

        let err = ctl.run_session(&pid()).unwrap_err();
        assert!(matches!(err, SessionError::DeviceFault { consecutive: 3 }));

        let store = OutputStore::new(tmp.path());
        assert_eq!(store.inventory(&pid()).unwrap().len(), 4);
        let failed: Vec<TrialId> =
            store.read_session_state(&pid()).unwrap().unwrap().failed_trials.iter().map(|f| f.trial).collect();
        assert_eq!(failed, vec![TrialId { stimulus: 1, trial: 5 }, TrialId { stimulus: 1, trial: 6 }]);
    }

    #[test]
    fn test_collaborator_panic_fails_one_trial() {
        let tmp = tempfile::tempdir().unwrap();
        let collaborator = FakeCollaborator { panic_on_label: Some("stimulus_2/trial_3".into()), ..FakeCollaborator::new() };
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), collaborator, quiet_config());
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        finish(ctl, op);
        assert_eq!(report.persisted.len(), 23);
        assert_eq!(report.failed[0].kind, FailureKind::Analysis);
        assert!(!OutputStore::new(tmp.path()).trial_dir(&pid(), TrialId { stimulus: 2, trial: 3 }).exists());
    }

    #[test]
    fn test_collaborator_detail_stays_out_of_operator_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let collaborator = FakeCollaborator { reject_on_label: Some("stimulus_1/trial_2".into()), ..FakeCollaborator::new() };
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), collaborator, quiet_config());
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        let events = finish(ctl, op);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].reason, "Analysis rejected the recording");

        let reason = events
            .iter()
            .find_map(|e| match e {
                SessionEvent::TrialFailed { reason, .. } => Some(reason.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(reason, "Analysis rejected the recording");

        let state = fs::read_to_string(tmp.path().join("000000001/session.json")).unwrap();
        assert!(!state.contains("weights.bin"));
    }

    #[test]
    fn test_summary_failure_leaves_no_trial_behind() {
        let tmp = tempfile::tempdir().unwrap();
        // a directory where the summary file belongs makes every append fail
        fs::create_dir_all(tmp.path().join("000000001/participant_analysis.csv")).unwrap();
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        finish(ctl, op);
        assert!(report.persisted.is_empty());
        assert_eq!(report.failed.len(), 24);
        assert!(report.failed.iter().all(|f| f.kind == FailureKind::Store));

        let store = OutputStore::new(tmp.path());
        assert!(store.inventory(&pid()).unwrap().is_empty());
        let state = store.read_session_state(&pid()).unwrap().unwrap();
        assert_eq!(state.failed_trials.len(), 24);
        assert_eq!(state.completed_trials, 0);
    }

    #[test]
    fn test_second_session_for_same_participant_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = OutputStore::new(tmp.path());
        let alloc = Allocation::new(Complexity::Complex, Ear::Right, SequenceOrder::Two);
        store.write_allocation(&pid(), &alloc).unwrap();

        let (mut ctl, _handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        let err = ctl.run_session(&pid()).unwrap_err();
        assert!(matches!(err, SessionError::Allocation(AllocationError::Duplicate(_))));
        assert!(store.inventory(&pid()).unwrap().is_empty());
    }

    #[test]
    fn test_abort_mid_trial_leaves_no_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new();
        // the 3rd recording raises the abort flag while capturing
        device.abort_on = Some(3);
        let (mut ctl, handle) = controller(tmp.path(), device, FakeCollaborator::new(), quiet_config());

        let err = ctl.run_session(&pid()).unwrap_err();
        assert!(matches!(err, SessionError::Aborted));

        let store = OutputStore::new(tmp.path());
        let inventory = store.inventory(&pid()).unwrap();
        assert_eq!(inventory.len(), 2);
        assert!(!inventory.contains(&TrialId { stimulus: 1, trial: 3 }));
        assert_eq!(summary_rows(tmp.path()).len(), 2);

        let events = drain(&handle);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::SessionAborted)));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::TrialFailed { .. })));
    }

    #[test]
    fn test_resume_runs_only_missing_trials() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = FakeDevice::new();
        device.fail_on.insert(5);
        let (mut ctl, handle) = controller(tmp.path(), device, FakeCollaborator::new(), quiet_config());
        let op = operator(&handle);
        ctl.run_session(&pid()).unwrap();
        finish(ctl, op);

        let store = OutputStore::new(tmp.path());
        let missing = store.missing_trials(&pid()).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].trial_id(), Some(TrialId { stimulus: 1, trial: 5 }));
        assert_eq!(store.read_session_state(&pid()).unwrap().unwrap().failed_trials.len(), 1);

        let device = FakeDevice::new();
        let calls = device.calls.clone();
        let plays = device.plays.clone();
        let (mut ctl, _handle) = controller(tmp.path(), device, FakeCollaborator::new(), quiet_config());
        let report = ctl.resume(&pid()).unwrap();

        assert_eq!(report.persisted, vec![TrialId { stimulus: 1, trial: 5 }]);
        assert!(report.failed.is_empty());
        assert_eq!(*calls.lock().unwrap(), 1);
        // practice of the affected sequence is replayed
        assert_eq!(*plays.lock().unwrap(), 2);
        assert_eq!(store.inventory(&pid()).unwrap().len(), 24);
        assert_eq!(summary_rows(tmp.path()).len(), 24);

        let state = store.read_session_state(&pid()).unwrap().unwrap();
        assert_eq!(state.completed_trials, 24);
        assert!(state.finished);
        assert!(state.failed_trials.is_empty());
    }

    #[test]
    fn test_resume_without_allocation() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut ctl, _handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), quiet_config());
        assert!(matches!(ctl.resume(&pid()), Err(SessionError::MissingAllocation(_))));
    }

    #[test]
    fn test_operator_prompts_gate_phases() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SessionConfig { await_operator: true, ..quiet_config() };
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), config);
        let op = operator(&handle);

        let report = ctl.run_session(&pid()).unwrap();
        let events = finish(ctl, op);
        assert_eq!(report.persisted.len(), 24);

        // practice + test prompt per sequence, each ahead of its first trial
        let prompts: Vec<Prompt> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::AwaitingOperator(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(prompts.len(), 4);
        assert!(matches!(prompts[0], Prompt::StartPractice(SequenceSlot::First)));
        assert!(matches!(prompts[1], Prompt::StartTrials(SequenceSlot::First)));
    }

    #[test]
    fn test_ear_check_passes_with_taps() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SessionConfig { ear_check: true, ..quiet_config() };
        let (mut ctl, handle) = controller(tmp.path(), FakeDevice::new(), FakeCollaborator::new(), config);
        let op = operator(&handle);
        ctl.run_session(&pid()).unwrap();

        let passed: Vec<Ear> = finish(ctl, op)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::EarCheckPassed(ear) => Some(ear),
                _ => None,
            })
            .collect();
        assert_eq!(passed, vec![Ear::Right, Ear::Left]);
    }
}
