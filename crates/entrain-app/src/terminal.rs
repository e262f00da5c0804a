//! Terminal presentation layer: renders session events, forwards operator keys

use std::io::{self, BufRead, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use entrain_core::{ParticipantId, Phase};
use entrain_services::{OperatorCommand, Prompt, SessionEvent, SessionHandle};

pub const KEY_HELP: &str = "[Enter] continue  [c] cancel pause  [r] retry check  [s] skip check  [q] abort";

pub fn parse_command(line: &str) -> Option<OperatorCommand> {
    match line.trim().to_lowercase().as_str() {
        "" | "y" | "ok" => Some(OperatorCommand::Acknowledge),
        "c" | "cancel" => Some(OperatorCommand::CancelPause),
        "r" | "retry" => Some(OperatorCommand::RetryCheck),
        "s" | "skip" => Some(OperatorCommand::SkipCheck),
        "q" | "quit" | "abort" => Some(OperatorCommand::Abort),
        _ => None,
    }
}

/// Ask until a valid participant ID is entered; `None` on end of input
pub fn prompt_participant_id() -> io::Result<Option<ParticipantId>> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("Participant ID: ");
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        match ParticipantId::new(&line) {
            Ok(pid) => return Ok(Some(pid)),
            Err(e) => println!("{e}"),
        }
    }
}

/// Forward operator lines to the controller until stdin closes
pub fn spawn_command_reader(handle: SessionHandle) -> JoinHandle<()> {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_command(&line) {
                Some(command) => handle.send(command),
                None => println!("{KEY_HELP}"),
            }
        }
    })
}

/// Print events until the controller drops its sender
pub fn spawn_event_printer(events: Receiver<SessionEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in events.iter() {
            if let Some(text) = describe(&event) {
                println!("{text}");
            }
        }
    })
}

pub fn describe(event: &SessionEvent) -> Option<String> {
    let text = match event {
        SessionEvent::SessionStarted { participant, allocation, resumed, pending_trials } => {
            let verb = if *resumed { "Resuming" } else { "Starting" };
            format!("{verb} session for {participant} ({allocation}), {pending_trials} trials to run")
        }
        SessionEvent::EarCheckStarted(ear) => format!("Ear check, {ear} ear: tap once after the tone"),
        SessionEvent::EarCheckPassed(ear) => format!("Tap detected for the {ear} ear"),
        SessionEvent::EarCheckFailed(ear) => format!("No tap detected for the {ear} ear"),
        SessionEvent::AwaitingOperator(prompt) => match prompt {
            Prompt::StartPractice(slot) => {
                format!("Stimulus {}: listen to the rhythm twice. Press Enter to start.", slot.number())
            }
            Prompt::StartTrials(slot) => {
                format!("Stimulus {}: tap along with the rhythm. Press Enter to start.", slot.number())
            }
            Prompt::EarCheckRetry(ear) => format!("[r] retry the {ear} ear check, [s] skip it"),
        },
        SessionEvent::PhaseStarted(entry) => match entry.phase {
            Phase::Practice => format!("Stimulus {} ({}, {} ear): practice", entry.slot.number(), entry.rhythm, entry.ear),
            phase => format!("Stimulus {}: {phase}", entry.slot.number()),
        },
        SessionEvent::TrialStarted(_) | SessionEvent::TrialPresented(_) => return None,
        SessionEvent::TrialPersisted { id, metrics, quality, .. } => {
            let mean = metrics.mean_asynchrony_ms.map(|m| format!("{m:.1} ms")).unwrap_or_else(|| "-".into());
            let flag = if quality.failed { format!("  (check: {})", quality.reason) } else { String::new() };
            format!(
                "{id}: {}/{} taps aligned, mean asynchrony {mean}{flag}",
                metrics.aligned_responses, metrics.total_stimuli
            )
        }
        SessionEvent::TrialFailed { trial, kind, reason } => format!("{trial} FAILED ({}): {reason}", kind.as_str()),
        SessionEvent::PauseStarted { duration, .. } => {
            format!("Break: {} s. Press [c] to continue early.", duration.as_secs())
        }
        SessionEvent::PauseEnded { cancelled, .. } => {
            if *cancelled { "Break ended early".into() } else { "Break over".into() }
        }
        SessionEvent::SessionFinished(report) => format!(
            "Session complete: {} trials saved, {} failed",
            report.persisted.len(),
            report.failed.len()
        ),
        SessionEvent::SessionAborted => "Session aborted".into(),
        SessionEvent::SessionFailed(reason) => format!("Session stopped: {reason}"),
    };
    Some(text)
}
