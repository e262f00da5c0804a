//! Output store: `output/<participant_id>/...`
//!
//! Trial artifacts are written into a staging directory and renamed into
//! place once all three are on disk, so a trial directory either holds the
//! full set or does not exist.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use entrain_core::{Allocation, EntrainError, ParticipantId, SessionState, SummaryRow, TrialDescriptor, TrialId, TrialRecord};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::RawCapture;

pub const ALLOCATION_FILE: &str = "allocation.txt";
pub const SUMMARY_FILE: &str = "participant_analysis.csv";
pub const SESSION_FILE: &str = "session.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("WAV encoding failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Allocation already recorded for participant {0}")]
    AllocationExists(ParticipantId),
    #[error("No allocation recorded for participant {0}")]
    MissingAllocation(ParticipantId),
    #[error("Unreadable allocation record: {0}")]
    InvalidAllocation(#[from] EntrainError),
    #[error("Trial {0} is already persisted")]
    TrialExists(TrialId),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn participant_dir(&self, pid: &ParticipantId) -> PathBuf {
        self.root.join(pid.as_str())
    }

    pub fn allocation_path(&self, pid: &ParticipantId) -> PathBuf {
        self.participant_dir(pid).join(ALLOCATION_FILE)
    }

    pub fn summary_path(&self, pid: &ParticipantId) -> PathBuf {
        self.participant_dir(pid).join(SUMMARY_FILE)
    }

    pub fn session_path(&self, pid: &ParticipantId) -> PathBuf {
        self.participant_dir(pid).join(SESSION_FILE)
    }

    pub fn trial_dir(&self, pid: &ParticipantId, id: TrialId) -> PathBuf {
        self.stimulus_dir(pid, id.stimulus).join(format!("trial_{}", id.trial))
    }

    fn stimulus_dir(&self, pid: &ParticipantId, stimulus: u8) -> PathBuf {
        self.participant_dir(pid).join(format!("stimulus_{stimulus}"))
    }

    pub fn has_allocation(&self, pid: &ParticipantId) -> bool {
        self.allocation_path(pid).is_file()
    }

    /// Create `allocation.txt`; an existing record is never replaced
    pub fn write_allocation(&self, pid: &ParticipantId, allocation: &Allocation) -> Result<(), StoreError> {
        let dir = self.participant_dir(pid);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = self.allocation_path(pid);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AllocationExists(pid.clone()));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };

        let written = file
            .write_all(allocation.to_record(pid).as_bytes())
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&path);
            return Err(io_err(&path)(e));
        }
        info!(participant = %pid, condition = %allocation.condition_label(), "Allocation written");
        Ok(())
    }

    /// Remove an allocation record whose ledger update failed
    pub fn remove_allocation(&self, pid: &ParticipantId) -> Result<(), StoreError> {
        let path = self.allocation_path(pid);
        fs::remove_file(&path).map_err(io_err(&path))
    }

    pub fn read_allocation(&self, pid: &ParticipantId) -> Result<Allocation, StoreError> {
        let path = self.allocation_path(pid);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::MissingAllocation(pid.clone()));
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        let (recorded, allocation) = Allocation::parse_record(&text)?;
        if &recorded != pid {
            return Err(EntrainError::InvalidAllocation(format!("record belongs to participant {recorded}")).into());
        }
        Ok(allocation)
    }

    /// Persist the three artifacts of one trial as a unit.
    ///
    /// A trial that already has a directory is rejected untouched.
    pub fn write_trial(
        &self,
        pid: &ParticipantId,
        id: TrialId,
        capture: &RawCapture,
        record: &TrialRecord,
        plot_png: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let final_dir = self.trial_dir(pid, id);
        if final_dir.exists() {
            return Err(StoreError::TrialExists(id));
        }

        let stimulus_dir = self.stimulus_dir(pid, id.stimulus);
        fs::create_dir_all(&stimulus_dir).map_err(io_err(&stimulus_dir))?;

        let staging = stimulus_dir.join(format!(".trial_{}.staging", id.trial));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(io_err(&staging))?;
        }
        fs::create_dir(&staging).map_err(io_err(&staging))?;

        if let Err(e) = write_artifacts(&staging, id, capture, record, plot_png) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staging, &final_dir) {
            let _ = fs::remove_dir_all(&staging);
            return Err(io_err(&final_dir)(e));
        }
        debug!(participant = %pid, trial = %id, "Trial artifacts written");
        Ok(final_dir)
    }

    /// Take a trial directory whose summary row could not be recorded out
    /// of the inventory.
    ///
    /// The directory is first renamed to a dotted name, which `inventory`
    /// never counts, then deleted. A failed delete only leaves the dotted
    /// directory behind.
    pub fn discard_trial(&self, pid: &ParticipantId, id: TrialId) -> Result<(), StoreError> {
        let dir = self.trial_dir(pid, id);
        if !dir.exists() {
            return Ok(());
        }
        let discarded = self.stimulus_dir(pid, id.stimulus).join(format!(".trial_{}.discarded", id.trial));
        if discarded.exists() {
            fs::remove_dir_all(&discarded).map_err(io_err(&discarded))?;
        }

        let doomed = match fs::rename(&dir, &discarded) {
            Ok(()) => discarded,
            Err(e) => {
                warn!(participant = %pid, trial = %id, "Could not move trial aside: {}", e);
                dir
            }
        };
        fs::remove_dir_all(&doomed).map_err(io_err(&doomed))?;
        warn!(participant = %pid, trial = %id, "Trial artifacts discarded");
        Ok(())
    }

    /// Append one row, writing the header first if the file is new or empty.
    ///
    /// A half-written line left by an earlier failure is cut off first, and
    /// a write that fails now is truncated back to where it started.
    pub fn append_summary_row(&self, pid: &ParticipantId, row: &SummaryRow) -> Result<(), StoreError> {
        let dir = self.participant_dir(pid);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = self.summary_path(pid);
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;

        let (complete, total) = complete_lines_len(&mut file).map_err(io_err(&path))?;
        if complete < total {
            warn!(participant = %pid, bytes = total - complete, "Dropping partial summary line");
            file.set_len(complete).map_err(io_err(&path))?;
        }

        let mut text = String::new();
        if complete == 0 {
            text.push_str(&SummaryRow::header_line());
        }
        text.push_str(&row.to_csv_line());

        if let Err(e) = file.write_all(text.as_bytes()).and_then(|_| file.sync_all()) {
            if let Err(undo) = file.set_len(complete) {
                warn!(participant = %pid, "Summary rollback failed: {}", undo);
            }
            return Err(io_err(&path)(e));
        }
        Ok(())
    }

    /// Rewrite `session.json` via a temp file and rename
    pub fn write_session_state(&self, state: &SessionState) -> Result<(), StoreError> {
        let dir = self.participant_dir(&state.participant_id);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = self.session_path(&state.participant_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;
        write_synced(&tmp, &json)?;
        fs::rename(&tmp, &path).map_err(io_err(&path))
    }

    pub fn read_session_state(&self, pid: &ParticipantId) -> Result<Option<SessionState>, StoreError> {
        let path = self.session_path(pid);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Persisted trials, judged from directory contents alone
    pub fn inventory(&self, pid: &ParticipantId) -> Result<BTreeSet<TrialId>, StoreError> {
        let mut found = BTreeSet::new();
        let dir = self.participant_dir(pid);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(stimulus) = name.to_str().and_then(|n| n.strip_prefix("stimulus_")).and_then(|n| n.parse::<u8>().ok())
            else {
                continue;
            };
            let Ok(trials) = fs::read_dir(entry.path()) else { continue };
            for trial in trials.flatten() {
                let name = trial.file_name();
                let Some(number) = name.to_str().and_then(|n| n.strip_prefix("trial_")).and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                let id = TrialId { stimulus, trial: number };
                if artifact_names(id).iter().all(|f| trial.path().join(f).is_file()) {
                    found.insert(id);
                }
            }
        }
        Ok(found)
    }

    /// Design trials of `pid` that have no persisted directory
    pub fn missing_trials(&self, pid: &ParticipantId) -> Result<Vec<TrialDescriptor>, StoreError> {
        let allocation = self.read_allocation(pid)?;
        let persisted = self.inventory(pid)?;
        Ok(entrain_core::missing_trials(allocation, &persisted))
    }
}

pub fn artifact_names(id: TrialId) -> [String; 3] {
    [
        format!("recording_trial_{}.wav", id.trial),
        format!("numerical_data_trial_{}.json", id.trial),
        format!("plot_trial_{}.png", id.trial),
    ]
}

fn write_artifacts(
    dir: &Path,
    id: TrialId,
    capture: &RawCapture,
    record: &TrialRecord,
    plot_png: &[u8],
) -> Result<(), StoreError> {
    let [wav_name, json_name, png_name] = artifact_names(id);

    write_wav(&dir.join(wav_name), &capture.combined(), capture.sample_rate)?;
    write_synced(&dir.join(json_name), &serde_json::to_vec_pretty(record)?)?;
    write_synced(&dir.join(png_name), plot_png)
}

/// 16-bit mono PCM
fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), StoreError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = hound::WavWriter::new(BufWriter::new(file), spec)?;
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;

    File::open(path).and_then(|f| f.sync_all()).map_err(io_err(path))
}

/// Length up to and including the last newline, and the full length
fn complete_lines_len(file: &mut File) -> io::Result<(u64, u64)> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    Ok((complete as u64, bytes.len() as u64))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(path).map_err(io_err(path))?;
    file.write_all(bytes).and_then(|_| file.sync_all()).map_err(io_err(path))
}
