//! Condition allocator: balanced random assignment, persisted before use

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use entrain_core::{Allocation, BalanceLedger, ParticipantId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{OutputStore, StoreError};

pub const LEDGER_FILE: &str = "allocation_ledger.json";
pub const LEDGER_LOCK_FILE: &str = "allocation_ledger.lock";

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
/// An allocation holds the lock for milliseconds; a lock this old was left by a crash
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// One allocation in flight per process; the lock file extends this across processes
static LEDGER_GUARD: Mutex<()> = Mutex::new(());

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Participant {0} already has an allocation")]
    Duplicate(ParticipantId),
    #[error("Allocation ledger is locked by another session")]
    LedgerBusy,
    #[error("Allocation ledger is unreadable: {0}")]
    Ledger(String),
    #[error("Allocation could not be persisted: {0}")]
    Persistence(#[from] StoreError),
}

/// Removes the lock file when dropped
struct LedgerLock {
    path: PathBuf,
}

impl LedgerLock {
    fn acquire(path: PathBuf) -> Result<Self, AllocationError> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_age(&path).is_some_and(|age| age > LOCK_STALE_AFTER) {
                        warn!(lock = %path.display(), "Breaking abandoned ledger lock");
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(AllocationError::Ledger(format!("{}: {e}", path.display()))),
                        }
                    }
                    if Instant::now() > deadline {
                        return Err(AllocationError::LedgerBusy);
                    }
                    thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(AllocationError::Ledger(format!("{}: {e}", path.display()))),
            }
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

pub struct Allocator {
    store: OutputStore,
    rng: fastrand::Rng,
}

impl Allocator {
    pub fn new(store: OutputStore) -> Self {
        Self { store, rng: fastrand::Rng::new() }
    }

    pub fn with_rng(store: OutputStore, rng: fastrand::Rng) -> Self {
        Self { store, rng }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.store.root().join(LEDGER_FILE)
    }

    /// Assign `pid` to a condition cell and persist it.
    ///
    /// The allocation record is on disk before this returns; if the ledger
    /// update fails the record is removed again and the call fails.
    pub fn allocate(&mut self, pid: &ParticipantId) -> Result<Allocation, AllocationError> {
        let _guard = LEDGER_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let root = self.store.root().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| AllocationError::Persistence(StoreError::Io { path: root.clone(), source: e }))?;
        let _lock = LedgerLock::acquire(root.join(LEDGER_LOCK_FILE))?;

        if self.store.has_allocation(pid) {
            return Err(AllocationError::Duplicate(pid.clone()));
        }

        let ledger_path = self.ledger_path();
        let mut ledger = load_ledger(&ledger_path)?;
        let allocation = ledger.draw(&mut self.rng);
        debug!(participant = %pid, candidates = ledger.least_filled().len(), "Drew allocation cell");

        match self.store.write_allocation(pid, &allocation) {
            Ok(()) => {}
            Err(StoreError::AllocationExists(_)) => return Err(AllocationError::Duplicate(pid.clone())),
            Err(e) => return Err(e.into()),
        }

        ledger.record(&allocation);
        if let Err(e) = save_ledger(&ledger_path, &ledger) {
            if let Err(rm) = self.store.remove_allocation(pid) {
                warn!(participant = %pid, "Failed to roll back allocation: {}", rm);
            }
            return Err(e);
        }

        info!(
            participant = %pid,
            condition = %allocation,
            total = ledger.total(),
            spread = ledger.spread(),
            "Participant allocated"
        );
        Ok(allocation)
    }
}

fn load_ledger(path: &Path) -> Result<BalanceLedger, AllocationError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AllocationError::Ledger(e.to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BalanceLedger::new()),
        Err(e) => Err(AllocationError::Ledger(e.to_string())),
    }
}

fn save_ledger(path: &Path, ledger: &BalanceLedger) -> Result<(), AllocationError> {
    let tmp = path.with_extension("json.tmp");
    let persist = |source: io::Error| AllocationError::Persistence(StoreError::Io { path: path.to_path_buf(), source });

    let json = serde_json::to_vec_pretty(ledger).map_err(StoreError::from)?;
    let mut file = fs::File::create(&tmp).map_err(persist)?;
    file.write_all(&json).and_then(|_| file.sync_all()).map_err(persist)?;
    fs::rename(&tmp, path).map_err(persist)
}
