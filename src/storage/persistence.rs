use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::StorageError;
use crate::model::{ObservationMetadataRecord, ObservationRecord, ObservationSetRecord};

/// One logical change, as written to the write-ahead log. A committed
/// transaction is logged as a single batch of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalEntry {
    InsertObservationSet {
        set: ObservationSetRecord,
        observations: Vec<ObservationRecord>,
        metadata: Vec<ObservationMetadataRecord>,
    },
    UpsertObservationSet {
        set: ObservationSetRecord,
    },
    UpsertObservation {
        observation: ObservationRecord,
    },
    DeleteAll,
}

/// A committed transaction as it sits in the log. Sequence numbers keep
/// increasing across truncations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalBatch {
    pub sequence: u64,
    pub entries: Vec<WalEntry>,
}

/// Full copy of the observation tables, written by `flush_all`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last WAL sequence folded into this snapshot. Replay skips batches at
    /// or below it.
    #[serde(default)]
    pub wal_sequence: u64,
    pub observation_sets: Vec<ObservationSetRecord>,
    pub observations: Vec<ObservationRecord>,
    pub observation_metadata: Vec<ObservationMetadataRecord>,
}

/// Manages the snapshot file and write-ahead log under the data directory.
#[derive(Debug)]
pub struct PersistenceManager {
    base_path: PathBuf,
    wal: WriteAheadLog,
}

impl PersistenceManager {
    pub fn new(base_path: impl AsRef<Path>) -> io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let wal_dir = base_path.join("wal");
        let wal = WriteAheadLog::new(wal_dir)?;

        Ok(PersistenceManager { base_path, wal })
    }

    /// Write the snapshot via a temporary file and an atomic rename.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let path = self.snapshot_path();
        let serialized = serde_json::to_vec(snapshot)?;

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        info!(
            sets = snapshot.observation_sets.len(),
            observations = snapshot.observations.len(),
            wal_sequence = snapshot.wal_sequence,
            "snapshot written"
        );
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        let mut buffer = Vec::new();
        File::open(&path)?.read_to_end(&mut buffer)?;
        let snapshot = serde_json::from_slice(&buffer)?;
        Ok(Some(snapshot))
    }

    /// Append one committed batch, returning its sequence number.
    pub fn append_batch(&self, batch: &[WalEntry]) -> Result<u64, StorageError> {
        self.wal.append(batch)
    }

    /// Batches logged after `covered`, in commit order. Later appends are
    /// numbered after both `covered` and anything found in the log.
    pub fn replay_wal(&self, covered: u64) -> Result<Vec<WalBatch>, StorageError> {
        self.wal.replay(covered)
    }

    /// Sequence of the most recently appended batch.
    pub fn last_sequence(&self) -> Result<u64, StorageError> {
        self.wal.last_sequence()
    }

    /// Truncate the WAL once a snapshot covering it is on disk.
    pub fn truncate_wal(&self) -> Result<(), StorageError> {
        self.wal.truncate()
    }

    fn snapshot_path(&self) -> PathBuf {
        self.base_path.join("observations.snapshot")
    }
}

/// Append-only log of committed batches: a 4-byte big-endian length followed
/// by the JSON-encoded `WalBatch`.
#[derive(Debug)]
pub struct WriteAheadLog {
    log_path: PathBuf,
    state: Mutex<LogState>,
}

#[derive(Debug)]
struct LogState {
    file: File,
    last_sequence: u64,
}

impl WriteAheadLog {
    pub fn new(wal_dir: impl AsRef<Path>) -> io::Result<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        fs::create_dir_all(&wal_dir)?;

        let log_path = wal_dir.join("observations.wal");
        let log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        Ok(WriteAheadLog {
            log_path,
            state: Mutex::new(LogState {
                file: log_file,
                last_sequence: 0,
            }),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogState>, StorageError> {
        self.state.lock().map_err(|_| StorageError::LockPoisoned)
    }

    pub fn append(&self, entries: &[WalEntry]) -> Result<u64, StorageError> {
        let mut state = self.lock()?;
        let sequence = state.last_sequence + 1;
        let serialized = serde_json::to_vec(&WalBatch {
            sequence,
            entries: entries.to_vec(),
        })?;
        let size = u32::try_from(serialized.len())
            .map_err(|_| StorageError::Persistence("WAL batch exceeds 4 GiB".to_string()))?;

        state.file.write_all(&size.to_be_bytes())?;
        state.file.write_all(&serialized)?;
        state.file.sync_data()?;
        state.last_sequence = sequence;

        debug!(sequence, entries = entries.len(), bytes = serialized.len(), "WAL batch appended");
        Ok(sequence)
    }

    pub fn last_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.lock()?.last_sequence)
    }

    pub fn replay(&self, covered: u64) -> Result<Vec<WalBatch>, StorageError> {
        let mut state = self.lock()?;
        state.file.seek(SeekFrom::Start(0))?;

        let mut batches = Vec::new();
        let mut skipped = 0usize;
        let mut last_sequence = covered;
        loop {
            let mut size_buf = [0u8; 4];
            match state.file.read_exact(&mut size_buf) {
                Ok(()) => {
                    let size = u32::from_be_bytes(size_buf) as usize;
                    let mut data = vec![0u8; size];
                    match state.file.read_exact(&mut data) {
                        Ok(()) => {
                            let batch: WalBatch = serde_json::from_slice(&data)?;
                            last_sequence = last_sequence.max(batch.sequence);
                            if batch.sequence <= covered {
                                skipped += 1;
                            } else {
                                batches.push(batch);
                            }
                        }
                        // A torn final write never committed.
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        if skipped > 0 {
            info!(skipped, covered, "WAL batches already in snapshot");
        }
        state.last_sequence = last_sequence;
        Ok(batches)
    }

    pub fn truncate(&self) -> Result<(), StorageError> {
        let new_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        drop(new_file);

        // Reopen in append mode so later writes land at the end.
        let reopened = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.log_path)?;
        self.lock()?.file = reopened;
        Ok(())
    }
}
