use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::models::lenient::opt_string;
use crate::models::{Direction, PositionDescriptor, TradeResult};

const POSITION_FILE: &str = "position_state.json";
const PENDING_FILE: &str = "pending_triggers.json";
const TRADE_LOG_FILE: &str = "trade_log.json";
pub const DANGER_FILE: &str = "DANGER_UNPROTECTED.json";

/// Exchange ids of resting entry triggers, one slot per direction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingTriggers {
    #[serde(default, alias = "long_algoId", deserialize_with = "opt_string")]
    pub long: Option<String>,
    #[serde(default, alias = "short_algoId", deserialize_with = "opt_string")]
    pub short: Option<String>,
}

impl PendingTriggers {
    pub fn get(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Long => self.long.as_deref(),
            Direction::Short => self.short.as_deref(),
        }
    }

    pub fn slot_mut(&mut self, direction: Direction) -> &mut Option<String> {
        match direction {
            Direction::Long => &mut self.long,
            Direction::Short => &mut self.short,
        }
    }

    /// Direction whose pending trigger has this id
    pub fn direction_of(&self, algo_id: &str) -> Option<Direction> {
        if self.long.as_deref() == Some(algo_id) {
            Some(Direction::Long)
        } else if self.short.as_deref() == Some(algo_id) {
            Some(Direction::Short)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.long.is_none() && self.short.is_none()
    }

    /// (direction, id) for every occupied slot
    pub fn entries(&self) -> Vec<(Direction, String)> {
        let mut out = Vec::new();
        if let Some(id) = &self.long {
            out.push((Direction::Long, id.clone()));
        }
        if let Some(id) = &self.short {
            out.push((Direction::Short, id.clone()));
        }
        out
    }
}

/// Durable "position may be unprotected" marker for supervisory tooling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DangerRecord {
    pub time: DateTime<Utc>,
    pub inst_id: String,
    pub direction: Direction,
    pub size: f64,
    pub reason: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionFile {
    #[serde(default)]
    position: Option<PositionDescriptor>,
}

/// Crash-safe JSON files under one state directory
///
/// Every write goes to a temp file in the same directory and is renamed over
/// the target. Readers treat a missing or unreadable file as empty state.
#[derive(Debug, Clone)]
pub struct PositionStore {
    dir: PathBuf,
}

impl PositionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_position(&self) -> Option<PositionDescriptor> {
        let path = self.dir.join(POSITION_FILE);
        let file: PositionFile = read_or_default(&path);
        if file.position.is_some() {
            return file.position;
        }
        // Older layout stored the descriptor at the top level
        read_json::<PositionDescriptor>(&path).ok().flatten()
    }

    pub fn save_position(&self, position: Option<&PositionDescriptor>) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct Out<'a> {
            position: Option<&'a PositionDescriptor>,
        }
        self.write_atomic(POSITION_FILE, &Out { position })
    }

    pub fn clear_position(&self) -> Result<(), StoreError> {
        self.save_position(None)
    }

    pub fn load_pending(&self) -> PendingTriggers {
        read_or_default(&self.dir.join(PENDING_FILE))
    }

    pub fn save_pending(&self, pending: &PendingTriggers) -> Result<(), StoreError> {
        self.write_atomic(PENDING_FILE, pending)
    }

    pub fn load_trades(&self) -> Vec<TradeResult> {
        read_or_default(&self.dir.join(TRADE_LOG_FILE))
    }

    /// Append a trade unless the same round trip is already logged
    ///
    /// Returns false when the trade was already present.
    /// A log that exists but cannot be parsed is moved aside, never overwritten.
    pub fn append_trade(&self, trade: &TradeResult) -> Result<bool, StoreError> {
        let path = self.dir.join(TRADE_LOG_FILE);
        let mut trades: Vec<TradeResult> = match read_json(&path) {
            Ok(Some(trades)) => trades,
            Ok(None) => Vec::new(),
            Err(StoreError::Json(e)) => {
                let aside = self.dir.join(format!(
                    "trade_log.corrupt-{}.json",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                fs::rename(&path, &aside)?;
                tracing::error!(
                    error = %e,
                    moved_to = %aside.display(),
                    "unparsable trade log moved aside, starting a new one"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        if trades.iter().any(|t| t.same_trade(trade)) {
            return Ok(false);
        }
        trades.push(trade.clone());
        self.write_atomic(TRADE_LOG_FILE, &trades)?;
        Ok(true)
    }

    pub fn write_danger(&self, record: &DangerRecord) -> Result<(), StoreError> {
        self.write_atomic(DANGER_FILE, record)
    }

    pub fn load_danger(&self) -> Option<DangerRecord> {
        read_json(&self.dir.join(DANGER_FILE)).ok().flatten()
    }

    fn write_atomic<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!(".{}.{}.tmp", name, std::process::id()));

        let json = serde_json::to_vec_pretty(value)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Ok(None) when the file does not exist
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable state file, using empty state");
            T::default()
        }
    }
}
