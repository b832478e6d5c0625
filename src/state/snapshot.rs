//! Snapshot files: `snapshot-<timestamp>-<seq>.json`, newest wins.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::model::{ComponentState, Projection, StateMetrics};
use crate::error::{CoreError, CoreResult};
use crate::logging::log_persistence_error;

const PREFIX: &str = "snapshot-";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: i64,
    pub global_state: BTreeMap<String, Projection>,
    pub component_states: BTreeMap<String, ComponentState>,
    pub metrics: StateMetrics,
    /// Hex SHA-256 over the other four fields.
    #[serde(default)]
    pub checksum: String,
}

impl Snapshot {
    pub fn new(
        timestamp: i64,
        global_state: BTreeMap<String, Projection>,
        component_states: BTreeMap<String, ComponentState>,
        metrics: StateMetrics,
    ) -> Self {
        let mut snapshot = Self {
            timestamp,
            global_state,
            component_states,
            metrics,
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.digest();
        snapshot
    }

    pub fn digest(&self) -> String {
        let body = serde_json::to_vec(&(&self.timestamp, &self.global_state, &self.component_states, &self.metrics))
            .unwrap_or_default();
        hex::encode(Sha256::digest(&body))
    }

    pub fn verify(&self) -> bool {
        !self.checksum.is_empty() && self.checksum == self.digest()
    }
}

pub fn file_name(timestamp: i64, seq: u64) -> String {
    format!("{}{}-{:06}{}", PREFIX, timestamp, seq, SUFFIX)
}

fn parse_name(name: &str) -> Option<(i64, u64)> {
    let stem = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (ts, seq) = stem.rsplit_once('-')?;
    Some((ts.parse().ok()?, seq.parse().ok()?))
}

/// Write to a temp file in the same directory, then rename into place.
/// Returns the final path and the byte count.
pub fn write_atomic(dir: &Path, snapshot: &Snapshot, seq: u64) -> CoreResult<(PathBuf, usize)> {
    fs::create_dir_all(dir)?;
    let bytes = serde_json::to_vec(snapshot).map_err(|e| CoreError::Persistence(e.to_string()))?;
    let name = file_name(snapshot.timestamp, seq);
    let tmp = dir.join(format!(".{}.tmp", name));
    let target = dir.join(&name);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok((target, bytes.len()))
}

/// Snapshot files in `dir`, newest first. A missing directory is empty.
pub fn list(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut found: Vec<((i64, u64), PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            parse_name(&name).map(|key| (key, entry.path()))
        })
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Delete all but the `keep` newest snapshots. Returns how many were removed.
pub fn prune(dir: &Path, keep: usize) -> CoreResult<usize> {
    let mut removed = 0;
    for path in list(dir)?.into_iter().skip(keep.max(1)) {
        fs::remove_file(&path)?;
        removed += 1;
    }
    Ok(removed)
}

pub fn read(path: &Path) -> CoreResult<Snapshot> {
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| CoreError::Persistence(e.to_string()))?;
    if !snapshot.verify() {
        return Err(CoreError::Persistence(format!("checksum mismatch in {}", path.display())));
    }
    Ok(snapshot)
}

/// Newest snapshot that parses and passes its checksum. Broken files are
/// logged and skipped.
pub fn load_newest(dir: &Path) -> CoreResult<Option<(PathBuf, Snapshot)>> {
    for path in list(dir)? {
        match read(&path) {
            Ok(snapshot) => return Ok(Some((path, snapshot))),
            Err(e) => log_persistence_error("snapshot_read", &format!("{}: {}", path.display(), e)),
        }
    }
    Ok(None)
}
