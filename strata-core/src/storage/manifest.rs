//! Persistent record of which SSTables make up the tree

use super::sync_dir;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";

/// Table layout plus the counters needed to resume after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    pub next_sst_id: usize,
    pub max_sequence: u64,
    pub l0_sstables: Vec<usize>,
    pub levels: Vec<Vec<usize>>,
}

/// JSON manifest replaced atomically on every structural change
pub struct Manifest {
    dir: PathBuf,
}

impl Manifest {
    /// Open the manifest in `dir`, returning the last written snapshot if any
    pub fn open(dir: &Path) -> Result<(Self, Option<ManifestSnapshot>)> {
        let manifest = Self {
            dir: dir.to_path_buf(),
        };
        let path = manifest.path();
        if !path.exists() {
            return Ok((manifest, None));
        }
        let data = fs::read(&path)?;
        let snapshot = serde_json::from_slice(&data)?;
        Ok((manifest, Some(snapshot)))
    }

    /// Persist `snapshot`: write a temp file, fsync, rename over the old one
    pub fn write(&self, snapshot: &ManifestSnapshot) -> Result<()> {
        let tmp = self.dir.join(MANIFEST_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(snapshot)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.path())?;
        sync_dir(&self.dir)?;
        debug!(
            "Manifest written: {} L0 tables, {} levels",
            snapshot.l0_sstables.len(),
            snapshot.levels.len()
        );
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }
}
