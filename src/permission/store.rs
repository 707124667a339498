//! Permission Store: persists per-tool decisions with TTL and scope at
//! `<workspace>/.floyd/permissions.json` (spec §4.4/§6). Writes are
//! atomic (write-to-temp + rename); reads tolerate missing or corrupt
//! files by returning an empty rule set rather than crashing, following
//! the teacher's "no config-parsing crate, raw `serde_json`" philosophy
//! (`config.rs`).

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::AgentError;
use crate::model::PermissionsFile;

pub struct PermissionStore {
    path: PathBuf,
}

impl PermissionStore {
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            path: workspace.as_ref().join(".floyd").join("permissions.json"),
        }
    }

    pub async fn load(&self) -> PermissionsFile {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("permissions file at {:?} is corrupt ({e}); treating as empty", self.path);
                PermissionsFile::default()
            }),
            Err(_) => PermissionsFile::default(),
        }
    }

    /// Atomic write: write to a sibling temp file, then rename over the
    /// target so a crash mid-write never leaves a half-written file.
    pub async fn save(&self, file: &PermissionsFile) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
