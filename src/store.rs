//! Filesystem layout for map scripts.
//!
//! `<base>/temp/<map>.lua` is the staging slot a download writes into and
//! `<base>/scripts/<map>.lua` is the live slot contexts are built from. A
//! staging file only exists while a [`StagingFile`] owns it: it is created
//! with `create_new` and deleted when the owner is dropped without being
//! promoted, so an existing file always means a download is in flight.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::config::PluginConfig;
use crate::error::{StoreError, StoreResult};
use crate::host::{map_id, Host};

pub struct ScriptStore {
    temp_dir: PathBuf,
    scripts_dir: PathBuf,
}

/// Exclusive handle on a map's staging file, held by the download that created it.
///
/// Dropping it without [`ScriptStore::complete_download`] deletes the file and
/// frees the slot, including when the download task is cancelled.
#[derive(Debug)]
pub struct StagingFile {
    pub map_id: String,
    pub path: PathBuf,
    file: Option<File>,
    promoted: bool,
}

impl StagingFile {
    /// The open write handle. `None` once taken.
    pub fn take_file(&mut self) -> Option<File> {
        self.file.take()
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        self.file.take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("[Lua store] Released staging slot for '{}'", self.map_id),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[Lua store] Could not remove {}: {e}", self.path.display()),
        }
    }
}

impl ScriptStore {
    /// Creates the directory layout and removes staging files a previous
    /// process left behind.
    pub fn open(config: &PluginConfig) -> io::Result<Self> {
        let store = Self {
            temp_dir: config.temp_path(),
            scripts_dir: config.scripts_path(),
        };
        std::fs::create_dir_all(&store.temp_dir)?;
        std::fs::create_dir_all(&store.scripts_dir)?;

        let mut cleared = 0usize;
        for entry in std::fs::read_dir(&store.temp_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("lua") {
                match std::fs::remove_file(&path) {
                    Ok(()) => cleared += 1,
                    Err(e) => warn!("[Lua store] Could not clear {}: {e}", path.display()),
                }
            }
        }
        if cleared > 0 {
            info!("[Lua store] Cleared {cleared} stale staging file(s)");
        }
        Ok(store)
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// File name used for `map` in both slots.
    pub fn file_name(&self, map: &str) -> String {
        script_file_name(map)
    }

    pub fn staging_path(&self, map: &str) -> PathBuf {
        self.temp_dir.join(script_file_name(map))
    }

    pub fn live_path(&self, map: &str) -> PathBuf {
        self.scripts_dir.join(script_file_name(map))
    }

    /// Claims the staging slot for `map`. Fails with `AlreadyInProgress` when
    /// another download owns it.
    pub fn begin_download(&self, map: &str) -> StoreResult<StagingFile> {
        let path = self.staging_path(map);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StoreError::AlreadyInProgress,
                _ => StoreError::Io(e),
            })?;
        Ok(StagingFile {
            map_id: map_id(map),
            path,
            file: Some(file),
            promoted: false,
        })
    }

    pub fn is_downloading(&self, map: &str) -> bool {
        self.staging_path(map).exists()
    }

    /// Deletes the staging file by path. Missing files are not an error.
    /// Dropping the owning [`StagingFile`] does the same.
    pub fn abort_download(&self, map: &str) -> io::Result<()> {
        match std::fs::remove_file(self.staging_path(map)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Promotes staging to live, replacing any existing live script. On
    /// failure the staging file is deleted with `staging`.
    pub fn complete_download(&self, mut staging: StagingFile) -> io::Result<PathBuf> {
        staging.file.take();
        let live = self.live_path(&staging.map_id);
        if live.exists() {
            std::fs::remove_file(&live)?;
        }
        std::fs::rename(&staging.path, &live)?;
        staging.promoted = true;
        Ok(live)
    }

    pub fn has_live(&self, map: &str) -> bool {
        self.live_path(map).is_file()
    }

    /// Source of the live script, or `None` when the map has no script.
    pub fn read_live(&self, map: &str) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.live_path(map)) {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn script_file_name(map: &str) -> String {
    let stem: String = map_id(map)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    format!("{stem}.lua")
}

/// Allow-list of maps that run with the staff script profile.
///
/// Loaded once at startup, append-only afterwards.
pub struct StaffMaps {
    path: PathBuf,
    maps: RwLock<HashSet<String>>,
}

impl StaffMaps {
    pub fn load(path: PathBuf, host: &dyn Host) -> io::Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            File::create(&path)?;
        }
        let maps = std::fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| host.level_exists(line))
            .map(map_id)
            .collect::<HashSet<_>>();
        info!("[Lua store] Loaded {} staff map(s)", maps.len());
        Ok(Self {
            path,
            maps: RwLock::new(maps),
        })
    }

    pub fn contains(&self, map: &str) -> bool {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&map_id(map))
    }

    /// Returns false when the map was already listed.
    pub fn add(&self, map: &str) -> io::Result<bool> {
        let id = map_id(map);
        let mut maps = self.maps.write().unwrap_or_else(|e| e.into_inner());
        if maps.contains(&id) {
            return Ok(false);
        }
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        writeln!(file, "{id}")?;
        maps.insert(id);
        Ok(true)
    }

    pub fn list(&self) -> Vec<String> {
        let mut items: Vec<_> = self
            .maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        items.sort();
        items
    }
}
