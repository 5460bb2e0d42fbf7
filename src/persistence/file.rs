//! File-backed bundler state store.
//!
//! Layout: `{root}/{channel}/{algorithm_hash}.json`. A state is written to a
//! `.tmp` sibling first and renamed into place, so a crash mid-write never
//! leaves a truncated state behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{LoadBalancerPersistence, StateKey};
use crate::bundler::BundlerState;
use crate::error::Result;

/// Root directory used by [`FileLoadBalancerPersistence::default`].
pub const DEFAULT_ROOT: &str = "lb_persistence";

const EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Stores each bundler state as a JSON file, one directory per channel.
///
/// Channel identifiers are mapped to directory names by replacing every
/// character outside `[A-Za-z0-9._-]` with `_`, so `list_channels()` returns
/// the mapped names.
#[derive(Clone, Debug)]
pub struct FileLoadBalancerPersistence {
    root: PathBuf,
}

impl Default for FileLoadBalancerPersistence {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl FileLoadBalancerPersistence {
    /// Store rooted at `root`. Directories are created on first store.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel: &str) -> PathBuf {
        self.root.join(file_name(channel))
    }

    fn state_path(channel_dir: &Path, algorithm: &str, extension: &str) -> PathBuf {
        channel_dir.join(format!("{}.{}", file_name(algorithm), extension))
    }

    fn channel_dirs(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

impl LoadBalancerPersistence for FileLoadBalancerPersistence {
    fn load(&self, key: &StateKey) -> Result<Option<BundlerState>> {
        let path = Self::state_path(&self.channel_dir(&key.channel), &key.algorithm, EXTENSION);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!(%key, "no stored bundler state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(%key, path = %path.display(), "loading bundler state");
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn store(&self, key: &StateKey, state: &BundlerState) -> Result<()> {
        let dir = self.channel_dir(&key.channel);
        fs::create_dir_all(&dir)?;
        let path = Self::state_path(&dir, &key.algorithm, EXTENSION);
        let tmp = Self::state_path(&dir, &key.algorithm, TEMP_EXTENSION);
        debug!(%key, path = %path.display(), "storing bundler state");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, channel: Option<&str>, algorithm: Option<&str>) -> Result<()> {
        debug!(?channel, ?algorithm, "deleting bundler states");
        let dirs = match channel {
            Some(channel) => vec![self.channel_dir(channel)],
            None => self.channel_dirs()?,
        };
        for dir in dirs {
            match algorithm {
                None => remove_dir_all_if_exists(&dir)?,
                Some(algorithm) => {
                    remove_file_if_exists(&Self::state_path(&dir, algorithm, EXTENSION))?;
                    remove_dir_if_empty(&dir)?;
                }
            }
        }
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<String>> {
        Ok(self
            .channel_dirs()?
            .iter()
            .filter_map(|dir| dir.file_name()?.to_str().map(str::to_owned))
            .collect())
    }

    fn list_algorithms(&self, channel: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.channel_dir(channel)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut algorithms = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    algorithms.push(stem.to_owned());
                }
            }
        }
        algorithms.sort();
        Ok(algorithms)
    }
}

/// Map an identifier to a single safe path component.
fn file_name(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => name.replace('.', "_") + "_",
        _ => name,
    }
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn remove_dir_if_empty(path: &Path) -> io::Result<()> {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                fs::remove_dir(path)?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
