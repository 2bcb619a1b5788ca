//! Resumable simulation state.
//!
//! A checkpoint is written after a day completes and stores the day to
//! simulate next. Files live at `<dir>/episode-<e>/day-<d>.json`.

use crate::echelon::Location;
use crate::error::Result;
use crate::inventory::IdMint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Ledgers and pending requests of every location of one episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub episode: u32,
    /// The next day to simulate.
    pub day: u32,
    pub mint: IdMint,
    pub locations: Vec<Location>,
}

impl Checkpoint {
    pub fn episode_dir(dir: &Path, episode: u32) -> PathBuf {
        dir.join(format!("episode-{episode}"))
    }

    pub fn path(dir: &Path, episode: u32, day: u32) -> PathBuf {
        Self::episode_dir(dir, episode).join(format!("day-{day}.json"))
    }

    /// Writes the checkpoint under `dir` and returns its path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = Self::path(dir, self.episode, self.day);
        fs::create_dir_all(Self::episode_dir(dir, self.episode))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "checkpoint written");
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The checkpoint with the highest day for `episode`, if any.
    pub fn latest(dir: &Path, episode: u32) -> Result<Option<Self>> {
        let episode_dir = Self::episode_dir(dir, episode);
        if !episode_dir.is_dir() {
            return Ok(None);
        }
        let mut best: Option<(u32, PathBuf)> = None;
        for entry in fs::read_dir(&episode_dir)? {
            let path = entry?.path();
            let day = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("day-"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u32>().ok());
            if let Some(day) = day {
                if best.as_ref().is_none_or(|(d, _)| day > *d) {
                    best = Some((day, path));
                }
            }
        }
        best.map(|(_, path)| Self::load(&path)).transpose()
    }
}
