//! Independent simulation episodes.
//!
//! Each episode builds its own coordinator, so nothing is shared between
//! them. With the `parallel` feature they run on the rayon pool.

use crate::echelon::EchelonCoordinator;
use crate::error::Result;
use crate::report::{DayReport, EpisodeSummary, MemorySink};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::info;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Reports and summary of one finished episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeResult {
    pub episode: u32,
    pub reports: Vec<DayReport>,
    pub summary: EpisodeSummary,
}

/// Builds and runs one episode to its horizon.
pub fn run_episode<C, F>(episode: u32, build: &F) -> Result<EpisodeResult>
where
    C: EchelonCoordinator,
    F: Fn(u32) -> Result<C>,
{
    let mut coordinator = build(episode)?;
    let mut sink = MemorySink::new();
    coordinator.run(&mut sink)?;
    let summary = sink.summary();
    info!(
        episode,
        shortage_rate = summary.shortage_rate(),
        outdate_rate = summary.outdate_rate(),
        "episode finished"
    );
    Ok(EpisodeResult {
        episode,
        reports: sink.reports,
        summary,
    })
}

/// Runs every episode in `episodes`, in parallel when the `parallel`
/// feature is enabled. Results come back in episode order; the first
/// failing episode's error is returned.
#[cfg(feature = "parallel")]
pub fn run_episodes<C, F>(episodes: Range<u32>, build: F) -> Result<Vec<EpisodeResult>>
where
    C: EchelonCoordinator,
    F: Fn(u32) -> Result<C> + Sync + Send,
{
    episodes
        .into_par_iter()
        .map(|e| run_episode(e, &build))
        .collect()
}

/// Runs every episode in `episodes`, in parallel when the `parallel`
/// feature is enabled. Results come back in episode order; the first
/// failing episode's error is returned.
#[cfg(not(feature = "parallel"))]
pub fn run_episodes<C, F>(episodes: Range<u32>, build: F) -> Result<Vec<EpisodeResult>>
where
    C: EchelonCoordinator,
    F: Fn(u32) -> Result<C> + Sync + Send,
{
    episodes.map(|e| run_episode(e, &build)).collect()
}
