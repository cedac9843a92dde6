//! Workload estimates before a run and summaries after it.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::config::ScanConfiguration;
use crate::error::{ConfigResult, ConfigurationError, GeometryError};
use crate::geometry::{approximate_area, tile, M2_TO_KM2};
use crate::merger::ObservationMerger;
use crate::pool::PassReport;

/// Expected size and duration of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub total_sample_points: usize,
    pub total_area_km2: f64,
    pub estimated_seconds: f64,
    pub workers: usize,
}

impl fmt::Display for Estimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total of {} steps covering {:.3} km^2, approx {:.0} seconds for scan with {} worker(s)",
            self.total_sample_points, self.total_area_km2, self.estimated_seconds, self.workers
        )
    }
}

/// Sizes one pass over the configured work.
///
/// `estimated_seconds = points * (per_query_cost + throttle) / workers`. The
/// per-query cost is the configured guess, nothing is measured.
///
/// # Errors
/// Any rectangle that cannot be tiled, or an invalid radius or margin.
pub fn estimate(config: &ScanConfiguration, radius: f64, error_margin: f64) -> ConfigResult<Estimate> {
    let mut total_sample_points = 0;
    let mut area_m2 = 0.0;
    for (index, rect) in config.work.iter().enumerate() {
        let points = tile(rect, radius, error_margin).map_err(|source| match source {
            source @ (GeometryError::InvalidRadius(_) | GeometryError::InvalidErrorMargin(_)) => {
                ConfigurationError::Geometry(source)
            }
            source => ConfigurationError::Rectangle { index, source },
        })?;
        total_sample_points += points.len();
        area_m2 += approximate_area(rect);
    }

    let workers = config.worker_count().max(1);
    let per_point = config.scanner.per_query_cost() + config.scanner.throttle();
    let estimated_seconds = total_sample_points as f64 * per_point.as_secs_f64() / workers as f64;

    Ok(Estimate {
        total_sample_points,
        total_area_km2: area_m2 * M2_TO_KM2,
        estimated_seconds,
        workers: config.worker_count(),
    })
}

/// Final counts of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub creature_sightings: usize,
    pub spawn_points: usize,
    pub spawn_schedule_entries: usize,
    pub stops: usize,
    pub gyms: usize,
    #[serde(skip)]
    pub passes: Vec<PassReport>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(merger: &ObservationMerger, passes: Vec<PassReport>, elapsed: Duration) -> Self {
        let spawn_points: BTreeSet<&str> = merger
            .spawns()
            .keys()
            .map(|key| key.spawn_point_id.as_str())
            .collect();
        Self {
            creature_sightings: merger.creatures().len(),
            spawn_points: spawn_points.len(),
            spawn_schedule_entries: merger.spawns().len(),
            stops: merger.stops().len(),
            gyms: merger.gyms().len(),
            passes,
            elapsed,
        }
    }

    pub fn failed_attempts(&self) -> usize {
        self.passes.iter().map(|pass| pass.failed_attempts).sum()
    }

    pub fn abandoned(&self) -> usize {
        self.passes.iter().map(|pass| pass.abandoned).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Merged {} sightings at {} spawn points ({} schedule entries), {} stops and {} gyms \
             over {} pass(es) in {:.1}s; {} failed queries, {} points abandoned",
            self.creature_sightings,
            self.spawn_points,
            self.spawn_schedule_entries,
            self.stops,
            self.gyms,
            self.passes.len(),
            self.elapsed.as_secs_f64(),
            self.failed_attempts(),
            self.abandoned()
        )
    }
}
