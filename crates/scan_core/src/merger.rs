//! # Observation Merger
//!
//! Turns raw map responses into entity observations and folds them into
//! keyed, deduplicated stores:
//!
//! * creatures, keyed by `(appearance timestamp, spawn point)`: one record per
//!   distinct appearance
//! * spawns, keyed by `(second of the hour, spawn point)`: one record per
//!   recurring appearance slot, whatever the date
//! * stops and gyms, keyed by their id: latest state wins
//!
//! Inserting a key that is already present overwrites it, so re-observing an
//! entity (for instance on the next pass) never creates duplicates and the
//! final state does not depend on the order responses arrive in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cells::CellId;
use crate::client::RawResponse;
use crate::error::MalformedResponse;

/// How long a creature stays visible before it expires.
pub const DEFAULT_APPEARANCE_DURATION: Duration = Duration::from_millis(900_000);

const MS_PER_SECOND: i64 = 1000;
const SECONDS_PER_HOUR: i64 = 3600;

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct MapCell {
    current_timestamp_ms: i64,
    #[serde(default)]
    wild_pokemons: Vec<WildCreature>,
    #[serde(default)]
    forts: Vec<Fort>,
}

#[derive(Debug, Deserialize)]
struct WildCreature {
    spawn_point_id: String,
    latitude: f64,
    longitude: f64,
    time_till_hidden_ms: i64,
    pokemon_data: CreatureData,
}

#[derive(Debug, Deserialize)]
struct CreatureData {
    pokemon_id: u32,
}

#[derive(Debug, Deserialize)]
struct Fort {
    id: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    enabled: bool,
    #[serde(rename = "type", default)]
    fort_type: Option<serde_json::Value>,
    #[serde(default)]
    gym_points: Option<serde_json::Value>,
    #[serde(default)]
    owned_by_team: Option<u32>,
    #[serde(default)]
    lure_info: Option<LureInfo>,
}

#[derive(Debug, Deserialize)]
struct LureInfo {
    lure_expires_timestamp_ms: i64,
}

// ============================================================================
// Observations and records
// ============================================================================

/// A creature seen in one response, with its appearance time already derived.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatureSighting {
    pub spawn_point_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub creature_id: u32,
    /// Absolute time the creature appeared, in epoch milliseconds.
    pub appeared_at_ms: i64,
}

impl CreatureSighting {
    /// Seconds past the hour of the appearance, for aligning schedules across days.
    pub fn second_of_hour(&self) -> u32 {
        second_of_hour(self.appeared_at_ms)
    }
}

/// One decoded entity from a single response.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityObservation {
    Creature(CreatureSighting),
    PointOfInterest(StopRecord),
    Landmark(GymRecord),
}

/// Creature store value, one per appearance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatureRecord {
    #[serde(rename = "time")]
    pub appeared_at_ms: i64,
    #[serde(rename = "sid")]
    pub spawn_point_id: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(rename = "pid")]
    pub creature_id: u32,
    pub cell: String,
}

/// Spawn schedule store value, one per recurring slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRecord {
    #[serde(rename = "time")]
    pub second_of_hour: u32,
    #[serde(rename = "sid")]
    pub spawn_point_id: String,
    pub lat: f64,
    pub lng: f64,
    pub cell: String,
}

/// Point of interest (stop). `lure` is the lure expiry in epoch ms, or -1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRecord {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub lure: i64,
}

/// Landmark (gym). `team` is the owning team, 0 when neutral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GymRecord {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub team: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreatureKey {
    pub appeared_at_ms: i64,
    pub spawn_point_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpawnKey {
    pub second_of_hour: u32,
    pub spawn_point_id: String,
}

/// Seconds past the hour for an epoch-millisecond timestamp.
pub fn second_of_hour(timestamp_ms: i64) -> u32 {
    timestamp_ms
        .div_euclid(MS_PER_SECOND)
        .rem_euclid(SECONDS_PER_HOUR) as u32
}

// ============================================================================
// Deduplicated store
// ============================================================================

/// Keyed store where re-inserting a key replaces its value.
#[derive(Debug, Clone, PartialEq)]
pub struct DeduplicatedStore<K, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for DeduplicatedStore<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> DeduplicatedStore<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`; returns true when the key was new.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        self.entries.insert(key, value).is_none()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Values in key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Observations decoded from one response.
#[derive(Debug, Default)]
pub struct Extraction {
    pub observations: Vec<EntityObservation>,
    /// Cells that did not decode and were skipped.
    pub skipped_cells: usize,
    /// Sightings whose appearance time does not fit a timestamp.
    pub skipped_sightings: usize,
}

/// Decodes one response. Pure; never touches a store.
///
/// A response without a `map_cells` list is malformed. Individual cells that
/// fail to decode are skipped and counted, the rest of the response is kept.
pub fn extract(raw: &RawResponse, appearance_duration: Duration) -> Result<Extraction, MalformedResponse> {
    let cells = raw
        .body
        .get("map_cells")
        .and_then(|cells| cells.as_array())
        .ok_or(MalformedResponse::Missing("map_cells"))?;

    let duration_ms = i64::try_from(appearance_duration.as_millis()).unwrap_or(i64::MAX);
    let mut extraction = Extraction::default();

    for (index, cell) in cells.iter().enumerate() {
        let cell = match MapCell::deserialize(cell) {
            Ok(cell) => cell,
            Err(e) => {
                warn!("Skipping undecodable map cell #{}: {}", index, e);
                extraction.skipped_cells += 1;
                continue;
            }
        };

        for wild in cell.wild_pokemons {
            if wild.time_till_hidden_ms <= 0 {
                continue;
            }
            let Some(appeared_at_ms) = cell
                .current_timestamp_ms
                .checked_add(wild.time_till_hidden_ms)
                .and_then(|hidden_at| hidden_at.checked_sub(duration_ms))
            else {
                warn!(
                    "Skipping sighting at spawn point {} with out-of-range timestamps ({} + {})",
                    wild.spawn_point_id, cell.current_timestamp_ms, wild.time_till_hidden_ms
                );
                extraction.skipped_sightings += 1;
                continue;
            };
            extraction.observations.push(EntityObservation::Creature(CreatureSighting {
                appeared_at_ms,
                spawn_point_id: wild.spawn_point_id,
                latitude: wild.latitude,
                longitude: wild.longitude,
                creature_id: wild.pokemon_data.pokemon_id,
            }));
        }

        for fort in cell.forts.into_iter().filter(|fort| fort.enabled) {
            if fort.fort_type.is_some() {
                extraction.observations.push(EntityObservation::PointOfInterest(StopRecord {
                    id: fort.id.clone(),
                    lat: fort.latitude,
                    lng: fort.longitude,
                    lure: fort
                        .lure_info
                        .as_ref()
                        .map(|lure| lure.lure_expires_timestamp_ms)
                        .unwrap_or(-1),
                }));
            }
            if fort.gym_points.is_some() {
                extraction.observations.push(EntityObservation::Landmark(GymRecord {
                    id: fort.id,
                    lat: fort.latitude,
                    lng: fort.longitude,
                    team: fort.owned_by_team.unwrap_or(0),
                }));
            }
        }
    }

    Ok(extraction)
}

// ============================================================================
// Merger
// ============================================================================

/// Counters kept while merging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub responses: u64,
    pub malformed_responses: u64,
    pub skipped_cells: u64,
    pub skipped_sightings: u64,
    pub observations: u64,
}

/// Owns the deduplicated stores for a run.
#[derive(Debug, Clone)]
pub struct ObservationMerger {
    appearance_duration: Duration,
    creatures: DeduplicatedStore<CreatureKey, CreatureRecord>,
    spawns: DeduplicatedStore<SpawnKey, SpawnRecord>,
    stops: DeduplicatedStore<String, StopRecord>,
    gyms: DeduplicatedStore<String, GymRecord>,
    stats: MergeStats,
}

impl Default for ObservationMerger {
    fn default() -> Self {
        Self::new(DEFAULT_APPEARANCE_DURATION)
    }
}

impl ObservationMerger {
    pub fn new(appearance_duration: Duration) -> Self {
        Self {
            appearance_duration,
            creatures: DeduplicatedStore::new(),
            spawns: DeduplicatedStore::new(),
            stops: DeduplicatedStore::new(),
            gyms: DeduplicatedStore::new(),
            stats: MergeStats::default(),
        }
    }

    /// Decodes `raw` and inserts every observation. Returns how many
    /// observations the response held; a malformed response is counted and
    /// reported, and leaves the stores untouched.
    pub fn merge(&mut self, raw: &RawResponse) -> Result<usize, MalformedResponse> {
        self.stats.responses += 1;
        let extraction = match extract(raw, self.appearance_duration) {
            Ok(extraction) => extraction,
            Err(e) => {
                self.stats.malformed_responses += 1;
                return Err(e);
            }
        };

        self.stats.skipped_cells += extraction.skipped_cells as u64;
        self.stats.skipped_sightings += extraction.skipped_sightings as u64;
        let count = extraction.observations.len();
        for observation in extraction.observations {
            self.insert(observation);
        }
        debug!("Merged {} observations", count);
        Ok(count)
    }

    /// Inserts one observation into the store for its kind.
    pub fn insert(&mut self, observation: EntityObservation) {
        self.stats.observations += 1;
        match observation {
            EntityObservation::Creature(sighting) => {
                let cell = CellId::from_lat_lng(sighting.latitude, sighting.longitude).to_token();
                let second = sighting.second_of_hour();
                self.spawns.insert(
                    SpawnKey {
                        second_of_hour: second,
                        spawn_point_id: sighting.spawn_point_id.clone(),
                    },
                    SpawnRecord {
                        second_of_hour: second,
                        spawn_point_id: sighting.spawn_point_id.clone(),
                        lat: sighting.latitude,
                        lng: sighting.longitude,
                        cell: cell.clone(),
                    },
                );
                self.creatures.insert(
                    CreatureKey {
                        appeared_at_ms: sighting.appeared_at_ms,
                        spawn_point_id: sighting.spawn_point_id.clone(),
                    },
                    CreatureRecord {
                        appeared_at_ms: sighting.appeared_at_ms,
                        spawn_point_id: sighting.spawn_point_id,
                        lat: sighting.latitude,
                        lng: sighting.longitude,
                        creature_id: sighting.creature_id,
                        cell,
                    },
                );
            }
            EntityObservation::PointOfInterest(stop) => {
                self.stops.insert(stop.id.clone(), stop);
            }
            EntityObservation::Landmark(gym) => {
                self.gyms.insert(gym.id.clone(), gym);
            }
        }
    }

    pub fn creatures(&self) -> &DeduplicatedStore<CreatureKey, CreatureRecord> {
        &self.creatures
    }

    pub fn spawns(&self) -> &DeduplicatedStore<SpawnKey, SpawnRecord> {
        &self.spawns
    }

    pub fn stops(&self) -> &DeduplicatedStore<String, StopRecord> {
        &self.stops
    }

    pub fn gyms(&self) -> &DeduplicatedStore<String, GymRecord> {
        &self.gyms
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }
}
