//! Result files
//!
//! Writes the final stores as JSON arrays (`pokes.json`, `spawns.json`,
//! `stops.json`, `gyms.json`) and the stops and gyms a second time as GeoJSON
//! feature collections (`geo_stops.json`, `geo_gyms.json`).

use scan_core::ObservationMerger;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize {name}: {source}")]
    Serialize {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize)]
struct FeatureCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    id: String,
    geometry: Geometry,
    properties: Properties,
}

#[derive(Debug, Serialize)]
struct Geometry {
    #[serde(rename = "type")]
    kind: &'static str,
    /// `[longitude, latitude]`, GeoJSON order.
    coordinates: [f64; 2],
}

#[derive(Debug, Serialize)]
struct Properties {
    name: String,
}

fn feature_collection<'a>(places: impl Iterator<Item = (&'a str, f64, f64)>) -> FeatureCollection {
    FeatureCollection {
        kind: "FeatureCollection",
        features: places
            .map(|(id, lat, lng)| Feature {
                kind: "Feature",
                id: id.to_string(),
                geometry: Geometry {
                    kind: "Point",
                    coordinates: [lng, lat],
                },
                properties: Properties { name: id.to_string() },
            })
            .collect(),
    }
}

async fn write_json<T: Serialize + ?Sized>(
    directory: &Path,
    name: &'static str,
    value: &T,
) -> Result<PathBuf, OutputError> {
    let body = serde_json::to_string_pretty(value).map_err(|source| OutputError::Serialize { name, source })?;
    let path = directory.join(name);
    tokio::fs::write(&path, body)
        .await
        .map_err(|source| OutputError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

/// Writes every result file into `directory`, creating it if needed.
///
/// # Returns
/// The paths written, in a fixed order.
pub async fn write_results(directory: &Path, merger: &ObservationMerger) -> Result<Vec<PathBuf>, OutputError> {
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|source| OutputError::Io {
            path: directory.to_path_buf(),
            source,
        })?;

    let creatures: Vec<_> = merger.creatures().values().collect();
    let spawns: Vec<_> = merger.spawns().values().collect();
    let stops: Vec<_> = merger.stops().values().collect();
    let gyms: Vec<_> = merger.gyms().values().collect();

    let geo_stops = feature_collection(stops.iter().map(|stop| (stop.id.as_str(), stop.lat, stop.lng)));
    let geo_gyms = feature_collection(gyms.iter().map(|gym| (gym.id.as_str(), gym.lat, gym.lng)));

    let written = vec![
        write_json(directory, "pokes.json", &creatures).await?,
        write_json(directory, "spawns.json", &spawns).await?,
        write_json(directory, "stops.json", &stops).await?,
        write_json(directory, "gyms.json", &gyms).await?,
        write_json(directory, "geo_stops.json", &geo_stops).await?,
        write_json(directory, "geo_gyms.json", &geo_gyms).await?,
    ];

    info!("💾 Wrote {} result files to {}", written.len(), directory.display());
    Ok(written)
}
