//! # Repeated-Pass Orchestrator
//!
//! A creature is only visible for a short window, shorter than the time it
//! takes to cover a large area, so one sweep misses many of them. The
//! [`Scanner`] therefore sweeps the same sample points several times, pass
//! `k` starting `k * pass_interval` after the run started, and folds every
//! pass into one [`ObservationMerger`].
//!
//! ## Flow
//!
//! 1. Validate the configuration and refuse passes that would overlap.
//! 2. Tile every rectangle and expand each point into its query cells.
//! 3. Log every user in (once for the whole run).
//! 4. Run the passes, sleeping until each scheduled offset.
//! 5. Close the sessions and summarise.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cells::CellIndexer;
use crate::client::ServiceConnector;
use crate::config::ScanConfiguration;
use crate::error::{ConfigResult, ConfigurationError, ScanResult};
use crate::estimate::{estimate, Estimate, RunSummary};
use crate::geometry::tile;
use crate::merger::{EntityObservation, ObservationMerger};
use crate::pool::{WorkItem, WorkerPool};
use crate::shutdown::ShutdownSignal;

const OBSERVATION_CHANNEL_CAPACITY: usize = 256;

/// Everything a finished (or cancelled) run produced.
#[derive(Debug)]
pub struct ScanReport {
    pub merger: ObservationMerger,
    pub summary: RunSummary,
    pub estimate: Estimate,
    pub cancelled: bool,
}

/// Drives a complete multi-pass scan.
pub struct Scanner {
    config: ScanConfiguration,
    connector: Arc<dyn ServiceConnector>,
    indexer: CellIndexer,
}

impl Scanner {
    /// Validates `config` and prepares the cell indexer.
    pub fn new(config: ScanConfiguration, connector: Arc<dyn ServiceConnector>) -> ConfigResult<Self> {
        config.validate()?;
        let indexer = CellIndexer::new(config.scanner.cell_level, config.scanner.cell_window)?;
        Ok(Self {
            config,
            connector,
            indexer,
        })
    }

    pub fn config(&self) -> &ScanConfiguration {
        &self.config
    }

    /// Work items of one pass: every rectangle's points in tiling order.
    pub fn plan(&self) -> ConfigResult<Vec<WorkItem>> {
        let settings = &self.config.scanner;
        let mut items = Vec::new();
        for (index, rect) in self.config.work.iter().enumerate() {
            let points = tile(rect, settings.radius, settings.error_margin)
                .map_err(|source| ConfigurationError::Rectangle { index, source })?;
            for point in points {
                items.push(WorkItem {
                    index: items.len(),
                    cells: self.indexer.cells_for(&point),
                    point,
                });
            }
        }
        Ok(items)
    }

    pub fn estimate(&self) -> ConfigResult<Estimate> {
        estimate(&self.config, self.config.scanner.radius, self.config.scanner.error_margin)
    }

    /// Estimates one pass and refuses runs whose passes would overlap.
    pub fn preflight(&self) -> ConfigResult<Estimate> {
        let estimate = self.estimate()?;
        let schedule = self.config.scanner.pass_schedule();
        if schedule.count > 1 && estimate.estimated_seconds > schedule.interval.as_secs_f64() {
            return Err(ConfigurationError::PassTooLong {
                estimated_secs: estimate.estimated_seconds,
                interval_secs: schedule.interval.as_secs(),
            });
        }
        Ok(estimate)
    }

    /// Runs every pass and returns the merged observations.
    ///
    /// Cancellation during login ends the run with `ScanError::Cancelled`.
    /// Once sessions exist, cancellation stops the current pass and the
    /// report still carries whatever was merged until then.
    pub async fn run(&self, shutdown: ShutdownSignal) -> ScanResult<ScanReport> {
        let started = Instant::now();
        let estimate = self.preflight()?;
        let items = self.plan()?;
        info!("📐 {}", estimate);

        let settings = &self.config.scanner;
        let schedule = settings.pass_schedule();
        let mut pool = WorkerPool::connect(
            self.connector.as_ref(),
            &self.config,
            settings.pool_settings(),
            &shutdown,
        )
        .await?;

        let (tx, mut rx) = mpsc::channel::<Vec<EntityObservation>>(OBSERVATION_CHANNEL_CAPACITY);

        let merging = async {
            let mut merger = ObservationMerger::new(settings.appearance_duration());
            while let Some(batch) = rx.recv().await {
                for observation in batch {
                    merger.insert(observation);
                }
            }
            merger
        };

        let passes = async {
            let tx = tx;
            let mut signal = shutdown.clone();
            let mut reports = Vec::with_capacity(schedule.count as usize);
            for pass in 0..schedule.count {
                if pass > 0 {
                    let deadline = started + schedule.offset_for_pass(pass);
                    let now = Instant::now();
                    if deadline > now {
                        info!("⏳ Pass {} starts in {:.0}s", pass + 1, (deadline - now).as_secs_f64());
                    } else {
                        warn!("Pass {} is starting {:.0}s late", pass + 1, (now - deadline).as_secs_f64());
                    }
                    if !signal.sleep_until(deadline).await {
                        break;
                    }
                }
                if signal.is_triggered() {
                    break;
                }

                let report = pool.run_pass(pass, items.clone(), tx.clone(), &signal).await;
                let cancelled = report.cancelled;
                reports.push(report);
                if cancelled {
                    break;
                }
            }
            reports
        };

        let (merger, reports) = tokio::join!(merging, passes);
        pool.close().await;

        let cancelled = shutdown.is_triggered();
        if cancelled {
            warn!("Scan cancelled after {} pass(es)", reports.len());
        }

        let summary = RunSummary::new(&merger, reports, started.elapsed());
        info!("📊 {}", summary);

        Ok(ScanReport {
            merger,
            summary,
            estimate,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AuthProvider, Credentials, MapQuery, RawResponse, ServiceSession};
    use crate::config::ScanSettings;
    use crate::error::{AuthError, ScanError, TransportError};
    use crate::geometry::BoundingRectangle;
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Every query reports the same creature at the queried position.
    struct EchoConnector {
        queries: Arc<AtomicUsize>,
    }

    struct EchoSession {
        queries: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServiceConnector for EchoConnector {
        async fn login(
            &self,
            _provider: AuthProvider,
            _credentials: &Credentials,
        ) -> Result<Box<dyn ServiceSession>, AuthError> {
            Ok(Box::new(EchoSession {
                queries: Arc::clone(&self.queries),
            }))
        }
    }

    #[async_trait]
    impl ServiceSession for EchoSession {
        async fn query(&mut self, query: &MapQuery) -> Result<RawResponse, TransportError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(RawResponse::from_body(json!({
                "status_code": 1,
                "map_cells": [{
                    "current_timestamp_ms": 1_469_000_000_000i64,
                    "wild_pokemons": [{
                        "spawn_point_id": "shared",
                        "latitude": query.position.latitude,
                        "longitude": query.position.longitude,
                        "time_till_hidden_ms": 300_000,
                        "pokemon_data": { "pokemon_id": 25 }
                    }]
                }]
            })))
        }
    }

    fn config(passes: u32, interval_secs: u64) -> ScanConfiguration {
        ScanConfiguration {
            auth_service: AuthProvider::Ptc,
            users: vec![
                Credentials {
                    username: "ash".to_string(),
                    password: "pika".to_string(),
                    auth_service: None,
                },
                Credentials {
                    username: "misty".to_string(),
                    password: "togepi".to_string(),
                    auth_service: Some(AuthProvider::Google),
                },
            ],
            work: vec![BoundingRectangle::new(0.0, 0.0, 0.004, 0.004)],
            scanner: ScanSettings {
                throttle_ms: 1,
                per_query_cost_ms: 1,
                idle_poll_ms: 2,
                pass_count: passes,
                pass_interval_secs: interval_secs,
                ..ScanSettings::default()
            },
        }
    }

    fn build(config: ScanConfiguration) -> (Scanner, Arc<AtomicUsize>) {
        let queries = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(EchoConnector {
            queries: Arc::clone(&queries),
        });
        (Scanner::new(config, connector).unwrap(), queries)
    }

    #[test]
    fn test_plan_indexes_every_point() {
        let (scanner, _) = build(config(1, 600));
        let items = scanner.plan().unwrap();

        assert!(!items.is_empty());
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.cells.len(), 21);
        }
        assert_eq!(items.len(), scanner.estimate().unwrap().total_sample_points);
    }

    #[test]
    fn test_preflight_refuses_overlapping_passes() {
        let mut cfg = config(6, 600);
        cfg.scanner.throttle_ms = 4000;
        cfg.scanner.per_query_cost_ms = 500;
        cfg.users.truncate(1);
        cfg.work = vec![BoundingRectangle::new(0.0, 0.0, 0.1, 0.1)];
        let (scanner, _) = build(cfg.clone());
        assert!(matches!(scanner.preflight(), Err(ConfigurationError::PassTooLong { .. })));

        cfg.scanner.pass_count = 1;
        let (single, _) = build(cfg);
        assert!(single.preflight().is_ok());
    }

    #[test]
    fn test_invalid_configuration_is_rejected_up_front() {
        let mut cfg = config(1, 600);
        cfg.users.clear();
        let connector = Arc::new(EchoConnector {
            queries: Arc::new(AtomicUsize::new(0)),
        });
        assert!(matches!(Scanner::new(cfg, connector), Err(ConfigurationError::NoUsers)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeated_passes_deduplicate() {
        let (scanner, queries) = build(config(3, 1));
        let points = scanner.plan().unwrap().len();

        let report = scanner.run(ShutdownSignal::never()).await.unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.summary.passes.len(), 3);
        assert!(report.summary.passes.iter().all(|pass| pass.is_done()));
        assert_eq!(queries.load(Ordering::SeqCst), points * 3);
        // One sighting per distinct position, however many passes saw it.
        assert_eq!(report.merger.creatures().len(), 1);
        assert_eq!(report.merger.spawns().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_between_passes_keeps_results() {
        let (scanner, _) = build(config(2, 3600));
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.trigger();
        });

        let report = tokio::time::timeout(Duration::from_secs(10), scanner.run(shutdown.signal()))
            .await
            .unwrap()
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.summary.passes.len(), 1);
        assert!(report.summary.passes[0].is_done());
        assert_eq!(report.summary.creature_sightings, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_login() {
        let (scanner, queries) = build(config(1, 600));
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let result = scanner.run(shutdown.signal()).await;
        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert_eq!(queries.load(Ordering::SeqCst), 0);
    }
}
