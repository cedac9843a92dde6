//! # Scan Core
//!
//! Covers a geographic area with a pool of authenticated workers, polls a
//! location-based game service at every sample point, and merges what comes
//! back into deduplicated stores from which recurring spawn schedules can be
//! read off.
//!
//! ## Pipeline
//!
//! 1. [`geometry::tile`] lays a hexagonal lattice of sample points over each
//!    work rectangle
//! 2. [`cells::CellIndexer`] expands every point into the spatial cells to query
//! 3. [`pool::WorkerPool`] drains the points with one task per session,
//!    throttled and retried
//! 4. [`merger::ObservationMerger`] folds the responses into keyed stores
//! 5. [`passes::Scanner`] repeats the sweep at fixed offsets and returns a
//!    [`estimate::RunSummary`]
//!
//! The remote service itself is out of scope: callers plug it in by
//! implementing [`client::ServiceConnector`] and [`client::ServiceSession`].
//!
//! ## Errors
//!
//! Only configuration problems, exhausted login bounds and cancellation
//! reach the caller as [`ScanError`]. Failed or malformed queries are retried
//! or skipped inside the pool and surface as counters in the pass reports.
//!
//! ## Example
//!
//! ```rust,ignore
//! let scanner = Scanner::new(config, Arc::new(MyConnector::new()))?;
//! println!("{}", scanner.estimate()?);
//! let report = scanner.run(Shutdown::new().signal()).await?;
//! println!("{}", report.summary);
//! ```

pub use client::{AuthProvider, Credentials, MapQuery, RawResponse, ServiceConnector, ServiceSession};
pub use config::{MalformedPolicy, PassSchedule, PoolSettings, ScanConfiguration, ScanSettings};
pub use error::{
    AuthError, ConfigurationError, GeometryError, MalformedResponse, QueryFailure, ScanError, ScanResult,
    TransportError,
};
pub use estimate::{estimate, Estimate, RunSummary};
pub use geometry::{tile, BoundingRectangle, SamplePoint};
pub use merger::{CreatureRecord, GymRecord, ObservationMerger, SpawnRecord, StopRecord};
pub use passes::{ScanReport, Scanner};
pub use pool::{PassReport, WorkerPool};
pub use shutdown::{Shutdown, ShutdownSignal};

pub mod cells;
pub mod client;
pub mod config;
pub mod error;
pub mod estimate;
pub mod geometry;
pub mod merger;
pub mod passes;
pub mod pool;
pub mod shutdown;
