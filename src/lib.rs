//! fleetsink — telemetry ingestion and distribution server for
//! mobile/IoT device fleets.
//!
//! The crate is organized around the ingestion paths: single telemetry
//! posts go through the priority scheduler, offline batches through the
//! stream processor, and partial samples through the delta processor.
//! Everything shares one database manager, one KV client, and one
//! weather enrichment pipeline, wired together in [`AppState`].

pub mod batch;
pub mod breaker;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod geo;
pub mod kv;
pub mod merge;
pub mod pressure;
pub mod routes;
pub mod scheduler;
pub mod timestamp;
pub mod validate;
pub mod weather;

use std::sync::Arc;

use batch::delta::DeltaProcessor;
use batch::stream::StreamProcessor;
use batch::BatchMemoryManager;
use config::Config;
use db::{DbManager, PartitionManager};
use kv::KvClient;
use scheduler::PriorityTaskManager;
use weather::pipeline::WeatherPipeline;

/// Shared application state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<DbManager>,
    pub partitions: Arc<PartitionManager>,
    pub kv: KvClient,
    pub scheduler: Arc<PriorityTaskManager>,
    pub memory: Arc<BatchMemoryManager>,
    pub weather: Arc<WeatherPipeline>,
    pub stream: Arc<StreamProcessor>,
    pub delta: Arc<DeltaProcessor>,
}
