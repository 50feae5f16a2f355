//! Persistence layer: pool management, schema, partitions, and the
//! storage operations the ingestion paths run through them.

mod partitions;
mod pool;
mod schema;
mod store;

// ---

pub use partitions::{partition_for, PartitionManager};
pub use pool::{DbManager, PoolConfig};
pub use schema::create_schema;
pub use store::{
    commit_delta, enqueue_ingested, get_latest, insert_timestamped, upsert_latest,
    TimestampedRecord,
};
