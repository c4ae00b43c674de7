pub mod aggregate;
pub mod combine;
pub mod config;
pub mod error;
pub mod loader;
pub mod logging;
pub mod output;
pub mod partition;
pub mod record;
pub mod run;
pub mod transport;

pub use aggregate::{aggregate_parallel, CountByKey, LocalAggregate};
pub use config::{ClusterEnv, RunConfig, SchemaKind};
pub use error::{ParseError, SetupError};
pub use logging::{EventLog, FileEventLog};
pub use partition::{plan_ranges, record_span, OffsetTable, WorkerRange};
pub use record::{PrunedSchema, RecordSchema, VehicleRecord, VehicleSchema};
pub use run::{run_local, run_rank, RankContext, RankReport, Role, RunSummary};
pub use transport::{CompletionBarrier, RangeChannel};
