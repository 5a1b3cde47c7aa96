//! Motor MapReduce local: buffer acotado con spill a disco, merge k-way de
//! runs, pool de workers con dos clases y un scheduler que corre la fase
//! map, espera la barrera y luego la fase reduce.

pub mod api;
pub mod buffer;
pub mod config;
pub mod error;
pub mod map_task;
pub mod pool;
pub mod record;
pub mod reduce_task;
pub mod scheduler;
pub mod spill;
pub mod task;
pub mod tsv;

/* --------- Re-exports para el código de usuario --------- */

pub use api::{MapContext, Mapper, MapperFactory, ReduceContext, Reducer, ReducerFactory};
pub use config::{JobConfig, JobConfigBuilder, SpillCleanup};
pub use error::{JobError, Phase, Result};
pub use pool::{PoolStatus, ShutdownOutcome, WorkerPool};
pub use record::{Datum, Entry};
pub use scheduler::{JobStatistics, PhaseStats, Scheduler};
pub use task::{TaskId, TaskKind, TaskRecord, TaskState};
