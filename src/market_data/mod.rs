// Market data module entrypoint
pub mod record;    // tick snapshot value type + raw tick conversion
pub mod pool;      // reusable record storage
pub mod pipeline;  // bounded queue + worker partitions

pub use pipeline::{IngestError, JsonLinesHandler, LogHandler, Pipeline, PipelineConfig, PipelineStats, TickHandler};
pub use pool::{AcquirePolicy, PoolConfig, PoolError, PooledRecord, RecordPool};
pub use record::{convert, InstrumentId, InstrumentIdError, Level, MarketDataRecord, RawTick, MAX_DEPTH, MAX_INSTRUMENT_LEN};
