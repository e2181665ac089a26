//! Consumer side: receive commit lines, batch them, index them.
//!
//! ```text
//! producer socket ─┐
//! producer socket ─┼─▶ serve_connection ─▶ BatchAssembler ─▶ IndexingSink (ClickHouse)
//! producer socket ─┘
//! ```

mod assembler;
mod clickhouse;
mod server;
mod sink;

pub use assembler::{AssemblerConfig, AssemblerStats, BatchAssembler};
pub use self::clickhouse::{ClickHouseConfig, ClickHouseSink, RecordRow};
pub use server::{bind_unix, serve, serve_connection};
pub use sink::{Batches, CommitRow, IndexingSink};
