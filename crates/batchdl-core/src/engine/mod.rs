//! Download Engine - The heart of batchdl
//!
//! This module implements a resumable HTTP download engine with:
//! - Single-stream transfers with Range resume and retry/backoff
//! - Chunked parallel transfers merged from side-files
//! - Per-part strategy selection driven by a HEAD probe
//! - Token-based pause/resume/cancel
//! - Periodic progress sampling

pub mod chunk_worker;
pub mod chunked;
pub mod http;
mod manager;
pub mod part;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod stream;

pub use chunked::{plan_chunks, ChunkedTransfer};
pub use manager::*;
pub use part::{plan_transfer, PartRunner, PartSlot, TransferPlan};
pub use probe::{probe, ProbeResult};
pub use progress::{FileProgress, ProgressReporter, ProgressSource, SpeedMeter};
pub use retry::RetryPolicy;
pub use stream::StreamTransfer;
