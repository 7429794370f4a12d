//! Byte counters and the periodic progress sampler

use batchdl_types::{ChunkState, CoreEvent, ProgressSnapshot};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Live counters of one chunk
#[derive(Debug)]
pub struct ChunkProgress {
    pub index: u32,
    pub start: u64,
    /// Inclusive
    pub end: u64,
    written: AtomicU64,
    completed: AtomicBool,
}

impl ChunkProgress {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            written: AtomicU64::new(0),
            completed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn set_written(&self, bytes: u64) {
        self.written.store(bytes.min(self.size()), Ordering::Release);
    }

    pub fn add(&self, bytes: u64) {
        let size = self.size();
        let _ = self
            .written
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + bytes).min(size))
            });
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn mark_completed(&self) {
        self.set_written(self.size());
        self.completed.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> ChunkState {
        ChunkState {
            index: self.index,
            start: self.start,
            end: self.end,
            bytes_written: self.written(),
            completed: self.is_completed(),
        }
    }
}

/// Live counters of one destination file.
///
/// While a chunked transfer is running, the downloaded count is the sum of
/// its chunk counters; otherwise it is the single-stream write position.
#[derive(Debug, Default)]
pub struct FileProgress {
    written: AtomicU64,
    // 0 means unknown
    total: AtomicU64,
    start_byte: AtomicU64,
    chunks: Mutex<Vec<Arc<ChunkProgress>>>,
}

impl FileProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downloaded(&self) -> u64 {
        let chunks = self.chunks.lock();
        if chunks.is_empty() {
            self.written.load(Ordering::Acquire)
        } else {
            chunks.iter().map(|chunk| chunk.written()).sum()
        }
    }

    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Acquire) {
            0 => None,
            total => Some(total),
        }
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.total.store(total.unwrap_or(0), Ordering::Release);
    }

    pub fn start_byte(&self) -> u64 {
        self.start_byte.load(Ordering::Acquire)
    }

    /// Start a write session at `offset`
    pub fn begin_at(&self, offset: u64) {
        self.start_byte.store(offset, Ordering::Release);
        self.written.store(offset, Ordering::Release);
    }

    pub fn add(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn set_written(&self, bytes: u64) {
        self.written.store(bytes, Ordering::Release);
    }

    pub fn set_chunks(&self, chunks: Vec<Arc<ChunkProgress>>) {
        *self.chunks.lock() = chunks;
    }

    /// Collapse chunk counters back into the single write position
    pub fn clear_chunks(&self) {
        let mut chunks = self.chunks.lock();
        let sum = chunks.iter().map(|chunk| chunk.written()).sum();
        chunks.clear();
        self.written.store(sum, Ordering::Release);
    }

    pub fn chunk_states(&self) -> Vec<ChunkState> {
        self.chunks.lock().iter().map(|chunk| chunk.snapshot()).collect()
    }

    /// Forget everything, e.g. after the file was deleted
    pub fn reset(&self) {
        self.chunks.lock().clear();
        self.written.store(0, Ordering::Release);
        self.start_byte.store(0, Ordering::Release);
        self.total.store(0, Ordering::Release);
    }
}

/// Anything the sampler can turn into progress events
pub trait ProgressSource: Send + Sync {
    fn downloaded(&self) -> u64;

    fn snapshot(&self, speed: u64) -> ProgressSnapshot;
}

const SPEED_WINDOW: usize = 10;
const SPEED_ALPHA: f64 = 0.15;

/// Windowed average smoothed with an exponential moving average
#[derive(Debug)]
pub struct SpeedMeter {
    samples: VecDeque<f64>,
    smoothed: f64,
    last_bytes: u64,
    last_time: Instant,
}

impl SpeedMeter {
    pub fn new(downloaded: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_WINDOW),
            smoothed: 0.0,
            last_bytes: downloaded,
            last_time: Instant::now(),
        }
    }

    pub fn sample(&mut self, downloaded: u64) -> u64 {
        self.sample_at(downloaded, Instant::now())
    }

    fn sample_at(&mut self, downloaded: u64, now: Instant) -> u64 {
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        let instant = if elapsed > 0.0 {
            downloaded.saturating_sub(self.last_bytes) as f64 / elapsed
        } else {
            0.0
        };

        self.samples.push_back(instant);
        if self.samples.len() > SPEED_WINDOW {
            self.samples.pop_front();
        }
        let window_avg = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.smoothed = SPEED_ALPHA * window_avg + (1.0 - SPEED_ALPHA) * self.smoothed;

        self.last_bytes = downloaded;
        self.last_time = now;
        self.smoothed as u64
    }
}

/// Stops its sampler when dropped
#[derive(Debug)]
pub struct SamplerGuard {
    cancel: CancellationToken,
}

impl SamplerGuard {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ProgressReporter;

impl ProgressReporter {
    /// Emit a `Progress` event from `source` every `interval` until the
    /// returned guard is dropped
    pub fn spawn(
        interval: Duration,
        source: Arc<dyn ProgressSource>,
        events: broadcast::Sender<CoreEvent>,
    ) -> SamplerGuard {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut meter = SpeedMeter::new(source.downloaded());

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let speed = meter.sample(source.downloaded());
                        // No receivers is fine
                        let _ = events.send(CoreEvent::Progress(source.snapshot(speed)));
                    }
                }
            }
            debug!("Progress sampler stopped");
        });

        SamplerGuard { cancel }
    }
}
