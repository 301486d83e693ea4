//! Query accounting: monotonic counters bumped on the hot path, and a
//! periodic dumper that turns them into a qps / failed-rate line and an
//! optional stats file.

use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

/// Counters shared between the query handlers (writers) and the dumper.
///
/// `queries` counts accepted queries; `failed` counts query-log records
/// dropped on a full cell, never upstream failures. Both only ever grow.
#[derive(Debug, Default)]
pub struct Counters {
    queries: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }

    pub fn incr_queries(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Periodically snapshots the counters. The dumper is the only writer of
/// the `last_*` fields, so each tick sees a consistent delta.
pub struct Dumper {
    counters: Arc<Counters>,
    period: u64,
    file: Option<PathBuf>,

    last_queries: u64,
    last_failed: u64,
    failed_rate: f64,
}

impl Dumper {
    pub fn new(counters: Arc<Counters>, period: u64, file: Option<PathBuf>) -> Dumper {
        Dumper {
            counters,
            period,
            file,
            last_queries: 0,
            last_failed: 0,
            failed_rate: 0.0,
        }
    }

    /// Runs until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.period);
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.dump().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One snapshot: log a summary line, refresh the stats file, then move
    /// the `last_*` marks forward.
    async fn dump(&mut self) {
        let queries = self.counters.queries();
        let failed = self.counters.failed();

        let delta_queries = queries - self.last_queries;
        let delta_failed = failed - self.last_failed;

        let qps = delta_queries as f64 / self.period as f64;

        // With no traffic this period, the previous rate stands.
        if delta_queries > 0 {
            self.failed_rate = delta_failed as f64 / delta_queries as f64;
        }

        info!(
            "qps: {:.1}, total queries: {}, log failed: {}, failed rate: {:.6}",
            qps, queries, failed, self.failed_rate
        );

        if let Some(path) = &self.file {
            let contents = render(queries, failed, self.failed_rate);

            if let Err(err) = write_atomically(path, &contents).await {
                warn!("failed to write stats file {}: {}", path.display(), err);
            }
        }

        self.last_queries = queries;
        self.last_failed = failed;
    }
}

fn render(queries: u64, failed: u64, failed_rate: f64) -> String {
    format!(
        "total queries: {}\nlog failed: {}\nfailed rate: {:.6}",
        queries, failed, failed_rate
    )
}

/// Replaces the file contents in one step: readers of the stats file never
/// observe a half-written summary.
async fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");

    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_counters_are_monotonic() {
        let counters = Counters::new();
        assert_eq!((counters.queries(), counters.failed()), (0, 0));

        counters.incr_queries();
        counters.incr_queries();
        counters.incr_failed();

        assert_eq!((counters.queries(), counters.failed()), (2, 1));
    }

    #[test]
    fn test_render() {
        assert_eq!(
            render(5, 1, 0.2),
            "total queries: 5\nlog failed: 1\nfailed rate: 0.200000"
        );
    }

    #[tokio::test]
    async fn test_dump_writes_file_and_advances_marks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats");

        let counters = Arc::new(Counters::new());
        let mut dumper = Dumper::new(counters.clone(), 1, Some(path.clone()));

        for _ in 0..5 {
            counters.incr_queries();
        }
        counters.incr_failed();

        dumper.dump().await;

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "total queries: 5\nlog failed: 1\nfailed rate: 0.200000"
        );
        assert_eq!(dumper.last_queries, 5);
        assert_eq!(dumper.last_failed, 1);

        // A quiet period: totals unchanged, and the rate holds rather than
        // resetting to zero.
        dumper.dump().await;

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "total queries: 5\nlog failed: 1\nfailed rate: 0.200000"
        );
    }

    #[tokio::test]
    async fn test_dump_rate_is_per_period() {
        let counters = Arc::new(Counters::new());
        let mut dumper = Dumper::new(counters.clone(), 1, None);

        for _ in 0..4 {
            counters.incr_queries();
        }
        dumper.dump().await;
        assert_eq!(dumper.failed_rate, 0.0);

        // Next period: 4 more queries, 2 drops. The rate covers only this
        // period's deltas.
        for _ in 0..4 {
            counters.incr_queries();
        }
        counters.incr_failed();
        counters.incr_failed();
        dumper.dump().await;

        assert_eq!(dumper.failed_rate, 0.5);
        assert_eq!(dumper.last_queries, 8);
        assert_eq!(dumper.last_failed, 2);
    }
}
