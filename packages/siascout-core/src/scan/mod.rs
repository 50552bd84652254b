//! The concurrent scanning pipeline.
//!
//! One producer enumerates granularity-sized blocks from the target list
//! (skipping cache hits in live mode) and pushes them onto an unbounded
//! queue. A fixed pool of workers drains the queue; a counting semaphore
//! caps in-flight API requests at the pool size. Workers exit when the
//! queue is empty and the producer has dropped its sender, so shutdown
//! needs no sentinel markers.
//!
//! Per-block failures are logged at the worker boundary and never cross
//! it. Only a 429 from the API aborts the run: the observing worker raises
//! the shared cancel flag and every other worker stops before its next
//! request.

use crate::api::{ListingSource, Outcome, Query, ScanKind};
use crate::expand::{expand_block, read_targets};
use crate::store::{HitTable, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};

#[derive(Debug, Error)]
pub enum ScanError {
    /// The API answered 429. Continuing risks an account-level lockout,
    /// so the whole run stops and nothing is retried.
    #[error("API rate limit hit (429); run aborted to avoid account lockout")]
    RateLimited,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Totals reported after a scan finishes.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Blocks queried (successfully or not) this run
    pub blocks_scanned: u64,
    /// Blocks skipped because the cache already had them
    pub blocks_skipped: u64,
    /// Match rows actually written (duplicates excluded)
    pub hits_stored: u64,
    pub elapsed: Duration,
}

/// Producer-consumer scan engine.
pub struct Collector<S: ListingSource + ?Sized> {
    source: Arc<S>,
    store: Store,
    query: Query,
    target_file: PathBuf,
    concurrency: usize,
    cancel: Arc<AtomicBool>,
}

impl<S: ListingSource + ?Sized + 'static> Collector<S> {
    pub fn new(
        source: Arc<S>,
        store: Store,
        query: Query,
        target_file: PathBuf,
        concurrency: usize,
    ) -> Self {
        Self {
            source,
            store,
            query,
            target_file,
            concurrency: concurrency.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag observed by producer and workers before each unit of work.
    /// Raising it lets in-flight requests finish and then winds the scan
    /// down; the CLI wires it to SIGINT.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run the scan to completion.
    pub async fn run(&self) -> Result<ScanSummary, ScanError> {
        let started = Instant::now();
        let live = matches!(self.query.kind, ScanKind::Live);
        let table = match self.query.kind {
            ScanKind::Live => HitTable::Live,
            ScanKind::History { .. } => HitTable::History,
        };

        tracing::info!(
            "Starting {} scan (dataset {}, {} workers)",
            self.query.kind.path_segment(),
            self.query.dataset,
            self.concurrency
        );

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));
        let permits = Arc::new(Semaphore::new(self.concurrency));

        let scanned = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let stored = Arc::new(AtomicU64::new(0));

        let producer = {
            let store = self.store.clone();
            let cancel = Arc::clone(&self.cancel);
            let skipped = Arc::clone(&skipped);
            let target_file = self.target_file.clone();
            tokio::spawn(async move {
                let targets = read_targets(&target_file)?;
                let mut queued = 0u64;
                'outer: for net in targets {
                    for block in expand_block(net) {
                        if cancel.load(Ordering::Relaxed) {
                            break 'outer;
                        }
                        let block = block.to_string();
                        if live && store.is_scanned(&block).await? {
                            tracing::debug!("[CACHE HIT] {} already scanned, skipping", block);
                            skipped.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        // Receiver closing early (all workers aborted) is
                        // not an error worth surfacing here.
                        if tx.send(block).is_err() {
                            break 'outer;
                        }
                        queued += 1;
                    }
                }
                tracing::info!("Producer finished: {} blocks queued", queued);
                anyhow::Ok(())
                // tx drops here; workers drain the queue and exit
            })
        };

        let mut workers = Vec::with_capacity(self.concurrency);
        for id in 0..self.concurrency {
            let source = Arc::clone(&self.source);
            let store = self.store.clone();
            let query = self.query.clone();
            let rx = Arc::clone(&rx);
            let permits = Arc::clone(&permits);
            let cancel = Arc::clone(&self.cancel);
            let scanned = Arc::clone(&scanned);
            let stored = Arc::clone(&stored);
            workers.push(tokio::spawn(async move {
                loop {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let block = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(block) = block else { break };

                    let outcome = {
                        let Ok(_permit) = permits.acquire().await else { break };
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        tracing::info!("[worker-{}] querying {}", id, block);
                        source.fetch_listings(&block, &query).await
                    };

                    let mark = live.then(|| chrono::Utc::now().timestamp());
                    let result = match outcome {
                        Outcome::Matches(hits) => {
                            let written = store.record_block(&block, &hits, table, mark).await;
                            if let Ok(n) = &written {
                                tracing::info!(
                                    "[worker-{}] stored {} listings for {}",
                                    id,
                                    n,
                                    block
                                );
                                stored.fetch_add(*n as u64, Ordering::Relaxed);
                            }
                            written.map(|_| ())
                        }
                        Outcome::Empty | Outcome::NotFound => {
                            store.record_block(&block, &[], table, mark).await.map(|_| ())
                        }
                        Outcome::TransientError => {
                            // No data this run; the block still counts as
                            // scanned in live mode and is not retried.
                            tracing::warn!(
                                "[worker-{}] no data obtained for {} (transient error)",
                                id,
                                block
                            );
                            store.record_block(&block, &[], table, mark).await.map(|_| ())
                        }
                        Outcome::RateLimited => {
                            cancel.store(true, Ordering::SeqCst);
                            return Err(ScanError::RateLimited);
                        }
                    };

                    if let Err(e) = result {
                        tracing::error!("[worker-{}] storage failure for {}: {}", id, block, e);
                    }
                    scanned.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!("[worker-{}] finished", id);
                Ok(())
            }));
        }

        // The producer failing (unreadable target list, broken cache read)
        // is fatal; workers then drain whatever was queued and exit.
        let producer_result = producer.await;

        let mut fatal: Option<ScanError> = None;
        for worker in futures::future::join_all(workers).await {
            match worker {
                Ok(Ok(())) => {}
                Ok(Err(e)) => fatal = Some(e),
                Err(e) => {
                    fatal.get_or_insert_with(|| {
                        ScanError::Other(anyhow::anyhow!("worker panicked: {}", e))
                    });
                }
            }
        }

        match producer_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                fatal.get_or_insert(ScanError::Other(e));
            }
            Err(e) => {
                fatal.get_or_insert(ScanError::Other(anyhow::anyhow!("producer panicked: {}", e)));
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let summary = ScanSummary {
            blocks_scanned: scanned.load(Ordering::Relaxed),
            blocks_skipped: skipped.load(Ordering::Relaxed),
            hits_stored: stored.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Scan finished in {:.2}s: {} blocks scanned, {} skipped, {} hits stored",
            summary.elapsed.as_secs_f64(),
            summary.blocks_scanned,
            summary.blocks_skipped,
            summary.hits_stored
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Listing;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Canned listing source: per-block outcomes plus a call counter.
    struct StubSource {
        outcomes: HashMap<String, Outcome>,
        default: Outcome,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(default: Outcome) -> Self {
            Self {
                outcomes: HashMap::new(),
                default,
                calls: AtomicUsize::new(0),
            }
        }

        fn with(mut self, block: &str, outcome: Outcome) -> Self {
            self.outcomes.insert(block.to_string(), outcome);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ListingSource for StubSource {
        async fn fetch_listings(&self, block: &str, _query: &Query) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.get(block).cloned().unwrap_or_else(|| self.default.clone())
        }
    }

    fn listing(ip: &str, listed: i64, rule: &str) -> Listing {
        Listing {
            dataset: "XBL".into(),
            ipaddress: ip.into(),
            listed,
            rule: rule.into(),
            asn: None,
            cc: None,
            seen: None,
            valid_until: None,
            botname: None,
            botname_malpedia: None,
            dstport: None,
            heuristic: None,
            lat: None,
            lon: None,
            protocol: None,
            srcip: None,
            domain: None,
            helo: None,
            detection: None,
        }
    }

    fn live_query() -> Query {
        Query {
            dataset: "ALL".into(),
            mode: "listed".into(),
            limit: 2000,
            kind: ScanKind::Live,
        }
    }

    fn write_targets(lines: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cidrs.txt");
        std::fs::write(&path, lines).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn live_scan_covers_expanded_blocks_and_fills_cache() {
        let (_dir, targets) = write_targets("203.0.112.0/22\n");
        let store = Store::open_in_memory().unwrap();
        let source = Arc::new(StubSource::new(Outcome::Empty));

        let collector = Collector::new(
            Arc::clone(&source),
            store.clone(),
            live_query(),
            targets,
            4,
        );
        let summary = collector.run().await.unwrap();

        assert_eq!(summary.blocks_scanned, 4);
        assert_eq!(summary.blocks_skipped, 0);
        assert_eq!(source.calls(), 4);
        assert_eq!(store.count_scanned().await.unwrap(), 4);
        for block in [
            "203.0.112.0/24",
            "203.0.113.0/24",
            "203.0.114.0/24",
            "203.0.115.0/24",
        ] {
            assert!(store.is_scanned(block).await.unwrap(), "{} missing", block);
        }
    }

    #[tokio::test]
    async fn second_live_run_is_fully_cache_filtered() {
        let (_dir, targets) = write_targets("203.0.112.0/22\n");
        let store = Store::open_in_memory().unwrap();

        let first = Arc::new(StubSource::new(Outcome::Empty));
        Collector::new(Arc::clone(&first), store.clone(), live_query(), targets.clone(), 4)
            .run()
            .await
            .unwrap();

        let second = Arc::new(StubSource::new(Outcome::Empty));
        let summary =
            Collector::new(Arc::clone(&second), store.clone(), live_query(), targets, 4)
                .run()
                .await
                .unwrap();

        assert_eq!(summary.blocks_scanned, 0);
        assert_eq!(summary.blocks_skipped, 4);
        assert_eq!(second.calls(), 0);
        assert_eq!(store.count_hits(HitTable::Live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn matches_are_stored_with_row_level_dedupe() {
        let (_dir, targets) = write_targets("192.0.2.0/24\n");
        let store = Store::open_in_memory().unwrap();
        // Two rules for one address plus an exact duplicate in the batch
        let source = Arc::new(StubSource::new(Outcome::Empty).with(
            "192.0.2.0/24",
            Outcome::Matches(vec![
                listing("192.0.2.7", 100, "RULE-A"),
                listing("192.0.2.7", 100, "RULE-B"),
                listing("192.0.2.7", 100, "RULE-A"),
            ]),
        ));

        let summary = Collector::new(source, store.clone(), live_query(), targets, 2)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.hits_stored, 2);
        assert_eq!(store.count_hits(HitTable::Live).await.unwrap(), 2);
        assert!(store.is_scanned("192.0.2.0/24").await.unwrap());
    }

    #[tokio::test]
    async fn transient_error_still_marks_block_scanned() {
        let (_dir, targets) = write_targets("192.0.2.0/24\n198.51.100.0/24\n");
        let store = Store::open_in_memory().unwrap();
        let source = Arc::new(
            StubSource::new(Outcome::Empty).with("192.0.2.0/24", Outcome::TransientError),
        );

        let summary = Collector::new(source, store.clone(), live_query(), targets, 2)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.blocks_scanned, 2);
        assert!(store.is_scanned("192.0.2.0/24").await.unwrap());
        assert_eq!(store.count_hits(HitTable::Live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rate_limit_aborts_the_whole_run() {
        // 64 blocks, every response is a 429
        let (_dir, targets) = write_targets("10.0.0.0/18\n");
        let store = Store::open_in_memory().unwrap();
        let source = Arc::new(StubSource::new(Outcome::RateLimited));
        let concurrency = 4;

        let collector = Collector::new(
            Arc::clone(&source),
            store.clone(),
            live_query(),
            targets,
            concurrency,
        );
        let err = collector.run().await.unwrap_err();
        assert!(matches!(err, ScanError::RateLimited));

        // Once the flag is raised no further requests go out; at most one
        // in-flight request per worker could have started before then.
        assert!(
            source.calls() <= concurrency,
            "issued {} calls after rate limit",
            source.calls()
        );
    }

    #[tokio::test]
    async fn history_scan_ignores_cache_and_writes_history_table() {
        let (_dir, targets) = write_targets("192.0.2.0/24\n");
        let store = Store::open_in_memory().unwrap();
        // Block already scanned in live mode; history must re-query it
        store.mark_scanned("192.0.2.0/24", 50).await.unwrap();

        let source = Arc::new(StubSource::new(Outcome::Empty).with(
            "192.0.2.0/24",
            Outcome::Matches(vec![listing("192.0.2.9", 90, "RULE-H")]),
        ));
        let query = Query {
            kind: ScanKind::History {
                since: 0,
                until: 100,
            },
            ..live_query()
        };

        let summary = Collector::new(Arc::clone(&source), store.clone(), query, targets, 2)
            .run()
            .await
            .unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(summary.hits_stored, 1);
        assert_eq!(store.count_hits(HitTable::History).await.unwrap(), 1);
        assert_eq!(store.count_hits(HitTable::Live).await.unwrap(), 0);
        // Cache untouched beyond the pre-existing mark
        assert_eq!(store.count_scanned().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_flag_stops_the_scan_early() {
        let (_dir, targets) = write_targets("10.0.0.0/16\n");
        let store = Store::open_in_memory().unwrap();
        let source = Arc::new(StubSource::new(Outcome::Empty));

        let collector =
            Collector::new(Arc::clone(&source), store.clone(), live_query(), targets, 2);
        collector.cancel_flag().store(true, Ordering::SeqCst);

        let summary = collector.run().await.unwrap();
        assert_eq!(summary.blocks_scanned, 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn missing_target_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let source = Arc::new(StubSource::new(Outcome::Empty));

        let collector = Collector::new(
            source,
            store,
            live_query(),
            dir.path().join("absent.txt"),
            2,
        );
        assert!(collector.run().await.is_err());
    }
}
