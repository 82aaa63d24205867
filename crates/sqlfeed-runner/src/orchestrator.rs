use std::fs;
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::channel::{ChildSpec, SubprocessChannel};
use crate::classify::{Classifier, ClassifierReport, Recorder, SequenceCounter};
use crate::config::HarnessConfig;
use crate::pacer::{Pacer, PacerReport};
use crate::queue::{PendingQueue, TestUnit};
use crate::segment::Segments;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub working_dir: String,
    pub result_log: String,
    pub stale_entries_removed: usize,
    pub units_enqueued: usize,
    pub units_delivered: u64,
    pub units_failed: u64,
    pub units_pending: usize,
    pub output_lines: Option<u64>,
    pub records: u64,
    pub child_exit: String,
    pub child_killed: bool,
    pub result_log_sha256: String,
}

/// Deletes `dir` if present and recreates it empty. Returns how many
/// entries were removed.
pub fn prepare_working_dir(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    if fs::symlink_metadata(dir).is_ok() {
        removed = WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .count();
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove working directory {}", dir.display()))?;
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create working directory {}", dir.display()))?;
    info!(path = %dir.display(), removed, "working directory reset");
    Ok(removed)
}

/// Schema blob first, verbatim, then every segmented test unit in order.
pub fn load_units(schema_path: &Path, test_path: &Path, marker: &Regex) -> Result<Vec<TestUnit>> {
    let schema = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema file {}", schema_path.display()))?;
    let raw_tests = fs::read_to_string(test_path)
        .with_context(|| format!("failed to read test file {}", test_path.display()))?;

    let mut units = vec![TestUnit::schema(schema)];
    units.extend(
        Segments::new(&raw_tests, marker)
            .iter()
            .enumerate()
            .map(|(i, body)| TestUnit::test(i + 1, body)),
    );
    info!(
        schema = %schema_path.display(),
        tests = %test_path.display(),
        test_units = units.len() - 1,
        "test units loaded"
    );
    Ok(units)
}

/// True once `rx` fires or its sender is gone, false on timeout.
fn signalled_within(rx: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read result log {}", path.display()))?;
    Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
}

/// Runs one harness session: prepare, load, launch, warm up, feed, drain,
/// terminate.
///
/// Only the prepare and load steps (and failing to start the child) are
/// fatal. A child that exits early shows up as failed deliveries and an
/// early end of output, never as an error.
pub fn run(config: &HarnessConfig) -> Result<RunSummary> {
    let marker = config.validate()?;
    let timing = config.timing;
    let started = Utc::now();
    let run_id = format!("run_{}", started.format("%Y%m%d_%H%M%S"));
    info!(run_id = %run_id, "harness run starting");

    let stale_entries_removed = prepare_working_dir(&config.working_dir)?;
    let units = load_units(&config.schema_path, &config.test_path, &marker)?;

    let sequence = Arc::new(SequenceCounter::new());
    let recorder = Recorder::create(&config.result_log, Arc::clone(&sequence))
        .with_context(|| format!("failed to create result log {}", config.result_log.display()))?;
    let spec = ChildSpec {
        executable: config.executable.clone(),
        mode: config.mode.clone(),
        working_dir: config.working_dir.clone(),
    };
    let SubprocessChannel {
        mut input,
        mut output,
        child,
    } = SubprocessChannel::launch(&spec)
        .with_context(|| format!("failed to launch {}", config.executable.display()))?;
    info!(pid = child.id(), "child running");

    let queue = Arc::new(PendingQueue::new());
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (paced_tx, paced_rx) = mpsc::channel::<()>();
    let pacer = Pacer::new(Arc::clone(&queue), timing.tick);
    let pacer_thread = thread::Builder::new()
        .name("sqlfeed-pacer".to_string())
        .spawn(move || {
            let report = pacer.run(&mut input, &stop_rx);
            input.close();
            let _ = paced_tx.send(());
            report
        })
        .context("failed to start pacer thread")?;

    let (classified_tx, classified_rx) = mpsc::channel::<()>();
    let classifier_thread = thread::Builder::new()
        .name("sqlfeed-classifier".to_string())
        .spawn(move || {
            let mut classifier = Classifier::new(recorder, io::stdout());
            let report = classifier.run(&mut output);
            let _ = classified_tx.send(());
            report
        })
        .context("failed to start classifier thread")?;

    thread::sleep(timing.warmup);

    let units_enqueued = units.len();
    for unit in units {
        debug!(unit = %unit.kind(), "unit enqueued");
        queue.push(unit);
        thread::sleep(timing.tick);
    }
    thread::sleep(timing.drain);

    // A child that stops reading stdin can leave the pacer blocked in a
    // write. Stopping the child turns that write into a broken pipe, so the
    // pacer gets one grace period before the child and one after.
    let _ = stop_tx.send(());
    let mut pacer_stopped = signalled_within(&paced_rx, timing.shutdown_grace);
    if !pacer_stopped {
        warn!("pacer blocked on child input, stopping child first");
    }

    let exit = child
        .shutdown(timing.shutdown_grace)
        .context("failed to stop child process")?;
    info!(status = %exit.status, killed = exit.killed, "child stopped");

    if !pacer_stopped {
        pacer_stopped = signalled_within(&paced_rx, timing.shutdown_grace);
    }
    let pacer_report = if pacer_stopped {
        pacer_thread
            .join()
            .map_err(|_| anyhow!("pacer thread panicked"))?
    } else {
        warn!("child input still blocked after shutdown, leaving pacer detached");
        PacerReport::default()
    };
    let units_pending = queue.len();
    if units_pending > 0 {
        warn!(units_pending, "units left undelivered at termination");
    }

    let classifier_report: Option<ClassifierReport> =
        if signalled_within(&classified_rx, timing.shutdown_grace) {
            match classifier_thread.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    warn!("classifier thread panicked");
                    None
                }
            }
        } else {
            warn!("child output still open after shutdown, leaving classifier detached");
            None
        };

    let summary = RunSummary {
        run_id,
        started_at: started.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        working_dir: config.working_dir.display().to_string(),
        result_log: config.result_log.display().to_string(),
        stale_entries_removed,
        units_enqueued,
        units_delivered: pacer_report.delivered,
        units_failed: pacer_report.failed,
        units_pending,
        output_lines: classifier_report.map(|r| r.lines_seen),
        records: sequence.issued(),
        child_exit: exit.status,
        child_killed: exit.killed,
        result_log_sha256: sha256_file(&config.result_log)?,
    };
    info!(
        run_id = %summary.run_id,
        delivered = summary.units_delivered,
        records = summary.records,
        "harness run finished"
    );
    Ok(summary)
}
