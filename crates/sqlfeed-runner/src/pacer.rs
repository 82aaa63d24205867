use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::LineSink;
use crate::queue::PendingQueue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerReport {
    pub ticks: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Releases at most one queued unit per tick to a sink.
#[derive(Debug, Clone)]
pub struct Pacer {
    queue: Arc<PendingQueue>,
    tick: Duration,
}

impl Pacer {
    pub fn new(queue: Arc<PendingQueue>, tick: Duration) -> Self {
        Self { queue, tick }
    }

    /// Runs until `stop` fires or its sender is dropped. A unit whose send
    /// fails is counted and not retried.
    pub fn run<S: LineSink>(&self, sink: &mut S, stop: &Receiver<()>) -> PacerReport {
        let mut report = PacerReport::default();
        loop {
            match stop.recv_timeout(self.tick) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            report.ticks += 1;

            let Some(unit) = self.queue.pop() else {
                continue;
            };
            match sink.send(unit.body()) {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(unit = %unit.kind(), bytes = unit.body().len(), "unit delivered");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(unit = %unit.kind(), error = %e, "unit delivery failed");
                }
            }
        }
        info!(
            ticks = report.ticks,
            delivered = report.delivered,
            failed = report.failed,
            "pacer stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::queue::TestUnit;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(Instant, String)>>>,
    }

    impl RecordingSink {
        fn lines(&self) -> Vec<String> {
            self.sent
                .lock()
                .expect("sink lock")
                .iter()
                .map(|(_, l)| l.clone())
                .collect()
        }

        fn instants(&self) -> Vec<Instant> {
            self.sent
                .lock()
                .expect("sink lock")
                .iter()
                .map(|(t, _)| *t)
                .collect()
        }
    }

    impl LineSink for RecordingSink {
        fn send(&mut self, line: &str) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .expect("sink lock")
                .push((Instant::now(), line.to_string()));
            Ok(())
        }
    }

    struct ClosedSink;

    impl LineSink for ClosedSink {
        fn send(&mut self, _line: &str) -> Result<(), ChannelError> {
            Err(ChannelError::Closed)
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn delivers_in_fifo_order_one_per_tick() {
        let tick = Duration::from_millis(40);
        let queue = Arc::new(PendingQueue::new());
        queue.push(TestUnit::schema("CREATE TABLE t(x INT);"));
        queue.push(TestUnit::test(1, "INSERT INTO t VALUES(1);"));
        queue.push(TestUnit::test(2, "SELECT * FROM t;"));

        let sink = RecordingSink::default();
        let (stop_tx, stop_rx) = mpsc::channel();
        let pacer = Pacer::new(Arc::clone(&queue), tick);
        let mut worker_sink = sink.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || pacer.run(&mut worker_sink, &stop_rx));

        assert!(wait_until(Duration::from_secs(5), || sink.lines().len() == 3));
        stop_tx.send(()).expect("stop");
        let report = handle.join().expect("pacer thread");

        assert_eq!(report.delivered, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(
            sink.lines(),
            vec![
                "CREATE TABLE t(x INT);",
                "INSERT INTO t VALUES(1);",
                "SELECT * FROM t;"
            ]
        );

        let instants = sink.instants();
        assert!(instants[0].duration_since(started) >= tick);
        for pair in instants.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= tick);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn idles_on_empty_queue_and_picks_up_late_units() {
        let tick = Duration::from_millis(20);
        let queue = Arc::new(PendingQueue::new());
        let sink = RecordingSink::default();
        let (stop_tx, stop_rx) = mpsc::channel();
        let pacer = Pacer::new(Arc::clone(&queue), tick);
        let mut worker_sink = sink.clone();
        let handle = thread::spawn(move || pacer.run(&mut worker_sink, &stop_rx));

        thread::sleep(tick * 3);
        assert!(sink.lines().is_empty());
        queue.push(TestUnit::test(1, "SELECT 1;"));
        assert!(wait_until(Duration::from_secs(5), || sink.lines().len() == 1));

        drop(stop_tx);
        let report = handle.join().expect("pacer thread");
        assert_eq!(report.delivered, 1);
        assert!(report.ticks >= 3);
    }

    #[test]
    fn failed_sends_consume_units_without_retry() {
        let queue = Arc::new(PendingQueue::new());
        queue.push(TestUnit::schema("CREATE TABLE t(x INT);"));
        queue.push(TestUnit::test(1, "SELECT 1;"));
        let (stop_tx, stop_rx) = mpsc::channel();
        let pacer = Pacer::new(Arc::clone(&queue), Duration::from_millis(10));
        let worker_queue = Arc::clone(&queue);
        let handle = thread::spawn(move || pacer.run(&mut ClosedSink, &stop_rx));

        assert!(wait_until(Duration::from_secs(5), || worker_queue.is_empty()));
        thread::sleep(Duration::from_millis(30));
        stop_tx.send(()).expect("stop");
        let report = handle.join().expect("pacer thread");
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 2);
    }

    #[test]
    fn stop_before_first_tick_delivers_nothing() {
        let queue = Arc::new(PendingQueue::new());
        queue.push(TestUnit::schema("CREATE TABLE t(x INT);"));
        let (stop_tx, stop_rx) = mpsc::channel();
        stop_tx.send(()).expect("stop");
        let mut sink = RecordingSink::default();
        let report = Pacer::new(Arc::clone(&queue), Duration::from_secs(60)).run(&mut sink, &stop_rx);
        assert_eq!(report, PacerReport::default());
        assert_eq!(queue.len(), 1);
    }
}
