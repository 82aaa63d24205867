use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::channel::LineSource;

const TAG_PATTERN: &str = r"^[A-Z]+:";
const VALID_TOKEN: &str = "VALID";

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(TAG_PATTERN).expect("tag pattern is a valid regex"))
}

/// True for lines that open with an uppercase tag and a colon, or mention `VALID`.
pub fn is_classified(line: &str) -> bool {
    tag_regex().is_match(line) || line.contains(VALID_TOKEN)
}

/// Sequence numbers handed out to result records, starting at 1.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    issued: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    fn peek_next(&self) -> u64 {
        self.issued() + 1
    }

    fn advance(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Appends `(sequence, line)` records to the result log.
///
/// Each record is three lines: the decimal sequence number, the matched
/// line verbatim and a blank separator. The writer is flushed after every
/// record. A sequence number is consumed as soon as any byte of its record
/// reaches the writer, so a partial record is never followed by a reused
/// number; a write that fails before any byte lands consumes nothing.
pub struct Recorder<W: Write> {
    out: W,
    sequence: Arc<SequenceCounter>,
}

impl Recorder<BufWriter<File>> {
    /// Truncates `path` and records into it.
    pub fn create(path: &Path, sequence: Arc<SequenceCounter>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(BufWriter::new(file), sequence))
    }
}

impl<W: Write> Recorder<W> {
    pub fn new(out: W, sequence: Arc<SequenceCounter>) -> Self {
        Self { out, sequence }
    }

    pub fn record(&mut self, line: &str) -> io::Result<u64> {
        let seq = self.sequence.peek_next();
        let entry = format!("{}\n{}\n\n", seq, line);
        match write_counted(&mut self.out, entry.as_bytes()) {
            Ok(()) => {}
            Err((0, e)) => return Err(e),
            Err((_, e)) => {
                self.sequence.advance();
                return Err(e);
            }
        }
        self.sequence.advance();
        self.out.flush()?;
        Ok(seq)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// `write_all` that reports how many bytes were accepted before a failure.
fn write_counted<W: Write>(out: &mut W, mut buf: &[u8]) -> Result<(), (usize, io::Error)> {
    let mut written = 0;
    while !buf.is_empty() {
        match out.write(buf) {
            Ok(0) => return Err((written, io::ErrorKind::WriteZero.into())),
            Ok(n) => {
                written += n;
                buf = &buf[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err((written, e)),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierReport {
    pub lines_seen: u64,
    pub records: u64,
    pub write_failures: u64,
}

/// Drains a line source until EOF, echoing every line to `console` and
/// recording the classified ones.
pub struct Classifier<W: Write, C: Write> {
    recorder: Recorder<W>,
    console: C,
}

impl<W: Write, C: Write> Classifier<W, C> {
    pub fn new(recorder: Recorder<W>, console: C) -> Self {
        Self { recorder, console }
    }

    pub fn run<S: LineSource>(&mut self, source: &mut S) -> ClassifierReport {
        let mut report = ClassifierReport::default();
        while let Some(line) = source.receive_line() {
            report.lines_seen += 1;
            if let Err(e) = writeln!(self.console, "{}", line) {
                debug!(error = %e, "console echo failed");
            }
            if !is_classified(&line) {
                continue;
            }
            match self.recorder.record(&line) {
                Ok(seq) => {
                    report.records += 1;
                    debug!(seq, line = %line, "recorded");
                }
                Err(e) => {
                    report.write_failures += 1;
                    warn!(error = %e, line = %line, "failed to write result record");
                }
            }
        }
        let _ = self.console.flush();
        info!(
            lines = report.lines_seen,
            records = report.records,
            "child output closed"
        );
        report
    }

    pub fn into_parts(self) -> (Recorder<W>, C) {
        (self.recorder, self.console)
    }
}
