use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ChannelError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Write side of a line stream.
pub trait LineSink {
    fn send(&mut self, line: &str) -> Result<(), ChannelError>;
}

/// Read side of a line stream. `None` means the stream is closed for good.
pub trait LineSource {
    fn receive_line(&mut self) -> Option<String>;
}

/// Invocation `<executable> <mode> <working_dir>`.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub executable: PathBuf,
    pub mode: String,
    pub working_dir: PathBuf,
}

impl ChildSpec {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg(&self.mode);
        cmd.arg(&self.working_dir);
        cmd.stdin(Stdio::piped());
        cmd
    }
}

/// A running child split into its exclusively owned parts: the stdin writer,
/// the merged stdout/stderr reader and the process handle.
pub struct SubprocessChannel {
    pub input: ChannelInput,
    pub output: ChannelOutput,
    pub child: ChildProcess,
}

impl SubprocessChannel {
    pub fn launch(spec: &ChildSpec) -> Result<Self, ChannelError> {
        // stdout and stderr share one pipe so the child's write order survives
        let (reader, writer) = io::pipe()?;
        let mut cmd = spec.command();
        cmd.stdout(writer.try_clone()?);
        cmd.stderr(writer);
        let spawned = cmd.spawn();
        // the parent's copies of the write end must go, or EOF never arrives
        drop(cmd);
        let mut child = spawned?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let child = ChildProcess {
            child: Some(child),
            pid,
        };

        let (tx, rx) = mpsc::channel();
        let pump = spawn_pump(reader, tx)?;
        debug!(
            pid,
            executable = %spec.executable.display(),
            mode = %spec.mode,
            working_dir = %spec.working_dir.display(),
            "child launched"
        );

        Ok(Self {
            input: ChannelInput { stdin },
            output: ChannelOutput {
                lines: rx,
                pump: Some(pump),
            },
            child,
        })
    }
}

pub struct ChannelInput {
    stdin: Option<ChildStdin>,
}

impl ChannelInput {
    /// Closes the child's stdin. Further sends fail with `Closed`.
    pub fn close(&mut self) {
        self.stdin.take();
    }
}

impl LineSink for ChannelInput {
    fn send(&mut self, line: &str) -> Result<(), ChannelError> {
        let stdin = self.stdin.as_mut().ok_or(ChannelError::Closed)?;
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');
        let result = stdin
            .write_all(payload.as_bytes())
            .and_then(|_| stdin.flush());
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.stdin = None;
                Err(ChannelError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct ChannelOutput {
    lines: Receiver<String>,
    pump: Option<JoinHandle<()>>,
}

impl LineSource for ChannelOutput {
    fn receive_line(&mut self) -> Option<String> {
        match self.lines.recv() {
            Ok(line) => Some(line),
            Err(_) => {
                // the pump has dropped its sender, so joining cannot block
                if let Some(pump) = self.pump.take() {
                    let _ = pump.join();
                }
                None
            }
        }
    }
}

fn spawn_pump<R>(stream: R, tx: Sender<String>) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name("sqlfeed-output".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(decode_line(&buf)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(error = %e, "child output read failed");
                        break;
                    }
                }
            }
            debug!("child output closed");
        })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code as a decimal string, or `signal` when none was reported.
    pub status: String,
    pub killed: bool,
}

fn describe_status(status: ExitStatus) -> String {
    status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Owns the child process. Dropping it without `shutdown` kills and reaps it.
pub struct ChildProcess {
    child: Option<Child>,
    pid: u32,
}

impl ChildProcess {
    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn try_status(&mut self) -> io::Result<Option<String>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.map(describe_status)),
            None => Ok(None),
        }
    }

    /// Waits up to `grace` for the child to exit, then kills it.
    pub fn shutdown(mut self, grace: Duration) -> io::Result<ChildExit> {
        let Some(mut child) = self.child.take() else {
            return Ok(ChildExit {
                status: "unknown".to_string(),
                killed: false,
            });
        };

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(ChildExit {
                    status: describe_status(status),
                    killed: false,
                });
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "child still running, killing");
        if let Err(e) = child.kill() {
            // InvalidInput: it exited between the last poll and the kill
            if e.kind() != io::ErrorKind::InvalidInput {
                return Err(e);
            }
        }
        let status = child.wait()?;
        Ok(ChildExit {
            status: describe_status(status),
            killed: true,
        })
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
