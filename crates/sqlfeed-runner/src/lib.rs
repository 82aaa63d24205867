pub mod channel;
pub mod classify;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pacer;
pub mod queue;
pub mod segment;

pub use channel::{ChildExit, ChildSpec, LineSink, LineSource, SubprocessChannel};
pub use classify::{is_classified, Classifier, ClassifierReport, Recorder, SequenceCounter};
pub use config::{ConfigOverrides, HarnessConfig, Timing};
pub use error::{ChannelError, ConfigError};
pub use orchestrator::{load_units, prepare_working_dir, run, RunSummary};
pub use pacer::{Pacer, PacerReport};
pub use queue::{PendingQueue, TestUnit, UnitKind};
pub use segment::{segment_units, Segments, ANYWHERE_MARKER, DEFAULT_MARKER};
