use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use sqlfeed_runner::{ConfigOverrides, HarnessConfig, RunSummary};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sqlfeed",
    version,
    about = "Feeds SQL test units to an interactive database process and records its tagged replies"
)]
struct Cli {
    /// Data directory handed to the child; wiped and recreated on every run
    working_dir: PathBuf,
    /// Database executable, invoked as `<executable> <mode> <working_dir>`
    executable: PathBuf,
    /// Schema file, sent verbatim as the first unit
    schema: PathBuf,
    /// Test file, split into units at `(<n>)` markers
    tests: PathBuf,
    /// Result log, truncated at start
    output: PathBuf,
    /// YAML file with timing/mode/marker settings
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    tick_ms: Option<u64>,
    #[arg(long)]
    warmup_ms: Option<u64>,
    #[arg(long)]
    drain_ms: Option<u64>,
    #[arg(long)]
    grace_ms: Option<u64>,
    /// Mode keyword passed as the child's first argument
    #[arg(long)]
    mode: Option<String>,
    /// Regex separating units in the test file
    #[arg(long)]
    marker: Option<String>,
    #[arg(long)]
    json: bool,
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn flag_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            tick_ms: self.tick_ms,
            warmup_ms: self.warmup_ms,
            drain_ms: self.drain_ms,
            grace_ms: self.grace_ms,
            mode: self.mode.clone(),
            marker: self.marker.clone(),
        }
    }

    fn harness_config(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::new(
            &self.working_dir,
            &self.executable,
            &self.schema,
            &self.tests,
            &self.output,
        );
        if let Some(path) = &self.config {
            config.apply(&ConfigOverrides::load(path)?);
        }
        config.apply(&self.flag_overrides());
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = cli.json;
    match run_command(&cli) {
        Ok(summary) => {
            if json_mode {
                emit_json(&json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                }));
            } else {
                println!("Done");
                print_summary(&summary);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("run_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(cli: &Cli) -> Result<RunSummary> {
    let config = cli.harness_config()?;
    sqlfeed_runner::run(&config)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn summary_to_json(summary: &RunSummary) -> Value {
    serde_json::to_value(summary).unwrap_or_else(|e| {
        json!({ "run_id": summary.run_id, "serialization_error": e.to_string() })
    })
}

fn print_summary(summary: &RunSummary) {
    println!("run_id: {}", summary.run_id);
    println!("working_dir: {}", summary.working_dir);
    println!("result_log: {}", summary.result_log);
    println!("units_enqueued: {}", summary.units_enqueued);
    println!("units_delivered: {}", summary.units_delivered);
    println!("units_failed: {}", summary.units_failed);
    if summary.units_pending > 0 {
        println!("units_pending: {}", summary.units_pending);
    }
    println!("records: {}", summary.records);
    if let Some(lines) = summary.output_lines {
        println!("output_lines: {}", lines);
    }
    println!("child_exit: {}", summary.child_exit);
    if summary.child_killed {
        println!("child_killed: true");
    }
    println!("result_log_sha256: {}", summary.result_log_sha256);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ARGS: [&str; 6] = ["sqlfeed", "db", "./bin/db", "table.sql", "test.sql", "out.txt"];

    #[test]
    fn exactly_five_positionals_are_required() {
        assert!(Cli::try_parse_from(ARGS[..5].to_vec()).is_err());
        assert!(Cli::try_parse_from(ARGS).is_ok());
        let mut extra = ARGS.to_vec();
        extra.push("surplus");
        assert!(Cli::try_parse_from(extra).is_err());
    }

    #[test]
    fn positionals_map_onto_config_paths() {
        let cli = Cli::try_parse_from(ARGS).expect("parse");
        let config = cli.harness_config().expect("config");
        assert_eq!(config.working_dir, PathBuf::from("db"));
        assert_eq!(config.executable, PathBuf::from("./bin/db"));
        assert_eq!(config.schema_path, PathBuf::from("table.sql"));
        assert_eq!(config.test_path, PathBuf::from("test.sql"));
        assert_eq!(config.result_log, PathBuf::from("out.txt"));
        assert_eq!(config.timing.tick, Duration::from_secs(1));
    }

    #[test]
    fn flags_override_defaults() {
        let mut args = ARGS.to_vec();
        args.extend(["--tick-ms", "250", "--drain-ms", "500", "--mode", "bench", "--json"]);
        let cli = Cli::try_parse_from(args).expect("parse");
        assert!(cli.json);
        let config = cli.harness_config().expect("config");
        assert_eq!(config.timing.tick, Duration::from_millis(250));
        assert_eq!(config.timing.drain, Duration::from_millis(500));
        assert_eq!(config.timing.warmup, Duration::from_secs(1));
        assert_eq!(config.mode, "bench");
    }

    #[test]
    fn json_error_shape() {
        let value = json_error("run_failed", "boom".to_string(), json!({}));
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("run_failed"));
        assert_eq!(value["error"]["message"], json!("boom"));
    }
}
