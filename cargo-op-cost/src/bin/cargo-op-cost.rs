//! Cargo subcommand: `cargo op-cost`
//!
//! Usage:
//!   cargo op-cost profile --zoo simple-convnet --format md
//!   cargo op-cost replay trace.json --config op-cost.json

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use op_cost::engine::{Executor, Replay};
use op_cost::export::{write_report, ReportFormat};
use op_cost::ir::Model;
use op_cost::{zoo, InterceptionSession, SessionConfig};

fn main() {
    env_logger::init();

    // When invoked as `cargo op-cost`, cargo passes "op-cost" as argv[1]. Strip it.
    let args: Vec<String> = std::env::args().collect();
    let args = if args.get(1).map(|s| s.as_str()) == Some("op-cost") {
        &args[2..]
    } else {
        &args[1..]
    };

    match args.first().map(|s| s.as_str()) {
        Some("profile") => cmd_profile(&args[1..]),
        Some("replay") => cmd_replay(&args[1..]),
        Some("--help") | Some("-h") | None => print_usage(),
        Some(other) => {
            eprintln!("error: unknown subcommand '{other}'");
            eprintln!();
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("cargo op-cost: theoretical FLOP and memory-traffic accounting");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  cargo op-cost profile (--zoo <name> | <model.json>) [--config <file>] [--format <fmt>] [--train]");
    eprintln!("  cargo op-cost replay <trace.json> [--config <file>] [--format <fmt>]");
    eprintln!();
    eprintln!("Subcommands:");
    eprintln!("  profile   Run a model on the reference executor and cost every op");
    eprintln!("  replay    Cost a recorded JSON event trace");
    eprintln!();
    eprintln!("Formats: table (default), csv, md, json");
    eprintln!("Zoo models: {}", zoo::MODEL_NAMES.join(", "));
}

/// Options shared by both subcommands.
#[derive(Default)]
struct Common {
    config: Option<PathBuf>,
    format: ReportFormat,
}

impl Common {
    /// Consume `args[*i]` (and its value) if it is a shared option.
    fn take(&mut self, args: &[String], i: &mut usize, usage: &str) -> bool {
        match args[*i].as_str() {
            "--config" | "-c" => {
                *i += 1;
                self.config = Some(PathBuf::from(value(args, *i, "--config", usage)));
                true
            }
            "--format" | "-f" => {
                *i += 1;
                let raw = value(args, *i, "--format", usage);
                self.format = raw.parse().unwrap_or_else(|err| {
                    eprintln!("error: {err}");
                    process::exit(1);
                });
                true
            }
            _ => false,
        }
    }

    fn session(&self) -> InterceptionSession {
        let config = match &self.config {
            Some(path) => SessionConfig::load(path).unwrap_or_else(|err| {
                eprintln!("error: {err}");
                process::exit(1);
            }),
            None => SessionConfig::default(),
        };
        InterceptionSession::with_config(config).unwrap_or_else(|err| {
            eprintln!("error: {err}");
            process::exit(1);
        })
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str, usage: &str) -> &'a str {
    args.get(i).map(|s| s.as_str()).unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        eprintln!("Usage: {usage}");
        process::exit(1);
    })
}

fn print_report(session: &InterceptionSession, format: ReportFormat) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(err) = write_report(&session.report(), format, &mut out).and_then(|_| {
        out.flush()?;
        Ok(())
    }) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// profile
// ---------------------------------------------------------------------------

fn cmd_profile(args: &[String]) {
    const USAGE: &str =
        "cargo op-cost profile (--zoo <name> | <model.json>) [--config <file>] [--format <fmt>] [--train]";

    let mut common = Common::default();
    let mut zoo_name: Option<String> = None;
    let mut model_path: Option<PathBuf> = None;
    let mut train = false;

    let mut i = 0;
    while i < args.len() {
        if common.take(args, &mut i, USAGE) {
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--zoo" => {
                i += 1;
                zoo_name = Some(value(args, i, "--zoo", USAGE).to_string());
            }
            "--train" => train = true,
            "--help" | "-h" => {
                eprintln!("Usage: {USAGE}");
                eprintln!();
                eprintln!("Run a model on the reference executor with a cost session active.");
                eprintln!("The input is a fixed ramp in [0, 1).");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --zoo <NAME>       Built-in model ({})", zoo::MODEL_NAMES.join(", "));
                eprintln!("  -c, --config <F>   Session configuration (JSON)");
                eprintln!("  -f, --format <F>   table, csv, md or json");
                eprintln!("  --train            Pass train=true to calculators");
                eprintln!();
                eprintln!("Environment:");
                eprintln!("  RUST_LOG=debug   Log every recorded entry");
                process::exit(0);
            }
            other if model_path.is_none() && !other.starts_with('-') => {
                model_path = Some(PathBuf::from(other));
            }
            other => {
                eprintln!("unexpected argument: {other}");
                eprintln!("Usage: {USAGE}");
                process::exit(1);
            }
        }
        i += 1;
    }

    let model = match (zoo_name, model_path) {
        (Some(name), None) => zoo::by_name(&name),
        (None, Some(path)) => Model::load(&path),
        _ => {
            eprintln!("error: give exactly one of --zoo <name> or <model.json>");
            eprintln!("Usage: {USAGE}");
            process::exit(1);
        }
    }
    .unwrap_or_else(|err| {
        eprintln!("error: {err}");
        process::exit(1);
    });

    let n = model.input_size().unwrap_or_else(|err| {
        eprintln!("error: {err}");
        process::exit(1);
    });
    let input: Vec<f32> = (0..n).map(|i| (i % 256) as f32 / 256.0).collect();

    let session = common.session();
    let mut exec = Executor::new().with_train(train);
    if let Err(err) = session.scope(&mut exec, |exec| exec.run(&model, &input)) {
        eprintln!("error: {err}");
        process::exit(1);
    }
    print_report(&session, common.format);
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

fn cmd_replay(args: &[String]) {
    const USAGE: &str = "cargo op-cost replay <trace.json> [--config <file>] [--format <fmt>]";

    let mut common = Common::default();
    let mut trace_path: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        if common.take(args, &mut i, USAGE) {
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--help" | "-h" => {
                eprintln!("Usage: {USAGE}");
                eprintln!();
                eprintln!("Cost a JSON array of recorded events:");
                eprintln!("  [{{\"op_type\": \"ReLU\", \"inputs\": [{{\"shape\": [4], \"dtype\": \"f32\"}}]}}]");
                process::exit(0);
            }
            other if trace_path.is_none() && !other.starts_with('-') => {
                trace_path = Some(PathBuf::from(other));
            }
            other => {
                eprintln!("unexpected argument: {other}");
                eprintln!("Usage: {USAGE}");
                process::exit(1);
            }
        }
        i += 1;
    }

    let trace_path = trace_path.unwrap_or_else(|| {
        eprintln!("Usage: {USAGE}");
        process::exit(1);
    });
    let mut replay = Replay::load(&trace_path).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        process::exit(1);
    });

    let session = common.session();
    if let Err(err) = session.scope(&mut replay, |replay| replay.run()) {
        // Entries recorded before the failure are still worth showing.
        eprintln!("error: {err}");
        print_report(&session, common.format);
        process::exit(1);
    }
    print_report(&session, common.format);
}
