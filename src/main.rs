//! Purpose: `sodepot` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits results on stdout.
//! Invariants: Commands emit stable stdout formats (human or JSON by flag).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All provisioning-directory mutation goes through `api::synchronize`.
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use sodepot::api::{
    AbiOrder, Dlopen, DirectorySource, Error, ErrorKind, LoadFlags, LoadOutcome, LoaderContext,
    PackageArchive, UnpackedPackage, embedded_descriptors, read_dependencies, synchronize,
    to_exit_code, tree_descriptors,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(err.to_string()));
            }
        },
    };

    match cli.command {
        Command::Deps { file, json } => run_deps(&file, json),
        Command::Sync {
            dest,
            sideload,
            package,
            abi,
        } => run_sync(&dest, sideload.as_deref(), package.as_deref(), abi),
        Command::Status { dir, json } => run_status(&dir, json),
        Command::Check { dir, names } => run_check(&dir, &names),
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "sodepot", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
    }
}

#[derive(Parser)]
#[command(
    name = "sodepot",
    version,
    about = "Provision and load native shared libraries",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print the declared runtime dependencies of a shared object")]
    Deps {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, help = "Emit one JSON object instead of one name per line")]
        json: bool,
    },
    #[command(about = "Synchronize an extraction directory against a library source")]
    Sync {
        #[arg(value_hint = ValueHint::DirPath)]
        dest: PathBuf,
        #[arg(
            long,
            value_hint = ValueHint::DirPath,
            help = "Sideload tree root (one subdirectory per ABI with a manifest)"
        )]
        sideload: Option<PathBuf>,
        #[arg(
            long,
            value_hint = ValueHint::DirPath,
            help = "Unpacked package root (libraries under lib/<abi>/)"
        )]
        package: Option<PathBuf>,
        #[arg(
            long,
            help = "Supported ABI tag, most preferred first (default: host order)"
        )]
        abi: Vec<String>,
    },
    #[command(about = "Show the contents of an extraction directory")]
    Status {
        #[arg(value_hint = ValueHint::DirPath)]
        dir: PathBuf,
        #[arg(long, help = "Emit one JSON object instead of a table")]
        json: bool,
    },
    #[command(about = "Load libraries from a directory, resolving dependencies")]
    Check {
        #[arg(value_hint = ValueHint::DirPath)]
        dir: PathBuf,
        #[arg(required = true)]
        names: Vec<String>,
    },
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn run_deps(file: &Path, json: bool) -> Result<RunOutcome, Error> {
    let deps = read_dependencies(file)?;
    if json {
        let value = json!({
            "file": file.display().to_string(),
            "needed": deps,
        });
        println!("{value}");
    } else {
        for dep in deps {
            println!("{dep}");
        }
    }
    Ok(RunOutcome::ok())
}

fn run_sync(
    dest: &Path,
    sideload: Option<&Path>,
    package: Option<&Path>,
    abi: Vec<String>,
) -> Result<RunOutcome, Error> {
    let descriptors = match (sideload, package) {
        (Some(root), None) => tree_descriptors(root)?,
        (None, Some(root)) => {
            let archive: Arc<dyn PackageArchive> = Arc::new(UnpackedPackage::new(root));
            embedded_descriptors(&archive)?
        }
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("exactly one of --sideload or --package is required"));
        }
    };
    let order = if abi.is_empty() {
        AbiOrder::host()
    } else {
        AbiOrder::new(abi)
    };
    if order.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("no supported ABI tags"));
    }

    let stats = synchronize(dest, &descriptors, &order)?;
    let mut report = serde_json::to_value(stats).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("json encode failed")
            .with_source(err)
    })?;
    if let Value::Object(fields) = &mut report {
        fields.insert("dir".to_string(), json!(dest.display().to_string()));
    }
    println!("{report}");
    Ok(RunOutcome::ok())
}

fn run_status(dir: &Path, json: bool) -> Result<RunOutcome, Error> {
    let mut rows: Vec<(String, u64, Option<SystemTime>)> = Vec::new();
    let entries = std::fs::read_dir(dir).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("cannot list directory")
            .with_path(dir)
            .with_source(err)
    })?;
    for entry in entries {
        let entry = entry.map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot list directory")
                .with_path(dir)
                .with_source(err)
        })?;
        let meta = entry.metadata().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot stat entry")
                .with_path(entry.path())
                .with_source(err)
        })?;
        rows.push((
            entry.file_name().to_string_lossy().into_owned(),
            meta.len(),
            meta.modified().ok(),
        ));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    if json {
        let libraries: Vec<Value> = rows
            .iter()
            .map(|(name, size, modified)| {
                json!({
                    "name": name,
                    "size": size,
                    "modified": modified.and_then(format_time),
                })
            })
            .collect();
        let value = json!({
            "dir": dir.display().to_string(),
            "libraries": libraries,
        });
        println!("{value}");
    } else {
        for (name, size, modified) in &rows {
            let time = modified
                .and_then(|time| format_time(time))
                .unwrap_or_else(|| "-".to_string());
            println!("{name}\t{size}\t{time}");
        }
    }
    Ok(RunOutcome::ok())
}

fn run_check(dir: &Path, names: &[String]) -> Result<RunOutcome, Error> {
    let context = LoaderContext::new(
        vec![Box::new(
            DirectorySource::new(dir).resolve_dependencies(true),
        )],
        Box::new(Dlopen),
    );
    for name in names {
        let outcome = context.load_library(name, LoadFlags::NONE)?;
        let label = match outcome {
            LoadOutcome::Loaded => "loaded",
            LoadOutcome::ImplicitlyProvided => "implicit",
            LoadOutcome::NotFound => "not-found",
        };
        println!("{name}\t{label}");
    }
    Ok(RunOutcome::ok())
}

fn format_time(time: SystemTime) -> Option<String> {
    use time::format_description::well_known::Rfc3339;

    let duration = time.duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {err}");
        return;
    }

    let value = error_json(err);
    let text = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Io\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{text}");
}

fn error_json(err: &Error) -> Value {
    let mut fields = serde_json::Map::new();
    fields.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    if let Some(message) = err.message() {
        fields.insert("message".to_string(), json!(message));
    }
    if let Some(library) = err.library() {
        fields.insert("library".to_string(), json!(library));
    }
    if let Some(path) = err.path() {
        fields.insert("path".to_string(), json!(path.display().to_string()));
    }
    json!({ "error": Value::Object(fields) })
}
