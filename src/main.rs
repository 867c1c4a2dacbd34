use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fluux_sandbox::sandbox::ErrorKind;
use fluux_sandbox::{
    AllowListPolicy, Config, ExecutionResult, LimitOverrides, SandboxRunner, SessionDirs, SessionId,
};

const DEFAULT_CONFIG_PATH: &str = "config/sandbox.toml";

/// Process exit codes
const EXIT_OK: u8 = 0;
const EXIT_CODE_FAILED: u8 = 1;
const EXIT_REJECTED: u8 = 2;
const EXIT_UNAVAILABLE: u8 = 3;

fn print_help() {
    println!(
        "\
fluux-sandbox v{}

Runs Python code behind an import allow-list, in a per-session working
directory, inside a throwaway Docker container.

USAGE:
    fluux-sandbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -s, --session <ID>      Session whose directory the code runs in
                            [default: a fresh random session]
    -f, --file <PATH>       Read the code from PATH instead of stdin
    -t, --timeout <SECS>    Override the wall-clock limit
        --network           Allow outbound network access
        --context <JSON>    Object whose keys become global variables
        --check             Only validate the imports, do not run
        --files             List the files of --session and exit
        --json              Print the result as JSON
    -h, --help              Print this help message and exit
    -V, --version           Print version and exit

EXIT STATUS:
    0    code ran and exited successfully
    1    code failed (non-zero exit or timeout)
    2    code rejected by the import allow-list, or syntax error
    3    sandbox unavailable (runtime, image, session directory, configuration)

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG       Log level filter for tracing
                   (e.g. debug, fluux_sandbox=debug,warn)
    DOCKER_HOST    Docker daemon to use (see docker(1))

EXAMPLES:
    echo 'print(6 * 7)' | fluux-sandbox
    fluux-sandbox --session s1 --file analysis.py
    fluux-sandbox --session s1 --files
    fluux-sandbox --check --file script.py /etc/fluux/sandbox.toml
    RUST_LOG=debug fluux-sandbox --json < script.py",
        env!("CARGO_PKG_VERSION"),
    );
}

/// What the command line asked for.
#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    config_path: Option<String>,
    session: Option<String>,
    file: Option<String>,
    timeout: Option<Duration>,
    network: bool,
    context: Option<serde_json::Map<String, serde_json::Value>>,
    check: bool,
    files: bool,
    json: bool,
    help: bool,
    version: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<CliOptions> {
    let mut opts = CliOptions::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => opts.help = true,
            "--version" | "-V" => opts.version = true,
            "--session" | "-s" => {
                opts.session = Some(args.next().ok_or_else(|| anyhow!("--session needs a value"))?)
            }
            "--file" | "-f" => {
                opts.file = Some(args.next().ok_or_else(|| anyhow!("--file needs a value"))?)
            }
            "--timeout" | "-t" => {
                let value = args.next().ok_or_else(|| anyhow!("--timeout needs a value"))?;
                let secs: u64 = value
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| anyhow!("--timeout must be a positive number of seconds"))?;
                opts.timeout = Some(Duration::from_secs(secs));
            }
            "--network" => opts.network = true,
            "--context" => {
                let value = args.next().ok_or_else(|| anyhow!("--context needs a value"))?;
                match serde_json::from_str(&value) {
                    Ok(serde_json::Value::Object(map)) => opts.context = Some(map),
                    _ => bail!("--context must be a JSON object"),
                }
            }
            "--check" => opts.check = true,
            "--files" => opts.files = true,
            "--json" => opts.json = true,
            other if other.starts_with('-') => bail!("unknown option: {other}"),
            other => {
                if opts.config_path.is_some() {
                    bail!("unexpected argument: {other}");
                }
                opts.config_path = Some(other.to_string());
            }
        }
    }

    if opts.files && opts.session.is_none() {
        bail!("--files needs --session");
    }
    Ok(opts)
}

/// Explicit paths must exist; the default one may be absent, in which
/// case built-in defaults apply.
fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(path).with_context(|| format!("cannot load {path}"))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("cannot load {DEFAULT_CONFIG_PATH}"))
        }
        None => {
            info!("No {DEFAULT_CONFIG_PATH}, using built-in defaults");
            Ok(Config::default())
        }
    }
}

fn read_source(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("cannot read {path}")),
        None => {
            let mut source = String::new();
            std::io::stdin()
                .read_to_string(&mut source)
                .context("cannot read code from stdin")?;
            Ok(source)
        }
    }
}

fn exit_code_for(result: &ExecutionResult) -> u8 {
    match result.error_kind {
        None => EXIT_OK,
        Some(ErrorKind::NonZeroExit) | Some(ErrorKind::Timeout) => EXIT_CODE_FAILED,
        Some(ErrorKind::RuntimeUnavailable) | Some(ErrorKind::Resource) => EXIT_UNAVAILABLE,
    }
}

/// Validate only: no runtime is needed.
fn check(config: &Config, source: &str, json: bool) -> Result<u8> {
    let policy = AllowListPolicy::from_config(&config.policy);
    let result = fluux_sandbox::validate(source, &policy);
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.is_valid {
        println!("OK");
    } else {
        println!("{}", result.message);
    }
    Ok(if result.is_valid { EXIT_OK } else { EXIT_REJECTED })
}

async fn list_files(config: &Config, session: &str, json: bool) -> Result<u8> {
    let sessions = SessionDirs::new(&config.sandbox.base_dir);
    let files = match sessions.list_files(session).await {
        Ok(files) => files,
        Err(e) => {
            error!("{e}");
            return Ok(EXIT_UNAVAILABLE);
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
    } else {
        for file in &files {
            let modified = file
                .modified
                .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!("{:>10}  {modified:19}  {}", file.size, file.path);
        }
    }
    Ok(EXIT_OK)
}

async fn execute(config: &Config, opts: &CliOptions, source: &str) -> Result<u8> {
    let runner = match SandboxRunner::from_config(config).await {
        Ok(runner) => runner,
        Err(e) => {
            error!("{e}");
            return Ok(EXIT_UNAVAILABLE);
        }
    };

    let session = match opts.session {
        Some(ref id) => id.clone(),
        None => SessionId::generate().to_string(),
    };
    let overrides = LimitOverrides {
        timeout: opts.timeout,
        network_enabled: opts.network.then_some(true),
        ..Default::default()
    };

    match runner
        .run_with_context(&session, source, &overrides, opts.context.clone())
        .await
    {
        Ok(result) => {
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
                if let Some(kind) = result.error_kind {
                    info!(session = %session, "Execution failed ({})", kind.as_str());
                }
            }
            Ok(exit_code_for(&result))
        }
        Err(rejection) => {
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&rejection.result)?);
            } else {
                println!("{}", rejection.message());
            }
            Ok(EXIT_REJECTED)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = match parse_args(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("fluux-sandbox: {e}\nTry --help.");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };
    if opts.version {
        println!("fluux-sandbox v{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    if opts.help {
        print_help();
        return ExitCode::SUCCESS;
    }

    // stdout carries the executed code's output only
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_sandbox=info")),
        )
        .init();

    match run(opts).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_UNAVAILABLE)
        }
    }
}

async fn run(opts: CliOptions) -> Result<u8> {
    let config = load_config(opts.config_path.as_deref())?;
    info!("Execution mode: {}", config.mode_description());

    if let Some(session) = opts.session.as_deref().filter(|_| opts.files) {
        return list_files(&config, session, opts.json).await;
    }

    let source = read_source(opts.file.as_deref())?;
    if opts.check {
        return check(&config, &source, opts.json);
    }
    execute(&config, &opts, &source).await
}
