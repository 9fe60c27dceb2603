//! Purpose: `tether` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Client commands reach nodes only through `HttpTarget`.
#![allow(clippy::result_large_err)]
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use url::Url;

mod command_dispatch;

use tether::api::{
    CallEnvelope, CallKind, DEFAULT_ENV_KEY, Error, ErrorKind, ExecutionTarget, HttpTarget,
    NodeConfig, TOKEN_ENV, builtins, to_exit_code,
};
use tether::report::ReportConfig;
use tether::serve::{self, AccessMode, DEFAULT_BIND, ServeConfig};

const URL_ENV: &str = "TETHER_URL";
const REPORT_TOKEN_ENV: &str = "TETHER_REPORT_TOKEN";

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
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    dotenv::dotenv().ok();
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
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
                return Err((
                    Error::new(ErrorKind::Config)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `tether --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let connection = Connection {
        url: cli.url,
        token_file: cli.token_file,
    };
    command_dispatch::dispatch_command(cli.command, connection)
        .map_err(add_transport_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "tether",
    version,
    about = "Ship environments and function calls to remote nodes",
    long_about = None,
    after_help = r#"EXAMPLES
  $ tether serve --workdir ./node          # Terminal 1: run a node
  $ tether call tether echo '"hi"'         # Terminal 2: call a built-in
  $ tether put greeting '{"text":"hello"}' --env base
  $ tether keys --env base
  $ tether run 'uname -a'

LEARN MORE
  $ tether <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Node URL for client commands (default: $TETHER_URL or http://127.0.0.1:32300)"
    )]
    url: Option<String>,
    #[arg(
        long,
        global = true,
        value_hint = ValueHint::FilePath,
        help = "Read the bearer token from a file (default: $TETHER_TOKEN)"
    )]
    token_file: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

/// Where client commands send their requests.
struct Connection {
    url: Option<String>,
    token_file: Option<PathBuf>,
}

impl Connection {
    fn base_url(&self) -> String {
        self.url
            .clone()
            .or_else(|| std::env::var(URL_ENV).ok().filter(|url| !url.trim().is_empty()))
            .unwrap_or_else(|| format!("http://{DEFAULT_BIND}"))
    }

    fn token(&self) -> Result<Option<String>, Error> {
        if let Some(path) = &self.token_file {
            return read_token_file(path).map(Some);
        }
        Ok(std::env::var(TOKEN_ENV)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty()))
    }

    fn target(&self) -> Result<HttpTarget, Error> {
        let mut target = HttpTarget::new(self.base_url())?;
        if let Some(token) = self.token()? {
            target = target.with_token(token);
        }
        Ok(target)
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run a node: registry, RPC channel, and HTTP API")]
    Serve(ServeArgs),
    #[command(about = "Show the node's status snapshot")]
    Status,
    #[command(about = "List object keys in an environment partition")]
    Keys {
        #[arg(long, help = "Environment partition (default: the node's default env)")]
        env: Option<String>,
    },
    #[command(about = "Fetch one stored object")]
    Get {
        key: String,
        #[arg(long)]
        env: Option<String>,
    },
    #[command(about = "Store a JSON value under a key")]
    Put {
        key: String,
        #[arg(help = "JSON value; bare words are stored as strings")]
        value: String,
        #[arg(long)]
        env: Option<String>,
        #[arg(long = "type", help = "Resource type recorded with the value")]
        resource_type: Option<String>,
    },
    #[command(about = "Delete a key; deleting an environment drops its partition")]
    Delete { key: String },
    #[command(about = "Invoke module.function on the node")]
    Call(CallArgs),
    #[command(about = "Run shell commands on the node")]
    Run {
        #[arg(required = true, num_args = 1.., help = "Commands, run in order")]
        commands: Vec<String>,
        #[arg(long = "env-var", value_parser = parse_env_var, help = "NAME=VALUE for the commands")]
        env_vars: Vec<(String, String)>,
    },
    #[command(about = "Print version info")]
    Version,
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = DEFAULT_BIND, help = "Address to listen on")]
    bind: String,
    #[arg(long, value_hint = ValueHint::DirPath, help = "Node working directory (default: ~/.tether/workdir)")]
    workdir: Option<PathBuf>,
    #[arg(long, help = "Node name reported in status and tracebacks")]
    name: Option<String>,
    #[arg(long = "ip", help = "Reachable address of this node (repeatable)")]
    ips: Vec<String>,
    #[arg(long, default_value = DEFAULT_ENV_KEY, help = "Key of the default environment")]
    default_env: String,
    #[arg(long, help = "Command prefix used to install requirements")]
    installer: Option<String>,
    #[arg(long, help = "Bearer token for local/dev use (prefer --token-file)")]
    token: Option<String>,
    #[arg(long, value_enum, default_value = "read-write")]
    access: AccessModeCli,
    #[arg(long, help = "Allow binding to a non-loopback address")]
    allow_non_loopback: bool,
    #[arg(long, help = "Largest accepted request body in bytes")]
    max_body_bytes: Option<u64>,
    #[arg(long, help = "Collector URL that receives periodic status snapshots")]
    report_url: Option<String>,
    #[arg(long, default_value_t = 60, help = "Seconds between status reports")]
    report_interval_secs: u64,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AccessModeCli {
    ReadOnly,
    ReadWrite,
}

impl From<AccessModeCli> for AccessMode {
    fn from(value: AccessModeCli) -> Self {
        match value {
            AccessModeCli::ReadOnly => AccessMode::ReadOnly,
            AccessModeCli::ReadWrite => AccessMode::ReadWrite,
        }
    }
}

#[derive(Args)]
struct CallArgs {
    module: String,
    function: String,
    #[arg(help = "Positional arguments as JSON; bare words are passed as strings")]
    args: Vec<String>,
    #[arg(long = "kwarg", value_parser = parse_kwarg, help = "NAME=JSON keyword argument")]
    kwargs: Vec<(String, Value)>,
    #[arg(long, help = "Environment partition to run in")]
    env: Option<String>,
    #[arg(long, help = "Module directory relative to the node workdir")]
    path: Option<String>,
    #[arg(long, value_enum, default_value = "call")]
    kind: CallKindCli,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CallKindCli {
    Call,
    Repeat,
    Map,
    Starmap,
    Queue,
    Remote,
    Get,
}

impl From<CallKindCli> for CallKind {
    fn from(value: CallKindCli) -> Self {
        match value {
            CallKindCli::Call => CallKind::Call,
            CallKindCli::Repeat => CallKind::Repeat,
            CallKindCli::Map => CallKind::Map,
            CallKindCli::Starmap => CallKind::Starmap,
            CallKindCli::Queue => CallKind::Queue,
            CallKindCli::Remote => CallKind::Remote,
            CallKindCli::Get => CallKind::Get,
        }
    }
}

fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=JSON, got `{raw}`"))?;
    if name.is_empty() {
        return Err("keyword name must not be empty".to_string());
    }
    Ok((name.to_string(), parse_json_arg(value)))
}

fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))?;
    if name.is_empty() {
        return Err("variable name must not be empty".to_string());
    }
    Ok((name.to_string(), value.to_string()))
}

fn call_envelope(args: CallArgs) -> CallEnvelope {
    let positional = args.args.iter().map(|raw| parse_json_arg(raw)).collect();
    let kwargs: Map<String, Value> = args.kwargs.into_iter().collect();
    let mut envelope =
        CallEnvelope::new(args.module, args.function, args.kind.into()).with_args(positional, kwargs);
    envelope.env = args.env;
    envelope.relative_path = args.path;
    envelope
}

fn read_token_file(path: &Path) -> Result<String, Error> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Config)
            .with_message("failed to read token file")
            .with_path(path)
            .with_source(err)
    })?;
    let token = raw.trim().to_string();
    if token.is_empty() {
        return Err(Error::new(ErrorKind::Config)
            .with_message("token file is empty")
            .with_path(path));
    }
    Ok(token)
}

fn resolve_token_value(
    token: Option<String>,
    token_file: Option<PathBuf>,
) -> Result<Option<String>, Error> {
    if token.is_some() && token_file.is_some() {
        return Err(Error::new(ErrorKind::Config)
            .with_message("--token cannot be combined with --token-file")
            .with_hint("Use --token-file for safer handling, or pass --token for local/dev use."));
    }
    if let Some(path) = token_file {
        return read_token_file(&path).map(Some);
    }
    Ok(token)
}

fn serve_config_from_args(
    args: ServeArgs,
    token_file: Option<PathBuf>,
) -> Result<ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Config)
            .with_message(format!("invalid --bind address `{}`", args.bind))
            .with_hint("Use host:port, for example 127.0.0.1:32300.")
    })?;
    let token_file_used = token_file.is_some();
    let token = resolve_token_value(args.token, token_file)?;

    let mut node = NodeConfig::default();
    node.name = args.name.unwrap_or_else(|| {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| "tether-node".to_string())
    });
    node.ips = if args.ips.is_empty() {
        vec![bind.ip().to_string()]
    } else {
        args.ips
    };
    if let Some(workdir) = args.workdir {
        node.workdir = workdir;
    }
    node.default_env = args.default_env;
    if let Some(installer) = args.installer {
        node.installer = installer;
    }

    let mut config = ServeConfig::new(bind, node);
    config.token = token;
    config.token_file_used = token_file_used;
    config.access_mode = args.access.into();
    config.allow_non_loopback = args.allow_non_loopback;
    if let Some(max_body_bytes) = args.max_body_bytes {
        config.max_body_bytes = max_body_bytes;
    }
    if let Some(raw) = args.report_url {
        let url = Url::parse(&raw).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message(format!("invalid --report-url `{raw}`"))
                .with_source(err)
        })?;
        if args.report_interval_secs == 0 {
            return Err(Error::new(ErrorKind::Config)
                .with_message("--report-interval-secs must be greater than zero"));
        }
        let mut report = ReportConfig::new(url);
        report.interval = Duration::from_secs(args.report_interval_secs);
        report.token = std::env::var(REPORT_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty());
        config.report = Some(report);
    }
    Ok(config)
}

fn run_serve(config: ServeConfig) -> Result<(), Error> {
    serve::validate_config(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(serve::serve(config, builtins()))
}

fn run_commands(
    target: &HttpTarget,
    commands: &[String],
    env_vars: Vec<(String, String)>,
) -> Result<RunOutcome, Error> {
    let env_vars: BTreeMap<String, String> = env_vars.into_iter().collect();
    let outputs = target.run(commands, &env_vars, false)?;
    let exit_code = outputs
        .iter()
        .map(|output| output.code)
        .find(|code| *code != 0)
        .unwrap_or(0);
    let value = serde_json::to_value(&outputs).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode command output")
            .with_source(err)
    })?;
    emit_json(json!({ "outputs": value }));
    Ok(RunOutcome::with_code(exit_code))
}

fn add_transport_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Transport || err.hint().is_some() {
        return err;
    }
    err.with_hint("Is the node running? Start one with `tether serve` or pass --url.")
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("tether {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "tether",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    if let Some(exception) = err.exception() {
        return exception.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Config => "configuration error",
        ErrorKind::Capability => "not supported by this target",
        ErrorKind::NotFound => "not found",
        ErrorKind::AlreadyExists => "already exists",
        ErrorKind::Permission => "permission denied",
        ErrorKind::Install => "install failed",
        ErrorKind::Raised => "remote call raised",
        ErrorKind::Transport => "transport error",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().as_str()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(exception) = err.exception() {
        inner.insert("exception".to_string(), json!(exception));
    }
    if let Some(traceback) = err.traceback() {
        inner.insert("traceback".to_string(), json!(traceback));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(exception) = err.exception() {
        if err.message().is_some() {
            lines.push(format!(
                "{} {exception}",
                colorize_label("exception:", use_color, AnsiColor::Yellow)
            ));
        }
    }
    if let Some(traceback) = err.traceback() {
        lines.push(colorize_label("traceback:", use_color, AnsiColor::Yellow));
        lines.extend(traceback.lines().map(|line| format!("  {line}")));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
