mod config;
mod control_http;
mod correlator;
mod line_buffer;
mod llm;
mod notifications;
mod protocol;
mod relay_server;
mod runtime;
mod transport;
mod worker;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "WebSocket relay and tool worker for the nutrIA assistant")]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true, env = "NUTRIA_CONFIG", default_value = "nutria.toml")]
    config: PathBuf,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "NUTRIA_LOG", default_value = "info")]
    log: String,

    /// Override the relay WebSocket bind address.
    #[arg(long, global = true)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the WebSocket relay and its tool worker.
    Serve,
    /// Run the tool worker over stdin/stdout.
    Worker,
    /// One-shot tool operations against a freshly started worker.
    Tools(ToolsArgs),
    /// Run non-interactive diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct ToolsArgs {
    #[command(subcommand)]
    command: ToolsSubcommand,
}

#[derive(Debug, Clone, Subcommand)]
enum ToolsSubcommand {
    /// List the tools the worker advertises.
    List {
        /// Emit output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Call one tool by name.
    Call(ToolCallArgs),
}

#[derive(Debug, Clone, Args)]
struct ToolCallArgs {
    /// Tool name, e.g. chat.
    #[arg(long)]
    name: String,
    /// Tool arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    args: String,
    /// Emit the raw tool result as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Environment facts gathered outside the report builder.
#[derive(Debug, Clone, Default)]
struct DoctorProbes {
    notifications_dir: Option<std::result::Result<(), String>>,
    worker_program: Option<std::result::Result<(PathBuf, bool), String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    match cli.command.clone().unwrap_or(CliCommand::Serve) {
        CliCommand::Serve => run_serve(&cli).await,
        CliCommand::Worker => run_worker(&cli).await,
        CliCommand::Tools(args) => run_tools_command(&cli, args).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref());
    Ok(cfg)
}

async fn run_serve(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let runtime = runtime::RelayRuntime::new(cfg, Some(cli.config.clone()))?;
    runtime.run().await
}

async fn run_worker(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    worker::run_stdio(&cfg).await
}

async fn run_tools_command(cli: &Cli, args: ToolsArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let call = match &args.command {
        ToolsSubcommand::List { .. } => None,
        ToolsSubcommand::Call(call) => Some((call.name.clone(), parse_tool_args(&call.args)?)),
    };

    let correlator = runtime::build_correlator(&cfg, Some(&cli.config))?;
    correlator
        .start()
        .await
        .context("failed starting tool worker")?;
    let outcome = match call {
        None => correlator.list_tools().await,
        Some((name, arguments)) => correlator.call_tool(&name, arguments).await,
    };
    correlator.stop().await;
    let result = outcome.map_err(|err| anyhow!("{err}"))?;

    match args.command {
        ToolsSubcommand::List { json: true } | ToolsSubcommand::Call(ToolCallArgs { json: true, .. }) => {
            print_json_value(&result)
        }
        ToolsSubcommand::List { json: false } => {
            for line in render_tool_list(&result) {
                println!("{line}");
            }
        }
        ToolsSubcommand::Call(_) => println!("{}", render_tool_text(&result)),
    }
    Ok(())
}

fn parse_tool_args(raw: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
    if !parsed.is_object() {
        return Err(anyhow!("--args must be a JSON object"));
    }
    Ok(parsed)
}

fn render_tool_list(result: &Value) -> Vec<String> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .map(|tool| {
                    format!(
                        "{}: {}",
                        tool.get("name").and_then(Value::as_str).unwrap_or("?"),
                        tool.get("description").and_then(Value::as_str).unwrap_or("")
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Joins the text parts of a tool result; falls back to raw JSON.
fn render_tool_text(result: &Value) -> String {
    let texts = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        return result.to_string();
    }
    texts.join("\n")
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

async fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| format!("{err:#}"));
    let mut probes = DoctorProbes::default();
    if let Ok(cfg) = config_result.as_ref() {
        probes.notifications_dir = Some(probe_writable_dir(&cfg.notifications.dir).await);
        probes.worker_program = Some(
            transport::ProcessLauncher::from_config(&cfg.worker, Some(config_path))
                .map(|launcher| {
                    let program = launcher.program().to_path_buf();
                    let resolvable = transport::program_resolvable(&program);
                    (program, resolvable)
                })
                .map_err(|err| format!("{err:#}")),
        );
    }
    let report = build_doctor_report(config_result, config_path, probes);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

async fn probe_writable_dir(dir: &Path) -> std::result::Result<(), String> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|err| format!("cannot create {}: {err}", dir.display()))?;
    let probe = dir.join(format!(".doctor-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|err| format!("cannot write {}: {err}", dir.display()))?;
    let _ = tokio::fs::remove_file(&probe).await;
    Ok(())
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    probes: DoctorProbes,
) -> DoctorReport {
    let mut checks = Vec::new();

    let config = match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: if config_path.exists() {
                    format!("loaded {}", config_path.display())
                } else {
                    format!("{} not found, using defaults", config_path.display())
                },
                detail: None,
            });
            Some(cfg)
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
            None
        }
    };

    if let Some(cfg) = config.as_ref() {
        let has_credential = cfg.llm.credential().is_some();
        checks.push(DoctorCheck {
            id: "llm.credential".to_owned(),
            status: if has_credential { "pass" } else { "warn" }.to_owned(),
            message: if has_credential {
                format!("credential configured for {}", cfg.llm.base_url)
            } else {
                "no LLM credential configured".to_owned()
            },
            detail: (!has_credential)
                .then(|| "worker will only advertise setup-required".to_owned()),
        });
    }

    if let Some(outcome) = probes.notifications_dir {
        let dir = config
            .as_ref()
            .map(|cfg| cfg.notifications.dir.display().to_string())
            .unwrap_or_default();
        checks.push(match outcome {
            Ok(()) => DoctorCheck {
                id: "notifications.dir".to_owned(),
                status: "pass".to_owned(),
                message: format!("{dir} is writable"),
                detail: None,
            },
            Err(err) => DoctorCheck {
                id: "notifications.dir".to_owned(),
                status: "warn".to_owned(),
                message: format!("{dir} is not writable"),
                detail: Some(format!("{err}; notifications fall back to the log")),
            },
        });
    }

    if let Some(outcome) = probes.worker_program {
        checks.push(match outcome {
            Ok((program, true)) => DoctorCheck {
                id: "worker.command".to_owned(),
                status: "pass".to_owned(),
                message: format!("{} is resolvable", program.display()),
                detail: None,
            },
            Ok((program, false)) => DoctorCheck {
                id: "worker.command".to_owned(),
                status: "fail".to_owned(),
                message: format!("{} is not resolvable", program.display()),
                detail: Some("set worker.command or NUTRIA_WORKER_COMMAND".to_owned()),
            },
            Err(err) => DoctorCheck {
                id: "worker.command".to_owned(),
                status: "fail".to_owned(),
                message: "worker command could not be determined".to_owned(),
                detail: Some(err),
            },
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

/// Logs always go to stderr: in the worker role stdout carries protocol lines.
fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
