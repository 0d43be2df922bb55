//! Pilot 命令行入口
//!
//! 两种模式：
//! - `--supervisor --supervisor-config=<json>`：清理守护进程（由 SupervisorHandle 派生）
//! - `pilot remote <op>`：通过流式协议在远程浏览器会话上执行单个操作，结果 JSON 写到 stdout

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use pilot::config::load_config;
use pilot::stream::{CallOptions, StreamProtocolClient};
use pilot::supervisor::{run_supervisor, SupervisorPayload};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "pilot", version, about = "Browser agent execution runtime")]
struct Cli {
    /// 以清理守护进程模式运行
    #[arg(long, hide = true)]
    supervisor: bool,

    #[arg(long, hide = true, requires = "supervisor")]
    supervisor_config: Option<String>,

    /// 额外的配置文件
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 在远程会话上执行单个操作
    Remote(RemoteArgs),
}

#[derive(Args, Debug)]
struct RemoteArgs {
    #[arg(value_enum)]
    op: RemoteOp,

    /// 会话 id；缺省时新建会话，结束后关闭
    #[arg(long)]
    session: Option<String>,

    #[arg(long)]
    instruction: Option<String>,

    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    bypass_cache: bool,

    #[arg(long)]
    max_steps: Option<u32>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RemoteOp {
    Act,
    Extract,
    Observe,
    Navigate,
    Agent,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pilot::observability::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // 守护进程模式下参数错误也不能以非零码退出
        Err(e) if std::env::args().any(|a| a == "--supervisor") => {
            tracing::error!("Invalid supervisor arguments: {}", e);
            return Ok(());
        }
        Err(e) => e.exit(),
    };

    if cli.supervisor {
        let Some(raw) = cli.supervisor_config.as_deref() else {
            tracing::error!("--supervisor requires --supervisor-config");
            return Ok(());
        };
        // 配置无效时无从清理，直接退出
        let payload: SupervisorPayload = match serde_json::from_str(raw) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Invalid supervisor config: {}", e);
                return Ok(());
            }
        };
        return run_supervisor(payload).await;
    }

    match cli.command {
        Some(Command::Remote(args)) => {
            let value = run_remote(cli.config, args).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    }
}

async fn run_remote(config_path: Option<PathBuf>, args: RemoteArgs) -> anyhow::Result<Value> {
    let config = load_config(config_path).context("Failed to load config")?;
    let client = StreamProtocolClient::new(&config.remote).context("Invalid remote settings")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!("Received Ctrl+C, cancelling remote call");
            ctrl_c.cancel();
        }
    });

    let (session_id, owned) = match args.session.clone() {
        Some(id) => (id, false),
        None => (
            client
                .start_session(&cancel)
                .await
                .context("Failed to start remote session")?,
            true,
        ),
    };

    let outcome = call_remote(&client, &session_id, &args, &cancel).await;
    if owned {
        if let Err(e) = client.end_session(&session_id).await {
            tracing::warn!(session_id = %session_id, "Failed to end remote session: {}", e);
        }
    }
    outcome
}

async fn call_remote(
    client: &StreamProtocolClient,
    session_id: &str,
    args: &RemoteArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<Value> {
    let options = CallOptions {
        bypass_cache: args.bypass_cache,
    };
    let instruction = args.instruction.as_deref();
    let value = match args.op {
        RemoteOp::Act => {
            let input = instruction.context("--instruction is required for act")?;
            serde_json::to_value(client.act(session_id, input, options, cancel).await?)?
        }
        RemoteOp::Extract => serde_json::to_value(
            client
                .extract(session_id, instruction, None, options, cancel)
                .await?,
        )?,
        RemoteOp::Observe => serde_json::to_value(
            client
                .observe(session_id, instruction, options, cancel)
                .await?,
        )?,
        RemoteOp::Navigate => {
            let url = args.url.as_deref().context("--url is required for navigate")?;
            client.navigate(session_id, url, cancel).await?
        }
        RemoteOp::Agent => {
            let instruction = instruction.context("--instruction is required for agent")?;
            serde_json::to_value(
                client
                    .execute_agent(session_id, instruction, args.max_steps, cancel)
                    .await?,
            )?
        }
    };
    Ok(value)
}
