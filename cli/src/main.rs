use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use kirogate_gateway::GatewayConfig;
use tracing_subscriber::EnvFilter;

/// kirogate: a subprocess-pool gateway fronting stateful local agent
/// processes behind an OpenAI-compatible HTTP/streaming surface.
#[derive(Debug, Parser)]
#[command(name = "kirogate", version, about)]
struct Cli {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "KIROGATE_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to bind the HTTP listener on.
    #[arg(long, env = "KIROGATE_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to the agent binary spawned per session.
    #[arg(long, env = "KIROGATE_KIRO_BIN", default_value = "kiro")]
    kiro_bin: PathBuf,

    /// Subcommand passed to the agent binary (e.g. `agent`).
    #[arg(long, env = "KIROGATE_KIRO_SUBCOMMAND", default_value = "agent")]
    kiro_subcommand: String,

    /// Extra arguments passed to every spawned agent process.
    #[arg(long = "kiro-args", env = "KIROGATE_KIRO_ARGS", value_delimiter = ' ')]
    kiro_args: Vec<String>,

    /// Working directory for spawned agent processes, absent a route override.
    #[arg(long, env = "KIROGATE_CWD", default_value = ".")]
    cwd: PathBuf,

    /// Idle timeout (seconds) before a session's agent subprocess is reaped.
    #[arg(long, env = "KIROGATE_IDLE_SECS", default_value_t = 1800)]
    idle_secs: u64,

    /// Path to a JSON channel→session-override route table.
    #[arg(long, env = "KIROGATE_ROUTES")]
    routes: Option<PathBuf>,

    /// Increase log verbosity. Repeatable (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = GatewayConfig {
        host: cli.host,
        port: cli.port,
        agent_bin: cli.kiro_bin,
        agent_subcommand: cli.kiro_subcommand,
        agent_args: cli.kiro_args,
        cwd: cli.cwd,
        idle_secs: cli.idle_secs,
        routes_path: cli.routes,
    };

    kirogate_gateway::lifecycle::run(config).await
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
