//! Hostable selkie node.
//!
//! TigerStyle: Explicit bootstrap phases, explicit exit codes.
//!
//! Loads a node from the JSON configuration file, initializes tracing
//! (optionally into the node's log file), registers built-in behaviors,
//! bootstraps the configured services, and runs until interrupted. Exits
//! non-zero on fatal bootstrap failure.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use selkie_core::config::{parse_nodes, select_node};
use selkie_core::{Buffer, Message, NodeConfig};
use selkie_runtime::{Server, ServiceBehavior, ServiceContext};

/// selkie actor runtime node
#[derive(Parser, Debug)]
#[command(name = "selkie")]
#[command(about = "selkie actor runtime node")]
#[command(version)]
struct Cli {
    /// Node configuration file (JSON array of nodes)
    #[arg(short, long, default_value = "config.json")]
    config: std::path::PathBuf,

    /// Node id to run
    #[arg(short, long, default_value_t = 1)]
    sid: u16,
}

/// Built-in behavior echoing sessioned messages back to their sender
struct Echo;

#[async_trait(?Send)]
impl ServiceBehavior for Echo {
    async fn message(&self, ctx: &ServiceContext, msg: Message) -> selkie_core::Result<()> {
        if msg.session != 0 {
            ctx.response(msg.ptype, msg.sender, msg.session, Buffer::from(msg.bytes()));
        }
        Ok(())
    }
}

/// Substitute `#sid` and `#date` in the node's log path template
fn render_log_path(template: &str, sid: u16) -> String {
    template
        .replace("#sid", &sid.to_string())
        .replace("#date", &chrono::Local::now().format("%Y%m%d").to_string())
}

fn init_tracing(node: &NodeConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if node.log.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(());
    }

    let path = render_log_path(&node.log, node.sid);
    if let Some(parent) = std::path::Path::new(&path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log directory for {path}"))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {path}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let json = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading {}", cli.config.display()))?;
    let node = select_node(parse_nodes(&json)?, cli.sid)?;
    init_tracing(&node)?;

    let server = Server::builder(node)
        .behavior("echo", |_cfg| Ok(Box::new(Echo)))
        .build()?;

    if let Err(e) = server.bootstrap().await {
        error!(error = %e, "bootstrap failed");
        server.join().await?;
        return Err(e.into());
    }
    server.run().await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("selkie: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_log_path() {
        let rendered = render_log_path("logs/node-#sid-#date.log", 3);
        assert!(rendered.starts_with("logs/node-3-"));
        assert!(rendered.ends_with(".log"));
        assert!(!rendered.contains('#'));
    }
}
