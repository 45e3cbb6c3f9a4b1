//! DComm agent binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dcomm_agent::{init_logging, Agent, AgentConfig, LogFormat, Unroutable};
use dcomm_core::DcommResult;

#[derive(Parser, Debug)]
#[command(name = "dcomm-agent", version, about = "Message-oriented agent that polls transports and runs protocols")]
struct Cli {
    /// Folder holding config.toml, the interaction store and the default queue
    #[arg(short, long)]
    folder: Option<PathBuf>,

    /// Human-readable name sent to peers
    #[arg(short, long)]
    label: Option<String>,

    /// Our public verification key
    #[arg(long)]
    verkey: Option<String>,

    /// Transport URI to poll; repeat for several
    #[arg(short, long = "endpoint")]
    endpoints: Vec<String>,

    /// What to do with messages no handler accepts
    #[arg(long, value_enum)]
    unroutable: Option<Unroutable>,

    /// Log filter, e.g. "info" or "dcomm_agent=debug"
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print a connection invitation and exit
    #[arg(long)]
    invite: bool,
}

impl Cli {
    fn into_config(self) -> DcommResult<(AgentConfig, bool)> {
        let mut config = AgentConfig::load(self.folder)?;
        if let Some(label) = self.label {
            config = config.with_label(label);
        }
        if let Some(verkey) = self.verkey {
            config = config.with_verkey(verkey);
        }
        if !self.endpoints.is_empty() {
            config = config.with_endpoints(self.endpoints);
        }
        if let Some(policy) = self.unroutable {
            config = config.with_unroutable(policy);
        }
        if let Some(level) = self.log_level {
            config = config.with_log_level(level);
        }
        if let Some(format) = self.log_format {
            config = config.with_log_format(format);
        }
        if let Some(file) = self.log_file {
            config = config.with_log_file(file);
        }
        config.validate()?;
        Ok((config, self.invite))
    }
}

#[tokio::main]
async fn main() -> DcommResult<()> {
    let (config, invite) = Cli::parse().into_config()?;
    init_logging(&config.logging, config.log_file_path().as_deref())?;

    let agent = Agent::new(config)?;

    if invite {
        let invitation = agent.invite()?;
        println!("{}", serde_json::to_string_pretty(&invitation)?);
        return Ok(());
    }

    tracing::info!(
        label = %agent.identity().label,
        folder = %agent.config().folder.display(),
        "Starting agent"
    );
    let protocols: Vec<String> = agent
        .handlers()
        .protocols()
        .iter()
        .map(|info| info.protocol.to_string())
        .collect();
    tracing::info!("Registered protocols: {:?}", protocols);

    let agent = Arc::new(agent);
    let token = agent.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            token.cancel();
        }
    });

    agent.run().await
}
