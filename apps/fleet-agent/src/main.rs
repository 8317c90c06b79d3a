use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use fleet_protocol::{InstanceHealthCheck, RegisterRemoteRequest};
use fleet_runtime::CurrentStatus;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

mod client;
mod converge;
mod state;

use client::PlatformClient;
use converge::LocalInstance;
use state::{in_reboot_loop, AgentState, StateFile};

#[derive(Debug, Parser)]
#[command(
    name = "fleet-agent",
    version,
    about = "Reference remote agent: runs connector instances and reports their state"
)]
struct Args {
    #[arg(long, env = "FLEET_PLATFORM_URL", default_value = "http://127.0.0.1:8092")]
    platform_url: String,
    /// Remote id; when absent the platform assigns one and it is kept in the state file
    #[arg(long, env = "FLEET_REMOTE_ID")]
    remote_id: Option<String>,
    #[arg(long, env = "FLEET_AGENT_NAME", default_value = "fleet-agent")]
    name: String,
    #[arg(long, env = "FLEET_AGENT_PUBLIC_KEY", default_value = "")]
    public_key: String,
    #[arg(long, env = "FLEET_AGENT_TOKEN")]
    token: Option<String>,
    #[arg(long, env = "FLEET_POLL_INTERVAL_SECS", default_value_t = 15)]
    poll_interval_secs: u64,
    #[arg(long, env = "FLEET_AGENT_STATE", default_value = "fleet-agent-state.json")]
    state_file: PathBuf,
    /// Starts inside the window that count as a reboot loop
    #[arg(long, env = "FLEET_REBOOT_THRESHOLD", default_value_t = 3)]
    reboot_threshold: u32,
    #[arg(long, env = "FLEET_REBOOT_WINDOW_SECS", default_value_t = 300)]
    reboot_window_secs: i64,
    #[arg(long, default_value_t = 10)]
    http_timeout_secs: u64,
    /// Run a single poll and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

struct Agent {
    args: Args,
    client: PlatformClient,
    remote_id: String,
    state: AgentState,
    local: HashMap<String, LocalInstance>,
}

impl Agent {
    fn reboot_loop(&self) -> bool {
        in_reboot_loop(
            &self.state.starts,
            Utc::now(),
            self.args.reboot_threshold,
            chrono::Duration::seconds(self.args.reboot_window_secs.max(1)),
        )
    }

    async fn tick(&mut self) -> Result<()> {
        self.client
            .refresh_connectivity(&self.remote_id, Some(env!("CARGO_PKG_VERSION").to_string()))
            .await?;
        let list = self.client.managed_instances(&self.remote_id).await?;
        let now = Utc::now();
        let in_loop = self.reboot_loop();

        let mut seen = Vec::with_capacity(list.items.len());
        for item in &list.items {
            seen.push(item.id.clone());
            let out = converge::step(item, self.local.get(&item.id), now);
            if let Some(status) = out.report {
                if let Err(err) = self
                    .client
                    .update_status(&self.remote_id, &item.id, status)
                    .await
                {
                    warn!(target: "fleet::agent", instance = %item.id, error = %err, "status push failed");
                    continue;
                }
                info!(target: "fleet::agent", instance = %item.id, status = status.as_str(), "status reported");
            }
            if let Some(line) = out.log {
                if let Err(err) = self
                    .client
                    .push_logs(&self.remote_id, &item.id, vec![line])
                    .await
                {
                    warn!(target: "fleet::agent", instance = %item.id, error = %err, "log push failed");
                }
            }
            if out.local.status == CurrentStatus::Started {
                let health = InstanceHealthCheck {
                    restart_count: self.state.restart_count(),
                    started_at: out.local.started_at,
                    is_in_reboot_loop: in_loop,
                };
                if let Err(err) = self
                    .client
                    .push_health(&self.remote_id, &item.id, &health)
                    .await
                {
                    warn!(target: "fleet::agent", instance = %item.id, error = %err, "health push failed");
                }
            }
            self.local.insert(item.id.clone(), out.local);
        }

        // Instances deleted on the platform are forgotten locally.
        self.local.retain(|id, _| seen.contains(id));
        debug!(target: "fleet::agent", managed = self.local.len(), reboot_loop = in_loop, "poll complete");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fleet_otel::init();
    let args = Args::parse();

    let file = StateFile::new(&args.state_file);
    let mut state = file.record_start(Utc::now()).context("record agent start")?;
    info!(
        target: "fleet::agent",
        path = %file.path().display(),
        restarts = state.restart_count(),
        "agent start recorded"
    );

    let client = PlatformClient::new(
        &args.platform_url,
        args.token.clone(),
        Duration::from_secs(args.http_timeout_secs.max(1)),
    )?;
    let registration = client
        .register(&RegisterRemoteRequest {
            id: args.remote_id.clone().or_else(|| state.remote_id.clone()),
            name: args.name.clone(),
            public_key: args.public_key.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        })
        .await?;
    info!(target: "fleet::agent", remote = %registration.id, "registered with platform");
    if state.remote_id.as_deref() != Some(registration.id.as_str()) {
        state.remote_id = Some(registration.id.clone());
        file.save(&state)?;
    }

    let once = args.once;
    let every = Duration::from_secs(args.poll_interval_secs.max(1));
    let mut agent = Agent {
        args,
        client,
        remote_id: registration.id,
        state,
        local: HashMap::new(),
    };
    if agent.reboot_loop() {
        warn!(target: "fleet::agent", "restart history indicates a reboot loop");
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = agent.tick().await {
                    warn!(target: "fleet::agent", error = %err, "poll failed");
                }
                if once {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target: "fleet::agent", "shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
