#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary, stdout/stderr is the UI

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use dex_core::tools::ToolTable;
use dex_core::{PlanTier, ScopeKey};
use dex_gateway::config::Config;
use dex_gateway::tier::TierTable;
use dex_gateway::{Gateway, tracing_setup};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let console_log = matches!(cli.command, Commands::Check | Commands::Version);
    let _tracing_guard = tracing_setup::init(console_log);

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "dex starting");

    match cli.command {
        Commands::Check => cmd_check(cli.config.as_deref()),
        Commands::Chat {
            user,
            tenant,
            channel,
            chat,
            plan,
        } => {
            let scope = ScopeKey::new(tenant, channel, chat);
            cmd_chat(cli.config.as_deref(), &user, &scope, &PlanTier::new(plan)).await
        }
        Commands::Spin { tenant, text } => cmd_spin(cli.config.as_deref(), &tenant, &text).await,
        Commands::Version => {
            println!("dex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(explicit: Option<&str>) -> Result<Config> {
    let path = Config::find_config_path(explicit);
    if path.exists() {
        info!(path = %path.display(), "loading config");
        Config::load(&path)
    } else if explicit.is_some() {
        anyhow::bail!("config file not found: {}", path.display())
    } else {
        info!("no config file found, using defaults");
        Ok(Config::default())
    }
}

fn build_gateway(config_path: Option<&str>) -> Result<Gateway> {
    let config = load_config(config_path)?;
    // No tools ship with the binary; embedders register their own table.
    Gateway::from_config(&config, Arc::new(ToolTable::empty()))
}

// ---------------------------------------------------------------------------
// cmd_check: validate config without serving anything
// ---------------------------------------------------------------------------

fn cmd_check(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    let tiers = TierTable::new(&config.effective_tiers(), &config.gateway.default_tier)?;

    println!("config ok");
    println!("  backend:     {} ({})", config.backend.model, config.backend.base_url);
    println!("  credentials: {}", config.credentials.keys.join(", "));
    println!(
        "  tiers:       {} (default {})",
        tiers.tier_names().join(" < "),
        config.gateway.default_tier
    );
    println!(
        "  loop:        {} tool rounds, {}s tool timeout, {}s request timeout",
        config.gateway.max_tool_calls, config.gateway.tool_timeout_secs, config.gateway.timeout_secs
    );
    println!(
        "  memory:      summarize at {}, keep {}, summary cap {} chars, {} facts",
        config.memory.summarize_threshold,
        config.memory.history_prune_length,
        config.memory.max_summary_length,
        config.memory.max_facts
    );
    match &config.store.dir {
        Some(dir) => println!("  store:       {dir}"),
        None => println!("  store:       in memory"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cmd_chat: line-based conversation through Gateway::respond
// ---------------------------------------------------------------------------

async fn cmd_chat(
    config_path: Option<&str>,
    user: &str,
    scope: &ScopeKey,
    plan: &PlanTier,
) -> Result<()> {
    let gateway = build_gateway(config_path)?;
    println!("dex chat as {user} in {scope} on plan {plan}. Ctrl-D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout()).context("failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            println!();
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match gateway.respond(user, scope, &line, plan).await {
            Ok(reply) => println!("{}", reply.text),
            Err(e) => {
                tracing::warn!(error = %e, "respond failed");
                eprintln!("{}", e.user_message());
            }
        }
    }

    let stats = gateway.client().pool().stats();
    info!(
        healthy = stats.healthy,
        cooling = stats.cooling,
        unhealthy = stats.unhealthy,
        revoked = stats.revoked,
        "chat finished"
    );
    Ok(())
}

async fn cmd_spin(config_path: Option<&str>, tenant: &str, text: &str) -> Result<()> {
    let gateway = build_gateway(config_path)?;
    println!("{}", gateway.spin_message(text, tenant).await);
    Ok(())
}
