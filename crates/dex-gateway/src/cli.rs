use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dex", version, about = "AI orchestration gateway for messaging bots")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Validate the config file and show what it resolves to.
    Check,
    /// Chat with the gateway from the terminal.
    Chat {
        #[arg(short, long, default_value = "local")]
        user: String,
        #[arg(long, default_value = "local")]
        tenant: String,
        #[arg(long, default_value = "terminal")]
        channel: String,
        #[arg(long, default_value = "main")]
        chat: String,
        /// Plan tier used for tool gating.
        #[arg(short, long, default_value = "starter")]
        plan: String,
    },
    /// Rewrite a message, keeping its {{placeholders}}.
    Spin {
        #[arg(long, default_value = "local")]
        tenant: String,
        text: String,
    },
    Version,
}
