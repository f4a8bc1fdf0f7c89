mod spyglass;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "spyglass",
    version,
    about = "Spyglass - Minecraft server status API"
)]
struct Cli {
    /// Path to Spyglass config file (.yml/.yaml/.toml). If omitted, uses SPYGLASS_CONFIG;
    /// then auto-detects spyglass.yml > spyglass.yaml > spyglass.toml from CWD. A missing
    /// file is created with defaults.
    #[arg(long, env = "SPYGLASS_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    spyglass::run(cli.config).await
}
