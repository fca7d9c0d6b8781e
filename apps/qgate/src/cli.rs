use clap::Parser;

#[derive(Parser)]
#[command(name = "qgate", about = "Multi-tenant AI relay gateway")]
pub(crate) struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, default_value = "qgate.json")]
    pub(crate) config: String,
    /// Override the configured bind host.
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured bind port.
    #[arg(long)]
    pub(crate) port: Option<u16>,
}
