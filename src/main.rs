use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Start the registry proxy (default)
    Serve,
    /// Check configuration for errors and unused options
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for all commands
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let settings = server::settings::Settings::new()?;
            server::run_server(settings).await
        }
        Commands::CheckConfig => {
            println!("Checking registry proxy configuration...");
            match server::settings::Settings::new() {
                Ok(settings) => {
                    println!("✓ Configuration is valid");
                    println!(
                        "  upstream: https://{}/v2/{}/",
                        settings.registry.host, settings.registry.repo_prefix
                    );
                    println!("  auth: {}", settings.auth.kind());
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["registry-proxy"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_check_config() {
        let cli = Cli::try_parse_from(["registry-proxy", "check-config"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
    }
}
