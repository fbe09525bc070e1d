use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ezoidc::engine::{Engine, ReadRequest, ReadResponse};
use ezoidc::models::JsonMap;
use ezoidc::Configuration;

#[derive(Parser)]
#[command(name = "ezoidc-server", about = "ezoidc server")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server.
    Start,
    /// Print the version.
    Version,
    /// Test the server configuration.
    #[command(subcommand)]
    Test(TestCommand),
}

#[derive(Subcommand)]
enum TestCommand {
    /// Allowed variables given the provided claims.
    Variables {
        /// Claims to use for the test, as JSON.
        #[arg(long, default_value = "{}")]
        claims: String,
        /// Params to use for the test, as JSON.
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Start) {
        Command::Version => {
            println!("ezoidc@{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Start => start(&cli.config).await,
        Command::Test(TestCommand::Variables { claims, params }) => {
            test_variables(&cli.config, &claims, &params)
        }
    }
}

async fn start(config_path: &str) -> anyhow::Result<()> {
    let mut config = Configuration::load(config_path)?;
    init_tracing(&config.log_level);

    config.preload_jwks().await?;

    let engine = Arc::new(Engine::new(Arc::new(config))?);
    ezoidc::serve(engine).await?;
    Ok(())
}

fn test_variables(config_path: &str, claims: &str, params: &str) -> anyhow::Result<()> {
    let config = Configuration::load(config_path)?;
    init_tracing(&config.log_level);

    let claims: JsonMap = serde_json::from_str(claims)?;
    let params: JsonMap = serde_json::from_str(params)?;

    let engine = Engine::new(Arc::new(config))?;
    let allowed = engine.allowed_variables(&ReadRequest {
        claims: Some(claims),
        params: Some(params),
    })?;

    let response = ReadResponse {
        variables: Vec::new(),
        allowed,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
