use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use identity_server::config::{load_config_or_default, validate_config, ServerConfig};
use identity_server::registrar::{RegistrationOutcome, RegistrationRequest, SpireRegistrar};

#[derive(Parser)]
#[command(name = "identity-cli")]
#[command(about = "Workload registration and config checks for identity-server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this workload with a SPIRE server
    Register {
        /// Read service, domain and registrar settings from a config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Service name (overrides config)
        #[arg(long)]
        name: Option<String>,
        /// Trust domain (overrides config)
        #[arg(long)]
        domain: Option<String>,
        /// Workload selector, e.g. unix:uid:1000
        #[arg(long)]
        selector: Option<String>,
        /// SPIRE server API socket
        #[arg(long)]
        socket_path: Option<String>,
        /// spire-server binary
        #[arg(long)]
        server_path: Option<String>,
    },
    /// Validate a config file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
        /// Print validation errors as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Register {
            config,
            name,
            domain,
            selector,
            socket_path,
            server_path,
        } => {
            register(
                config,
                Overrides {
                    name,
                    domain,
                    selector,
                    socket_path,
                    server_path,
                },
            )
            .await
        }
        Commands::Validate { config, json } => validate(config, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

struct Overrides {
    name: Option<String>,
    domain: Option<String>,
    selector: Option<String>,
    socket_path: Option<String>,
    server_path: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(name) = self.name {
            config.service.name = name;
        }
        if let Some(domain) = self.domain {
            config.service.domain = domain;
        }
        if let Some(selector) = self.selector {
            config.registrar.selector = Some(selector);
        }
        if let Some(socket_path) = self.socket_path {
            config.registrar.socket_path = socket_path;
        }
        if let Some(server_path) = self.server_path {
            config.registrar.server_path = server_path;
        }
    }
}

async fn register(config: Option<PathBuf>, overrides: Overrides) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config_or_default(config.as_deref())?;
    let socket_override = overrides.socket_path.clone();
    overrides.apply(&mut config);

    let request = RegistrationRequest::from_config(&config)?;
    let registrar = match socket_override {
        // An explicit flag beats SPIRE_SOCKET_PATH.
        Some(socket) => SpireRegistrar::new(config.registrar.server_path.clone(), socket)?,
        None => SpireRegistrar::from_config(&config.registrar)?,
    };

    let spiffe_id = request.spiffe_id()?;
    match registrar.register(&request).await? {
        RegistrationOutcome::Created => println!("Registered {spiffe_id} with SPIRE server"),
        RegistrationOutcome::AlreadyExists => println!("{spiffe_id} is already registered"),
    }
    Ok(())
}

fn validate(path: PathBuf, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(&path)?;
    let config: ServerConfig = toml::from_str(&content)?;

    match validate_config(&config) {
        Ok(()) => {
            if json {
                println!("{}", serde_json::json!({ "valid": true, "errors": [] }));
            } else {
                println!("{} is valid", path.display());
            }
            Ok(())
        }
        Err(errors) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "valid": false, "errors": errors }))?
                );
            } else {
                for error in &errors {
                    eprintln!("  {error}");
                }
            }
            Err(format!("{} has {} invalid value(s)", path.display(), errors.len()).into())
        }
    }
}
