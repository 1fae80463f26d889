mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cronflow", about = "Cron job orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and the HTTP/WebSocket server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a job once in the foreground and print its output
    Run {
        /// Job ID
        job: String,

        /// Option override as name=value (repeatable)
        #[arg(short = 'o', long = "option", value_parser = commands::parse_override)]
        options: Vec<(String, String)>,
    },
    /// List configured jobs
    Jobs,
    /// Show recent executions
    History {
        /// Only show executions of this job
        #[arg(long)]
        job: Option<String>,

        /// Maximum number of records
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Validate a cron expression and show its next fire times
    CheckCron {
        /// 5-field cron expression, quoted
        expression: String,
    },
    /// Check configuration and storage
    Health,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let config = cronflow_config::load_config()?;
                cronflow_gateway::start_gateway(config, port).await
            })?;
        }
        Commands::Run { job, options } => {
            let rt = tokio::runtime::Runtime::new()?;
            let succeeded = rt.block_on(commands::run_job(&job, options))?;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Jobs => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::list_jobs())?;
        }
        Commands::History { job, limit } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::history(job.as_deref(), limit))?;
        }
        Commands::CheckCron { expression } => {
            commands::check_cron(&expression)?;
        }
        Commands::Health => {
            println!("cronflow is healthy");
            let config = cronflow_config::load_config()?;
            println!("  config file: {}", cronflow_config::config_file_path()?.display());
            println!("  database: {}", config.database_path()?.display());
            println!("  listen: {}:{}", config.server.host, config.server.port);
            println!(
                "  auth: {}",
                if config.server.auth_token.is_some() { "token" } else { "open" }
            );
            println!(
                "  notifications: {}",
                if config.notifications.webhook_url.is_some() { "webhook" } else { "off" }
            );
            match &config.vault.path {
                Some(path) => println!("  vault: {}", path.display()),
                None => println!("  vault: not configured"),
            }
        }
    }

    Ok(())
}
