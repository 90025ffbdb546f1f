mod soak;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use vkq_core::config::{default_config_path, VkqConfig};

#[derive(Parser)]
#[command(name = "vkq")]
#[command(about = "vkq - asynchronous Vulkan command submission engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// In-process driver with a simulated GPU signaling fences
    Simulated,
    /// Headless device on the system Vulkan driver
    Vulkan,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer the submission engine from several producer threads
    Soak {
        /// Producer threads, one serial index each
        #[arg(short, long, default_value_t = 4)]
        producers: u32,

        /// Batches submitted by each producer
        #[arg(short, long, default_value_t = 1000)]
        batches: u64,

        /// Submit on the producer threads instead of the worker thread
        #[arg(long)]
        sync: bool,

        /// Driver to submit to
        #[arg(long, value_enum, default_value_t = Backend::Simulated)]
        backend: Backend,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Print the effective configuration
    Config {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn load_config(path: Option<String>) -> VkqConfig {
    let path = path.unwrap_or_else(default_config_path);
    info!("using configuration from {}", path);
    VkqConfig::load_or_default(&path)
}

fn main() -> anyhow::Result<()> {
    vkq_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Soak {
            producers,
            batches,
            sync,
            backend,
            config,
        } => {
            let mut config = load_config(config);
            if sync {
                config.processor.async_command_queue = false;
            }
            config.validate()?;

            let report = soak::run(
                &config,
                soak::SoakOptions {
                    producers,
                    batches,
                    backend,
                },
            )?;

            println!("{}", report.summary());
            println!();
            println!("{}", toml::to_string(&report.perf)?);
        }

        Commands::Config { config } => {
            let config = load_config(config);
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
