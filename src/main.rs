use clap::{Args, Parser, Subcommand};
use pod_harvest::config::AppConfig;
use pod_harvest::http::{self, ServerState};
use pod_harvest::records::{parse_deletes, split_collection};
use pod_harvest::{
    DumpReport, DumpScheduler, HarvestError, OaiEngine, Repository, Result, StreamId, UploadInput,
};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Versioned MARC record dumps, harvestable over OAI-PMH
#[derive(Parser, Debug)]
#[command(name = "pod-harvest")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repository directory, overriding the configuration file
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve OAI-PMH and run scheduled delta dumps
    Serve {
        /// Listen address, overriding the configuration file
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Create a stream for an organization
    CreateStream {
        #[arg(long)]
        organization: String,

        #[arg(long, default_value = "")]
        name: String,
    },

    /// Make a stream its organization's default
    MakeDefault {
        #[arg(long)]
        stream: u64,
    },

    /// List streams
    Streams,

    /// Store an upload for a stream
    Ingest(IngestArgs),

    /// Append a delta dump (every active stream unless one is given)
    Dump {
        #[arg(long)]
        stream: Option<u64>,
    },

    /// Start a new dump chain with a full dump
    FullDump {
        #[arg(long)]
        stream: u64,
    },

    /// Print repository statistics
    Stats,
}

#[derive(Args, Debug)]
struct IngestArgs {
    #[arg(long)]
    stream: u64,

    /// MARC-XML file of records to add or replace
    #[arg(long, required_unless_present = "deletes", conflicts_with = "deletes")]
    marcxml: Option<PathBuf>,

    /// File of record keys to delete, one per line
    #[arg(long)]
    deletes: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data) = cli.data {
        config.repository.path = data;
    }

    let repository = Arc::new(Repository::open_or_create(config.repository.clone())?);

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(repository, config).await
        }
        Command::CreateStream { organization, name } => {
            let stream = repository.create_stream(&organization, &name)?;
            println!("{}\t{}\t{}", stream.id, stream.organization, stream.display_name());
            Ok(())
        }
        Command::MakeDefault { stream } => {
            let stream = repository.make_default(StreamId(stream))?;
            println!("{}\t{}\tdefault", stream.id, stream.organization);
            Ok(())
        }
        Command::Streams => {
            for stream in repository.streams() {
                let last_upload = repository
                    .latest_upload_at(stream.id)
                    .map(|at| at.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{:?}\t{}{}",
                    stream.id,
                    stream.organization,
                    stream.display_name(),
                    stream.status,
                    last_upload,
                    if stream.default { "\tdefault" } else { "" }
                );
            }
            Ok(())
        }
        Command::Ingest(args) => {
            let input = match (&args.marcxml, &args.deletes) {
                (Some(path), _) => {
                    UploadInput::Records(split_collection(&fs::read_to_string(path)?)?)
                }
                (None, Some(path)) => {
                    UploadInput::Deletes(parse_deletes(&fs::read_to_string(path)?))
                }
                (None, None) => {
                    return Err(HarvestError::Config("nothing to ingest".into()));
                }
            };
            let upload = repository.ingest(StreamId(args.stream), input)?;
            println!("{:?}\t{} entries", upload.id, upload.len());
            Ok(())
        }
        Command::Dump { stream: Some(stream) } => {
            print_report(&repository.compute_delta(StreamId(stream))?);
            Ok(())
        }
        Command::Dump { stream: None } => {
            for stream in repository.active_streams() {
                print_report(&repository.compute_delta(stream.id)?);
            }
            Ok(())
        }
        Command::FullDump { stream } => {
            print_report(&repository.generate_full_dump(StreamId(stream))?);
            Ok(())
        }
        Command::Stats => {
            let stats = repository.stats()?;
            println!("streams:     {}", stats.stream_count);
            println!("uploads:     {}", stats.upload_count);
            println!("dumps:       {}", stats.dump_count);
            println!("attachments: {}", stats.attachment_count);
            println!("upload log:  {} bytes", stats.upload_log_bytes);
            Ok(())
        }
    }
}

async fn serve(repository: Arc<Repository>, config: AppConfig) -> Result<()> {
    let scheduler = Arc::new(DumpScheduler::start(
        Arc::clone(&repository),
        config.scheduler.clone(),
    )?);

    if config.delta_interval_secs > 0 {
        let scheduler = Arc::clone(&scheduler);
        let period = Duration::from_secs(config.delta_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let queued = scheduler.enqueue_all();
                info!(queued, "scheduled delta runs");
            }
        });
    }

    let state = ServerState {
        engine: Arc::new(OaiEngine::new(Arc::clone(&repository), config.oai.clone())),
        repository,
    };
    http::serve(state, &config.server).await
}

fn print_report(report: &DumpReport) {
    let dump = &report.dump;
    println!(
        "stream {}\tdump {}\t{:?}\t{} .. {}\t+{} -{}{}",
        dump.stream,
        dump.id,
        dump.kind,
        dump.window_start,
        dump.created_at,
        dump.addition_count(),
        dump.deletion_count(),
        if report.created { "" } else { "\t(unchanged)" }
    );
    for diagnostic in &report.diagnostics {
        println!("  skipped {}: {}", diagnostic.key, diagnostic.reason);
    }
}
