mod download;
mod http_utils;
mod progress_reporter;
mod range_table;
mod relay;
mod resource;
mod serve;
mod sink;
#[cfg(test)]
mod test_support;
mod types;
mod upload;
mod worker;

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::LevelFilter;
use url::Url;

use download::{start_download, DownloadOptions, DownloadPreferences};
use relay::RelayMapping;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Skip TLS certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a file over parallel ranged requests
    Get {
        url: String,

        /// Output path (defaults to the URL's file name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of parallel workers
        #[arg(short = 'n', long, default_value_t = 4)]
        workers: usize,

        /// Retries per worker; negative retries forever
        #[arg(short, long, default_value_t = 3, allow_negative_numbers = true)]
        retries: i32,

        /// Bytes per streamed read
        #[arg(long, default_value_t = 32768)]
        chunk_size: usize,

        /// Keep each worker on its initial range only
        #[arg(long)]
        no_steal: bool,

        /// Download even if the local copy looks current
        #[arg(long)]
        force: bool,
    },

    /// Upload files to a transfer server
    Put {
        /// Upload endpoint, e.g. http://host:8080/upload
        server: String,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Serve a directory over HTTP and accept uploads into it
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        listen: SocketAddr,

        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },

    /// Map local ports to remote endpoints
    Relay {
        /// Mappings of the form LOCALPORT:HOST:PORT
        #[arg(required = true)]
        mappings: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();

    let multi = MultiProgress::new();
    let logger = simplelog::TermLogger::new(
        LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );
    LogWrapper::new(multi.clone(), logger).try_init()?;
    log::set_max_level(LevelFilter::Info);

    match args.command {
        Command::Get {
            url,
            output,
            workers,
            retries,
            chunk_size,
            no_steal,
            force,
        } => {
            let prefs = DownloadPreferences {
                url: Url::parse(&url)?,
                output,
                options: DownloadOptions {
                    worker_count: workers.max(1),
                    retry_limit: retries,
                    read_chunk_size: chunk_size,
                    enable_work_stealing: !no_steal,
                    insecure: args.insecure,
                    force,
                },
            };
            start_download(prefs, multi).await?;
        }
        Command::Put { server, files } => {
            let server = Url::parse(&server)?;
            for file in files {
                upload::upload_file(&server, &file, args.insecure).await?;
            }
        }
        Command::Serve { listen, path } => {
            serve::serve(listen, path).await?;
        }
        Command::Relay { mappings } => {
            let mappings = mappings
                .iter()
                .map(|m| m.parse::<RelayMapping>())
                .collect::<Result<Vec<_>, _>>()?;
            relay::run_relays(mappings).await?;
        }
    }

    Ok(())
}
