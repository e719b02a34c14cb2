//! idgen allocation client executable: allocates IDs for a source and prints
//! them one per line.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use idgen::{
    logger_init, parsed_config, pf_error, pf_info, AllocClient, ClientConfig,
    IdGenError, StatusFlag,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master's allocation RPC address.
    #[arg(short, long)]
    master: SocketAddr,

    /// Allocation source to draw IDs for.
    #[arg(short, long)]
    source: String,

    /// Number of IDs to allocate; 0 only prints the persisted counter.
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u64,

    /// Client configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(IdGenError)` on any error.
    fn sanitize(&self) -> Result<(), IdGenError> {
        if self.master.port() == 0 {
            Err(IdGenError::msg(format!(
                "invalid master address {}",
                self.master
            )))
        } else if self.source.is_empty() {
            Err(IdGenError::msg("empty source name"))
        } else if self.threads < 2 {
            Err(IdGenError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of idgen client.
fn client_main() -> Result<(), IdGenError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };
    let config = parsed_config!(config_str => ClientConfig;
                                bucket_step, keepalive_interval_ms,
                                restart_backoff_ms)?;

    // set up termination signals handler
    let status = StatusFlag::new();
    let status_ref = status.clone();
    ctrlc::set_handler(move || {
        pf_info!("termination signal received");
        status_ref.mark_dead();
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-client")
            .build()?;

        // enter tokio runtime, connect to the master, and allocate
        runtime.block_on(async move {
            let client = AllocClient::new_and_setup(args.master, config).await?;
            let keepalive =
                tokio::spawn(client.clone().run_keepalive(status.clone()));

            if args.count == 0 {
                println!("{}", client.load_current_id(&args.source).await?);
            }
            for _ in 0..args.count {
                if status.is_dead() {
                    break;
                }
                println!("{}", client.next_id(&args.source).await?);
            }

            status.mark_dead();
            keepalive.await??;
            client.close().await;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), IdGenError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of idgen client.
fn main() -> ExitCode {
    logger_init("client");

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
