//! idgen standby node executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use idgen::{
    logger_init, parsed_config, pf_error, pf_info, IdGenError, StandbyConfig,
    StandbyNode, StatusFlag,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master's replication backup address.
    #[arg(short, long)]
    master: SocketAddr,

    /// Standby configuration TOML string.
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

/// Actual main function of idgen standby.
fn standby_main() -> Result<(), IdGenError> {
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
    let config = parsed_config!(config_str => StandbyConfig;
                                replica_path, heartbeat_interval_ms,
                                sync_interval_ms, reconnect_backoff_ms,
                                max_frame_len)?;

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
            .thread_name("tokio-worker-standby")
            .build()?;

        // enter tokio runtime and keep the replica in sync until dead
        runtime.block_on(async move {
            let node = StandbyNode::new(args.master, config, status)?;
            node.run().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), IdGenError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of idgen standby.
fn main() -> ExitCode {
    logger_init("standby");

    if let Err(ref e) = standby_main() {
        pf_error!("standby_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
