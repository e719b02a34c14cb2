//! idgen master node executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use idgen::{
    logger_init, parsed_config, pf_error, pf_info, IdGenError, MasterConfig,
    MasterServer, StatusFlag,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Allocation RPC port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52700)]
    rpc_port: u16,

    /// Replication backup port standbys connect to.
    /// This port must be available at process launch.
    #[arg(short = 'k', long, default_value_t = 52701)]
    backup_port: u16,

    /// Master configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(IdGenError)` on any error.
    fn sanitize(&self) -> Result<(), IdGenError> {
        if self.rpc_port <= 1024 {
            Err(IdGenError::msg(format!("invalid rpc_port {}", self.rpc_port)))
        } else if self.backup_port <= 1024 {
            Err(IdGenError::msg(format!(
                "invalid backup_port {}",
                self.backup_port
            )))
        } else if self.rpc_port == self.backup_port {
            Err(IdGenError::msg(format!(
                "rpc_port == backup_port {}",
                self.rpc_port
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

/// Actual main function of idgen master.
fn master_main() -> Result<(), IdGenError> {
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
    let config = parsed_config!(config_str => MasterConfig;
                                store_path, max_unactive_secs,
                                sweep_interval_ms, accept_backoff_ms,
                                chunk_size, max_frame_len, max_msg_len,
                                compact_threshold)?;

    let rpc_addr = SocketAddr::new(args.bind_ip.into(), args.rpc_port);
    let backup_addr = SocketAddr::new(args.bind_ip.into(), args.backup_port);

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
            .thread_name("tokio-worker-master")
            .build()?;

        // enter tokio runtime, setup the master node, and serve until dead
        runtime.block_on(async move {
            let master = MasterServer::new_and_setup(
                rpc_addr,
                Some(backup_addr),
                config,
                status,
            )
            .await?;

            master.serve().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), IdGenError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of idgen master.
fn main() -> ExitCode {
    logger_init("master");

    if let Err(ref e) = master_main() {
        pf_error!("master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> Result<CliArgs, IdGenError> {
        Ok(CliArgs {
            bind_ip: "127.0.0.1".parse()?,
            rpc_port: 40000,
            backup_port: 40001,
            config: "".into(),
            threads: 2,
        })
    }

    #[test]
    fn sanitize_valid() -> Result<(), IdGenError> {
        assert_eq!(valid_args()?.sanitize(), Ok(()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_rpc_port() -> Result<(), IdGenError> {
        let args = CliArgs {
            rpc_port: 1023,
            ..valid_args()?
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_backup_port() -> Result<(), IdGenError> {
        let args = CliArgs {
            backup_port: 80,
            ..valid_args()?
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_same_ports() -> Result<(), IdGenError> {
        let args = CliArgs {
            backup_port: 40000,
            ..valid_args()?
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), IdGenError> {
        let args = CliArgs {
            threads: 1,
            ..valid_args()?
        };
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn config_overrides() -> Result<(), IdGenError> {
        let config_str = Some("store_path = '/var/lib/idgen.db'\nmax_unactive_secs = 30");
        let config = parsed_config!(config_str => MasterConfig;
                                    store_path, max_unactive_secs)?;
        assert_eq!(config.store_path, "/var/lib/idgen.db");
        assert_eq!(config.max_unactive_secs, 30);
        assert_eq!(config.sweep_interval_ms, MasterConfig::default().sweep_interval_ms);
        let bad = Some("no_such_key = 1");
        assert!(parsed_config!(bad => MasterConfig; store_path).is_err());
        Ok(())
    }
}
