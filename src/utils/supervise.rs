//! Task supervision: respawn a worker after a fault, with a fixed backoff.

use std::future::Future;

use tokio::time::{self, Duration};

use crate::utils::{IdGenError, StatusFlag};

/// Runs the worker produced by `make_worker` as a spawned task, again and
/// again. Whenever a worker returns an error or panics, the fault is logged,
/// the supervisor sleeps `backoff`, then spawns a fresh worker. Returns
/// `Ok(())` once a worker finishes successfully or `status` turns DEAD (in
/// which case the current worker is aborted).
pub async fn supervise<F, Fut>(
    name: &str,
    backoff: Duration,
    status: &StatusFlag,
    mut make_worker: F,
) -> Result<(), IdGenError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), IdGenError>> + Send + 'static,
{
    if backoff.is_zero() {
        return logged_err!("invalid {} restart backoff {:?}", name, backoff);
    }

    let mut restarts: u64 = 0;
    loop {
        if status.is_dead() {
            return Ok(());
        }
        pf_debug!("starting {} (restarts {})", name, restarts);

        let mut worker = tokio::spawn(make_worker());
        tokio::select! {
            joined = &mut worker => match joined {
                Ok(Ok(())) => {
                    pf_debug!("{} finished", name);
                    return Ok(());
                }
                Ok(Err(e)) => pf_warn!("{} failed: {}", name, e),
                Err(e) => pf_error!("{} crashed: {}", name, e),
            },

            _ = status.wait_dead() => {
                worker.abort();
                pf_debug!("{} stopped on status dead", name);
                return Ok(());
            }
        }

        restarts += 1;
        tokio::select! {
            _ = time::sleep(backoff) => {},
            _ = status.wait_dead() => return Ok(()),
        }
    }
}
