//! Poll-until-converged primitive
//!
//! [`wait_until_all`] has no deadline of its own: protocol rounds can take
//! arbitrarily long. Callers that need one use [`wait_until_all_within`].

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Re-test `predicate` on every member each tick until all of them satisfy
/// it on the same tick. A tick stops at the first member that fails.
pub async fn wait_until_all<'a, N, F, Fut>(nodes: &'a [N], mut predicate: F, poll: Duration)
where
    F: FnMut(&'a N) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut tick = 0u64;
    loop {
        tick += 1;
        let mut converged = true;
        for node in nodes {
            if !predicate(node).await {
                converged = false;
                break;
            }
        }
        if converged {
            debug!(tick, members = nodes.len(), "All members converged");
            return;
        }

        debug!(tick, ?poll, "Not converged yet");
        tokio::time::sleep(poll).await;
    }
}

/// [`wait_until_all`] on a ticker bounded by a deadline: the first probe
/// happens one `poll` after the call. Expiry is reported as
/// [`Error::Timeout`]
pub async fn wait_until_all_within<'a, N, F, Fut>(
    nodes: &'a [N],
    predicate: F,
    poll: Duration,
    deadline: Duration,
    what: &str,
) -> Result<()>
where
    F: FnMut(&'a N) -> Fut,
    Fut: Future<Output = bool>,
{
    let ticking = async {
        tokio::time::sleep(poll).await;
        wait_until_all(nodes, predicate, poll).await
    };
    tokio::time::timeout(deadline, ticking)
        .await
        .map_err(|_| Error::Timeout(format!("{what} after {deadline:?}")))
}
