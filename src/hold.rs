//! Cancellable partition hold.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How the hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HoldOutcome {
    /// The full duration passed.
    Elapsed,
    /// Cancelled before the deadline.
    Cancelled {
        #[serde(with = "humantime_serde")]
        remaining: Duration,
    },
    /// Never started because installation was interrupted.
    Skipped,
}

/// Wait `duration` unless `cancel` fires first.
///
/// No work happens while waiting. A token that already fired returns at once.
pub async fn hold(duration: Duration, cancel: &CancellationToken) -> HoldOutcome {
    if cancel.is_cancelled() {
        warn!("Hold cancelled before it started");
        return HoldOutcome::Cancelled {
            remaining: duration,
        };
    }

    info!(
        duration = %humantime::format_duration(duration),
        "Holding availability zone partition"
    );
    // tokio clamps far-future sleeps; `Instant + duration` would overflow.
    let start = Instant::now();
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let remaining = duration.saturating_sub(start.elapsed());
            warn!(
                remaining = %humantime::format_duration(remaining),
                "Hold cancelled, restoring early"
            );
            HoldOutcome::Cancelled { remaining }
        }
        _ = &mut sleep => {
            info!("Hold elapsed");
            HoldOutcome::Elapsed
        }
    }
}
