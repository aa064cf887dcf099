use super::agent::DocumentStream;
use super::errors::AgentError;
use super::source::Inner;
use crate::prelude::{debug, info, warn};
use futures::StreamExt as _;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// How a session with the agent ended.
enum SessionEnd {
    Cancelled,
    Ended {
        error: AgentError,
        had_successful_update: bool,
    },
}

impl Inner {
    /// Owns write access to the cached document for the lifetime of the source.
    ///
    /// A failure of the first session before any document arrived is final.
    /// Once a document is held, sessions are re-opened with backoff and the last
    /// good document stays in place meanwhile.
    pub(super) async fn run_supervisor(&self, first: DocumentStream, cancel: CancellationToken) {
        let supervisor_id = fastrand::u64(..);
        debug!("Starting identity supervisor: id={supervisor_id}");

        let mut stream = first;
        let mut backoff = self.reconnect().min_backoff;

        loop {
            match self.consume(&mut stream, &cancel).await {
                SessionEnd::Cancelled => {
                    debug!("Cancellation signal received; stopping identity supervisor");
                    return;
                }
                SessionEnd::Ended {
                    error,
                    had_successful_update,
                } => {
                    if !self.has_document() {
                        warn!("Identity agent session failed before the first document: error={error}");
                        self.fail_initial(error);
                        return;
                    }
                    if had_successful_update {
                        backoff = self.reconnect().min_backoff;
                    }
                    warn!(
                        "Identity agent session ended; reconnecting: error={error}, backoff_ms={}",
                        backoff.as_millis()
                    );
                }
            }

            stream = loop {
                if sleep_or_cancel(&cancel, backoff).await {
                    return;
                }
                backoff = next_backoff(backoff, self.reconnect().max_backoff);

                match self.agent().connect().await {
                    Ok(stream) => {
                        info!("Reconnected to identity agent: id={supervisor_id}");
                        break stream;
                    }
                    Err(e) => {
                        debug!(
                            "Identity agent reconnect failed: error={e}, backoff_ms={}",
                            backoff.as_millis()
                        );
                    }
                }
            };
        }
    }

    async fn consume(&self, stream: &mut DocumentStream, cancel: &CancellationToken) -> SessionEnd {
        let mut had_successful_update = false;

        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                v = stream.next() => v,
            };

            match item {
                Some(Ok(document)) => {
                    let spiffe_id = document.spiffe_id().to_string();
                    let generation = self.apply_update(document);
                    had_successful_update = true;
                    info!("Identity document updated: spiffe_id={spiffe_id}, generation={generation}");
                }
                Some(Err(error)) => {
                    return SessionEnd::Ended {
                        error,
                        had_successful_update,
                    }
                }
                None => {
                    return SessionEnd::Ended {
                        error: AgentError::Disconnected,
                        had_successful_update,
                    }
                }
            }
        }
    }
}

/// Returns `true` if cancelled before `dur` elapsed.
pub(super) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Doubles `current`, clamps it to `max` and adds up to 10% jitter.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = cur.saturating_mul(2).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis(base.saturating_add(add).min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let max = Duration::from_secs(10);
        let next = next_backoff(Duration::from_millis(200), max);
        assert!(next >= Duration::from_millis(400) && next <= Duration::from_millis(440));

        assert_eq!(next_backoff(Duration::from_secs(8), max), max);
        assert_eq!(next_backoff(max, max), max);
    }

    #[test]
    fn zero_backoff_stays_zero() {
        assert_eq!(
            next_backoff(Duration::ZERO, Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn sleep_or_cancel_reports_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(sleep_or_cancel(&token, Duration::from_secs(60)).await);

        let token = CancellationToken::new();
        assert!(!sleep_or_cancel(&token, Duration::from_millis(1)).await);
    }
}
