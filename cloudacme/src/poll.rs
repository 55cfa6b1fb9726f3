//! Deadline-bounded polling
//!
//! Both the challenge wait and the post-rotation TLS check are "probe every
//! interval until ready or out of time" loops. They share [`poll_until`].

use std::future::Future;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Ready(T),
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError<E> {
    /// The deadline elapsed before a probe came back ready.
    TimedOut { after: Duration },
    /// A probe failed in a way that polling again cannot fix.
    Aborted(E),
}

/// Run `probe` immediately and then once per `every` until it reports
/// [`Attempt::Ready`], returns an error, or `deadline` elapses.
///
/// Dropping the returned future stops polling; nothing is spawned.
pub async fn poll_until<T, E, F, Fut>(
    every: Duration,
    deadline: Duration,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
{
    let rounds = async {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match probe().await {
                Ok(Attempt::Ready(value)) => return Ok(value),
                Ok(Attempt::Pending) => continue,
                Err(e) => return Err(PollError::Aborted(e)),
            }
        }
    };

    match tokio::time::timeout(deadline, rounds).await {
        Ok(result) => result,
        Err(_) => Err(PollError::TimedOut { after: deadline }),
    }
}
