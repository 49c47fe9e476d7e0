//! Runs every probe of one phase concurrently and picks the phase winner.
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, trace, warn};
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::probe::Detection;
use crate::error::ProbeError;
use crate::input::WinnerPolicy;

/// A named probe invocation ready to be spawned.
pub(crate) type ProbeTask<T> = (String, BoxFuture<'static, Result<T, ProbeError>>);

enum Slot<T> {
    Pending,
    Missed,
    Hit(T),
}

/// Spawns all `tasks`, each bounded by `probe_timeout`, and returns the
/// winning detection. As soon as the winner is known the remaining tasks are
/// aborted, which drops their futures and closes whatever sockets they hold.
pub(crate) async fn race<T>(
    phase: &'static str,
    endpoint: &str,
    policy: WinnerPolicy,
    probe_timeout: Duration,
    tasks: Vec<ProbeTask<T>>,
) -> Option<T>
where
    T: Detection + Send + 'static,
{
    let mut slots: Vec<Slot<T>> = Vec::with_capacity(tasks.len());
    let mut set = JoinSet::new();

    for (index, (protocol, probe)) in tasks.into_iter().enumerate() {
        slots.push(Slot::Pending);
        let endpoint = endpoint.to_owned();
        set.spawn(async move {
            let outcome = timeout(probe_timeout, AssertUnwindSafe(probe).catch_unwind()).await;
            let found = match outcome {
                Ok(Ok(Ok(found))) => Some(found),
                Ok(Ok(Err(e))) if e.is_end_of_stream() => {
                    trace!("{phase} probe {protocol} on {endpoint}: {e}");
                    None
                }
                Ok(Ok(Err(e))) => {
                    debug!("{phase} probe {protocol} on {endpoint}: {e}");
                    None
                }
                Ok(Err(_)) => {
                    warn!("{phase} probe {protocol} on {endpoint} panicked");
                    None
                }
                Err(_) => {
                    debug!("{phase} probe {protocol} on {endpoint} timed out after {probe_timeout:?}");
                    None
                }
            };
            (index, found)
        });
    }

    while let Some(joined) = set.join_next().await {
        let Ok((index, found)) = joined else {
            continue;
        };

        slots[index] = match found {
            Some(result) if result.is_detected() => Slot::Hit(result),
            _ => Slot::Missed,
        };

        if let Some(winner) = decide(&mut slots, policy, index) {
            if !set.is_empty() {
                trace!("{phase} winner on {endpoint} chosen, aborting {} probes", set.len());
                set.abort_all();
            }
            return Some(winner);
        }
    }

    // Every task has finished; anything still pending failed to join.
    slots.into_iter().find_map(|slot| match slot {
        Slot::Hit(result) => Some(result),
        _ => None,
    })
}

fn decide<T>(slots: &mut [Slot<T>], policy: WinnerPolicy, completed: usize) -> Option<T> {
    let index = match policy {
        WinnerPolicy::FirstCompleted => {
            matches!(slots[completed], Slot::Hit(_)).then_some(completed)?
        }
        WinnerPolicy::RegistryOrder => {
            let mut winner = None;
            for (index, slot) in slots.iter().enumerate() {
                match slot {
                    Slot::Pending => return None,
                    Slot::Missed => continue,
                    Slot::Hit(_) => {
                        winner = Some(index);
                        break;
                    }
                }
            }
            winner?
        }
    };

    match std::mem::replace(&mut slots[index], Slot::Missed) {
        Slot::Hit(result) => Some(result),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{race, ProbeTask};
    use crate::discovery::probe::{Detection, PresentationDiscovery};
    use crate::error::ProbeError;
    use crate::input::WinnerPolicy;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn task(name: &'static str, delay_ms: u64, detect: bool) -> ProbeTask<PresentationDiscovery> {
        (
            name.to_owned(),
            async move {
                sleep(Duration::from_millis(delay_ms)).await;
                Ok(if detect {
                    PresentationDiscovery::detected(name)
                } else {
                    PresentationDiscovery::not_detected(name)
                })
            }
            .boxed(),
        )
    }

    #[tokio::test]
    async fn registry_order_waits_for_earlier_probes() {
        let tasks = vec![task("slow", 150, true), task("fast", 0, true)];
        let winner = race("test", "local", WinnerPolicy::RegistryOrder, Duration::from_secs(2), tasks)
            .await
            .unwrap();
        assert_eq!(winner.protocol(), "slow");
    }

    #[tokio::test]
    async fn first_completed_takes_the_fastest_hit() {
        let tasks = vec![task("slow", 150, true), task("fast", 0, true)];
        let winner = race("test", "local", WinnerPolicy::FirstCompleted, Duration::from_secs(2), tasks)
            .await
            .unwrap();
        assert_eq!(winner.protocol(), "fast");
    }

    #[tokio::test]
    async fn misses_and_errors_do_not_win() {
        let failing: ProbeTask<PresentationDiscovery> = (
            "broken".to_owned(),
            async { Err(ProbeError::Malformed("garbage".to_owned())) }.boxed(),
        );
        let tasks = vec![failing, task("quiet", 0, false), task("found", 20, true)];
        let winner = race("test", "local", WinnerPolicy::RegistryOrder, Duration::from_secs(2), tasks)
            .await
            .unwrap();
        assert_eq!(winner.protocol(), "found");
    }

    #[tokio::test]
    async fn hung_probe_is_timed_out() {
        let tasks = vec![task("hung", 60_000, true), task("late", 10, true)];
        let winner = race("test", "local", WinnerPolicy::RegistryOrder, Duration::from_millis(100), tasks)
            .await
            .unwrap();
        assert_eq!(winner.protocol(), "late");
    }

    #[tokio::test]
    async fn panicking_probe_counts_as_not_detected() {
        async fn explode() -> Result<PresentationDiscovery, ProbeError> {
            panic!("probe bug")
        }

        let panicking: ProbeTask<PresentationDiscovery> = ("panics".to_owned(), explode().boxed());
        let tasks = vec![panicking, task("ok", 0, true)];
        let winner = race("test", "local", WinnerPolicy::RegistryOrder, Duration::from_secs(2), tasks)
            .await
            .unwrap();
        assert_eq!(winner.protocol(), "ok");
    }

    #[tokio::test]
    async fn nothing_detected_is_none() {
        let tasks = vec![task("a", 0, false), task("b", 5, false)];
        let winner = race("test", "local", WinnerPolicy::RegistryOrder, Duration::from_secs(2), tasks).await;
        assert!(winner.is_none());
    }

    #[tokio::test]
    async fn losers_are_aborted_once_a_winner_is_chosen() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let straggler: ProbeTask<PresentationDiscovery> = (
            "straggler".to_owned(),
            async move {
                sleep(Duration::from_millis(300)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(PresentationDiscovery::detected("straggler"))
            }
            .boxed(),
        );
        let tasks = vec![task("winner", 0, true), straggler];

        let winner = race("test", "local", WinnerPolicy::RegistryOrder, Duration::from_secs(2), tasks)
            .await
            .unwrap();
        assert_eq!(winner.protocol(), "winner");

        sleep(Duration::from_millis(500)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
