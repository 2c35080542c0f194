use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Runs `tick` immediately and then every `period` until it returns `None`.
///
/// A tick that overruns the period delays the next one instead of bursting.
pub(crate) fn spawn_poller<F, Fut>(runtime: &Handle, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Option<Fut> + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let period = period.max(MIN_PERIOD);
    runtime.spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match tick() {
                Some(work) => work.await,
                None => break,
            }
        }
        debug!("poller stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_on_period_until_told_to_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = spawn_poller(&Handle::current(), Duration::from_secs(30), move || {
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (seen < 3).then(|| async {})
        });

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(!handle.is_finished());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        handle.await.unwrap();
    }
}
