use log::{error, info};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Staggered startup delays keep the loops from contending with the host
/// daemon's startup replay and with each other.
pub const FLOW_STARTUP_DELAY_SECS: u64 = 30;
pub const FEE_STARTUP_DELAY_SECS: u64 = 90;
pub const REBALANCE_STARTUP_DELAY_SECS: u64 = 150;
pub const SNAPSHOT_DELAY_SECS: u64 = 120;

const JITTER_SECS: i64 = 60;

/// Loop period with uniform jitter in [-60, +60] seconds, floored at 1s.
pub fn jittered(period_secs: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(-JITTER_SECS..=JITTER_SECS);
    let secs = (period_secs as i64 + jitter).max(1);
    Duration::from_secs(secs as u64)
}

/// Run `cycle` every `period_secs` (jittered) after `initial_delay_secs`,
/// until the shutdown signal flips. Cycle errors are logged and the loop
/// continues; a loop never dies.
pub async fn run_loop<F, Fut>(
    name: &'static str,
    period_secs: u64,
    initial_delay_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(initial_delay_secs)) => {},
        _ = shutdown.changed() => {
            info!("{} loop: shutdown before first run", name);
            return;
        }
    }

    info!("{} loop started (period {}s)", name, period_secs);
    loop {
        if *shutdown.borrow() {
            info!("{} loop: shutting down", name);
            return;
        }
        if let Err(e) = cycle().await {
            error!("{} cycle error: {:#}", name, e);
        }
        tokio::select! {
            _ = tokio::time::sleep(jittered(period_secs)) => {},
            _ = shutdown.changed() => {
                info!("{} loop: shutting down", name);
                return;
            }
        }
    }
}

/// One-shot delayed task, cancellable by the same shutdown signal.
pub async fn run_once_after<F, Fut>(
    name: &'static str,
    delay_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {},
        _ = shutdown.changed() => return,
    }
    if let Err(e) = task().await {
        error!("{}: {:#}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..200 {
            let d = jittered(3600);
            assert!(d >= Duration::from_secs(3540));
            assert!(d <= Duration::from_secs(3660));
        }
    }

    #[test]
    fn test_jitter_floors_at_one_second() {
        for _ in 0..200 {
            assert!(jittered(1) >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_respects_initial_delay_and_period() {
        let count = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = count.clone();
        let handle = tokio::spawn(run_loop("test", 100, 10, rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        // Before the initial delay: nothing
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // After the delay: first run
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A few periods later (period 100 +/- 60 jitter): more runs
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_cycle_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = count.clone();
        let handle = tokio::spawn(run_loop("failing", 100, 1, rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("cycle exploded")
            }
        }));

        tokio::time::sleep(Duration::from_secs(500)).await;
        assert!(count.load(Ordering::SeqCst) >= 2, "loop died on error");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_first_run() {
        let count = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let c = count.clone();
        let handle = tokio::spawn(run_loop("never", 100, 1000, rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_after_fires_once() {
        let count = Arc::new(AtomicU32::new(0));
        let (_tx, rx) = watch::channel(false);

        let c = count.clone();
        let handle = tokio::spawn(run_once_after("snapshot", 120, rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        tokio::time::sleep(Duration::from_secs(121)).await;
        handle.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
