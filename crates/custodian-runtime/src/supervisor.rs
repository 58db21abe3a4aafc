//! Panic-contained task bodies.
//!
//! A periodic body, inbound command or platform signal that errors or panics
//! is logged and the next one still runs.  Nothing a task does can take the
//! process down.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use custodian_types::CustodianError;
use futures_util::FutureExt;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, warn};

/// Run one task body, logging an error or panic.  Returns `true` on success.
pub async fn supervise<Fut>(name: &str, body: Fut) -> bool
where
    Fut: Future<Output = Result<(), CustodianError>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(task = name, error = %e, kind = e.kind(), "task body failed");
            false
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(task = name, panic = %message, "task body panicked");
            false
        }
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `body` under [`supervise`], abandoning it as soon as shutdown is
/// requested.  Returns `None` when shutdown won the race.
pub async fn supervise_until_shutdown<Fut>(
    name: &str,
    body: Fut,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<bool>
where
    Fut: Future<Output = Result<(), CustodianError>>,
{
    tokio::select! {
        _ = shutdown_requested(shutdown) => {
            debug!(task = name, "body abandoned at shutdown");
            None
        }
        ok = supervise(name, body) => Some(ok),
    }
}

/// Call `body` immediately and then every `period` until shutdown.  A
/// notification on `wake` runs the body early and restarts the period.
///
/// A body still running when shutdown is requested is dropped, so a task
/// waiting on the user (a permission prompt) never holds shutdown up.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    wake: Option<Arc<Notify>>,
    mut shutdown: watch::Receiver<bool>,
    mut body: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CustodianError>>,
{
    debug!(task = name, ?period, "periodic task started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if supervise_until_shutdown(name, body(), &mut shutdown).await.is_none() {
            break;
        }

        let woken = async {
            match &wake {
                Some(notify) => notify.notified().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(period) => {}
            _ = woken => debug!(task = name, "woken early"),
        }
    }
    debug!(task = name, "periodic task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn supervise_contains_errors_and_panics() {
        assert!(supervise("ok", async { Ok(()) }).await);
        assert!(!supervise("err", async { Err(CustodianError::Platform("boom".into())) }).await);
        let panicking = async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        };
        assert!(!supervise("panic", panicking).await);
    }

    #[tokio::test]
    async fn keeps_ticking_after_failures() {
        let (tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let task = tokio::spawn(run_periodic(
            "flaky",
            Duration::from_millis(5),
            None,
            rx,
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n % 2 == 0 {
                        panic!("every other tick panics");
                    }
                    Err(CustodianError::Platform("and the rest fail".into()))
                }
            },
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn shutdown_abandons_a_body_that_never_finishes() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_periodic(
            "stuck",
            Duration::from_secs(3600),
            None,
            rx,
            || async {
                std::future::pending::<()>().await;
                Ok(())
            },
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("periodic task must stop while its body is pending")
            .unwrap();
    }

    #[tokio::test]
    async fn supervise_until_shutdown_reports_which_side_won() {
        let (tx, mut rx) = watch::channel(false);
        assert_eq!(
            supervise_until_shutdown("quick", async { Ok(()) }, &mut rx).await,
            Some(true)
        );
        tx.send(true).unwrap();
        let pending = async {
            std::future::pending::<()>().await;
            Ok(())
        };
        assert_eq!(supervise_until_shutdown("slow", pending, &mut rx).await, None);
    }

    #[tokio::test]
    async fn wake_runs_body_early() {
        let (tx, rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let task = tokio::spawn(run_periodic(
            "woken",
            Duration::from_secs(3600),
            Some(wake.clone()),
            rx,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
