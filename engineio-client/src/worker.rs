//! Two lazily-initialized single-threaded executors shared by every session.
//!
//! The main executor runs all codec work, network futures and event
//! callbacks; running it on a single worker thread is what serializes state
//! mutation for a session and its sockets. The scheduler runs only timer
//! waits (ping, ping timeout, reconnect) and hands the fired task back to
//! the main executor.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

static EXECUTOR: Mutex<Option<Runtime>> = Mutex::new(None);
static SCHEDULER: Mutex<Option<Runtime>> = Mutex::new(None);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn build_runtime(name: &str) -> Runtime {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name(name)
        .enable_all()
        .build()
        .expect("failed to build worker runtime")
}

fn handle_of(slot: &Mutex<Option<Runtime>>, name: &str) -> Option<Handle> {
    if SHUTDOWN.load(Ordering::SeqCst) {
        return None;
    }
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(build_runtime(name));
    }
    guard.as_ref().map(|rt| rt.handle().clone())
}

/// Run a future on the main executor.
///
/// Everything that touches session, transport or socket state goes through
/// here; I/O library callbacks are trampolined onto this thread before they
/// mutate anything.
pub fn spawn<F>(fut: F) -> Option<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    handle_of(&EXECUTOR, "engineio-worker").map(|h| h.spawn(fut))
}

/// Run a closure on the main executor.
pub fn submit(task: impl FnOnce() + Send + 'static) -> Option<JoinHandle<()>> {
    spawn(async move { task() })
}

/// Run a closure on the main executor after `delay`.
///
/// The returned handle aborts the pending timer; once the timer has fired
/// the task is already queued and runs to completion.
pub fn schedule(task: impl FnOnce() + Send + 'static, delay: Duration) -> Option<JoinHandle<()>> {
    handle_of(&SCHEDULER, "engineio-scheduler").map(|h| {
        h.spawn(async move {
            tokio::time::sleep(delay).await;
            submit(task);
        })
    })
}

/// Shut both executors down, waiting up to `timeout` for each to drain.
///
/// Call only when completely done with the client API; afterwards every
/// submit is a silent no-op, matching a closed executor.
pub fn shutdown(timeout: Duration) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    if let Some(rt) = EXECUTOR.lock().unwrap().take() {
        rt.shutdown_timeout(timeout);
    }
    if let Some(rt) = SCHEDULER.lock().unwrap().take() {
        rt.shutdown_timeout(timeout);
    }
}

/// [`shutdown`] with the default one second grace period.
pub fn shutdown_default() {
    shutdown(Duration::from_secs(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn submit_runs_off_the_calling_thread() {
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        submit(move || {
            tx.send(std::thread::current().id()).unwrap();
        })
        .unwrap();
        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(caller, worker);
    }

    #[test]
    fn submitted_tasks_share_one_thread() {
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            submit(move || {
                tx.send(std::thread::current().id()).unwrap();
            })
            .unwrap();
        }
        drop(tx);
        let ids: Vec<_> = rx.iter().take(4).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn schedule_waits_and_can_be_aborted() {
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        schedule(move || tx2.send("late").unwrap(), Duration::from_millis(50)).unwrap();

        let aborted = schedule(move || tx.send("never").unwrap(), Duration::from_secs(60)).unwrap();
        aborted.abort();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
