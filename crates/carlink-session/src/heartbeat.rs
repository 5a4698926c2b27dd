//! Per-session liveness monitor.
//!
//! One worker thread per armed monitor drives two timers: an idle timer that
//! triggers a heartbeat, and an ACK timer that declares the session dead.
//! Inbound activity restarts the idle timer and cancels a pending ACK wait.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Callbacks from the monitor worker.
pub trait HeartbeatListener: Send + Sync {
    /// The idle timer fired; send a heartbeat for this session.
    fn send_heartbeat(&self);

    /// No ACK arrived in time. Called at most once per arming.
    fn heartbeat_timed_out(&self);
}

/// Observable monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    /// Idle timer running (or heartbeat sent and ACK awaited).
    Armed,
    /// Last heartbeat was acknowledged.
    Acked,
    TimedOut,
}

enum Command {
    Activity,
    Ack,
    Stop,
}

struct Worker {
    tx: Sender<Command>,
    handle: JoinHandle<()>,
    thread: ThreadId,
}

#[derive(Default)]
pub struct HeartbeatMonitor {
    worker: Mutex<Option<Worker>>,
    state: Arc<Mutex<StateCell>>,
}

#[derive(Clone, Copy)]
struct StateCell {
    state: HeartbeatState,
    awaiting_ack: bool,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: HeartbeatState::Idle,
            awaiting_ack: false,
        }
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("state", &self.state())
            .finish()
    }
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HeartbeatState {
        lock(&self.state).state
    }

    /// True while a heartbeat has been sent and no ACK has arrived.
    pub fn awaiting_ack(&self) -> bool {
        lock(&self.state).awaiting_ack
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Arm the monitor. Any previous worker is stopped first.
    pub fn start(
        &self,
        interval: Duration,
        ack_timeout: Duration,
        listener: Arc<dyn HeartbeatListener>,
    ) {
        self.stop();

        let (tx, rx) = mpsc::channel();
        let state = Arc::clone(&self.state);
        *lock(&state) = StateCell {
            state: HeartbeatState::Armed,
            awaiting_ack: false,
        };

        let spawned = thread::Builder::new()
            .name("carlink-heartbeat".to_string())
            .spawn(move || run(rx, state, interval, ack_timeout, listener));

        match spawned {
            Ok(handle) => {
                let thread = handle.thread().id();
                *lock(&self.worker) = Some(Worker { tx, handle, thread });
            }
            Err(err) => {
                warn!(error = %err, "failed to spawn heartbeat worker");
                lock(&self.state).state = HeartbeatState::Idle;
            }
        }
    }

    /// Any inbound traffic for the session.
    pub fn notify_activity(&self) {
        self.signal(Command::Activity);
    }

    pub fn notify_ack(&self) {
        self.signal(Command::Ack);
    }

    /// Disarm and release the worker. Safe to call from the listener
    /// callbacks (the worker is then detached instead of joined).
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        let _ = worker.tx.send(Command::Stop);
        if worker.thread != thread::current().id() {
            let _ = worker.handle.join();
        }

        let mut cell = lock(&self.state);
        if cell.state != HeartbeatState::TimedOut {
            cell.state = HeartbeatState::Idle;
        }
        cell.awaiting_ack = false;
    }

    fn signal(&self, command: Command) {
        if let Some(worker) = lock(&self.worker).as_ref() {
            let _ = worker.tx.send(command);
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    rx: mpsc::Receiver<Command>,
    state: Arc<Mutex<StateCell>>,
    interval: Duration,
    ack_timeout: Duration,
    listener: Arc<dyn HeartbeatListener>,
) {
    let mut deadline = Instant::now() + interval;

    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(Command::Activity) => {
                let mut cell = lock(&state);
                cell.awaiting_ack = false;
                if cell.state != HeartbeatState::Acked {
                    cell.state = HeartbeatState::Armed;
                }
                deadline = Instant::now() + interval;
            }
            Ok(Command::Ack) => {
                let mut cell = lock(&state);
                cell.awaiting_ack = false;
                cell.state = HeartbeatState::Acked;
                deadline = Instant::now() + interval;
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                let awaiting = lock(&state).awaiting_ack;
                if awaiting {
                    {
                        let mut cell = lock(&state);
                        cell.state = HeartbeatState::TimedOut;
                        cell.awaiting_ack = false;
                    }
                    debug!(?ack_timeout, "heartbeat ack timed out");
                    listener.heartbeat_timed_out();
                    return;
                }

                {
                    let mut cell = lock(&state);
                    cell.awaiting_ack = true;
                    cell.state = HeartbeatState::Armed;
                }
                listener.send_heartbeat();
                deadline = Instant::now() + ack_timeout;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
        timeouts: AtomicUsize,
    }

    impl HeartbeatListener for Counting {
        fn send_heartbeat(&self) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }

        fn heartbeat_timed_out(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn silent_peer_times_out_exactly_once() {
        let monitor = HeartbeatMonitor::new();
        let listener = Arc::new(Counting::default());
        monitor.start(
            Duration::from_millis(20),
            Duration::from_millis(30),
            listener.clone(),
        );

        assert!(wait_until(Duration::from_secs(2), || {
            monitor.state() == HeartbeatState::TimedOut
        }));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(listener.sent.load(Ordering::SeqCst), 1);
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
        assert!(!monitor.is_running());
    }

    #[test]
    fn ack_keeps_session_alive() {
        let monitor = HeartbeatMonitor::new();
        let listener = Arc::new(Counting::default());
        monitor.start(
            Duration::from_millis(20),
            Duration::from_millis(80),
            listener.clone(),
        );

        for _ in 0..5 {
            assert!(wait_until(Duration::from_secs(2), || monitor.awaiting_ack()));
            monitor.notify_ack();
            assert!(wait_until(Duration::from_secs(2), || !monitor.awaiting_ack()));
        }

        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 0);
        assert!(listener.sent.load(Ordering::SeqCst) >= 5);
        assert_ne!(monitor.state(), HeartbeatState::TimedOut);
        monitor.stop();
        assert_eq!(monitor.state(), HeartbeatState::Idle);
    }

    #[test]
    fn activity_postpones_heartbeat() {
        let monitor = HeartbeatMonitor::new();
        let listener = Arc::new(Counting::default());
        monitor.start(
            Duration::from_millis(60),
            Duration::from_millis(60),
            listener.clone(),
        );

        for _ in 0..10 {
            thread::sleep(Duration::from_millis(15));
            monitor.notify_activity();
        }

        assert_eq!(listener.sent.load(Ordering::SeqCst), 0);
        monitor.stop();
    }

    #[test]
    fn repeated_start_stop_leaves_no_worker() {
        let monitor = HeartbeatMonitor::new();
        let listener = Arc::new(Counting::default());
        for _ in 0..20 {
            monitor.start(
                Duration::from_millis(500),
                Duration::from_millis(500),
                listener.clone(),
            );
            monitor.stop();
        }
        assert!(!monitor.is_running());
        assert_eq!(monitor.state(), HeartbeatState::Idle);
    }

    #[test]
    fn stop_from_listener_callback_does_not_deadlock() {
        struct StopsItself {
            monitor: Mutex<Option<Arc<HeartbeatMonitor>>>,
            timeouts: AtomicUsize,
        }

        impl HeartbeatListener for StopsItself {
            fn send_heartbeat(&self) {}

            fn heartbeat_timed_out(&self) {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                if let Some(monitor) = lock(&self.monitor).take() {
                    monitor.stop();
                }
            }
        }

        let monitor = Arc::new(HeartbeatMonitor::new());
        let listener = Arc::new(StopsItself {
            monitor: Mutex::new(Some(Arc::clone(&monitor))),
            timeouts: AtomicUsize::new(0),
        });
        monitor.start(
            Duration::from_millis(5),
            Duration::from_millis(5),
            listener.clone(),
        );

        assert!(wait_until(Duration::from_secs(2), || {
            listener.timeouts.load(Ordering::SeqCst) == 1
        }));
        assert!(wait_until(Duration::from_secs(2), || !monitor.is_running()));
    }
}
