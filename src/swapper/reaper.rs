//! Process reaper: the single owner of SIGCHLD handling.
//!
//! Calling `waitpid(-1)` from several managers races: one of them steals the
//! exit status another is waiting for. Instead every child exit is collected
//! here, on one background thread, and fanned out to all registered
//! listeners. Listeners filter by pid.
//!
//! Anything else in a process that installed the reaper must not wait on its
//! own children (`Command::status`, `Command::output`, `Child::wait`).

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{debug, error, info};

use super::error::{Result, SwapperError};
use super::signals::SelfPipe;

/// Listener callback: `(pid, return_code)`. `return_code` is the exit status,
/// or the negated signal number when the child was killed by a signal.
pub type ExitCallback = Arc<dyn Fn(u32, i32) + Send + Sync>;

/// Handle returned by [`ProcessReaper::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

static INSTALLED: AtomicBool = AtomicBool::new(false);

type Listeners = Arc<Mutex<BTreeMap<ListenerId, ExitCallback>>>;

/// A listener that panicked cannot leave the map half-updated, so a poisoned
/// lock is still usable.
fn lock_listeners(listeners: &Listeners) -> MutexGuard<'_, BTreeMap<ListenerId, ExitCallback>> {
    listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ProcessReaper {
    listeners: Listeners,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ProcessReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = lock_listeners(&self.listeners).len();
        f.debug_struct("ProcessReaper")
            .field("listeners", &count)
            .finish()
    }
}

impl ProcessReaper {
    /// Install the SIGCHLD handler and start the reaper thread.
    ///
    /// Must be called once, from the composition root, before any runner is
    /// spawned. A second call fails with [`SwapperError::ReaperAlreadyInstalled`].
    pub fn install() -> Result<Arc<Self>> {
        if INSTALLED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SwapperError::ReaperAlreadyInstalled);
        }

        let pipe = match SelfPipe::new().and_then(|p| p.route_signal(libc::SIGCHLD).map(|_| p)) {
            Ok(pipe) => pipe,
            Err(e) => {
                INSTALLED.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let reaper = Arc::new(Self {
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        });

        let listeners = reaper.listeners.clone();
        thread::Builder::new()
            .name("process-reaper".to_string())
            .spawn(move || reaper_thread(pipe, listeners))?;

        // Children that exited before the handler existed produced no signal.
        if let Err(e) = reap_children(&reaper.listeners) {
            error!("[REAPER] Initial reap failed: {e}");
        }

        info!("[REAPER] Installed SIGCHLD handler");
        Ok(reaper)
    }

    /// Register `callback` for every future child exit.
    pub fn register(&self, callback: impl Fn(u32, i32) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_listeners(&self.listeners).insert(id, Arc::new(callback));
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unregister(&self, id: ListenerId) {
        lock_listeners(&self.listeners).remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        lock_listeners(&self.listeners).len()
    }
}

fn reaper_thread(pipe: SelfPipe, listeners: Listeners) {
    loop {
        if let Err(e) = pipe.wait() {
            error!("[REAPER] Wake pipe failed, reaper stopping: {e}");
            return;
        }
        if let Err(e) = reap_children(&listeners) {
            // Only ECHILD is expected; anything else means our bookkeeping is wrong.
            error!("[REAPER] BUG: waitpid failed, reaper stopping: {e}");
            return;
        }
    }
}

/// Reap every exited child without blocking and notify listeners.
fn reap_children(listeners: &Listeners) -> io::Result<()> {
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

        if pid == 0 {
            return Ok(());
        }
        if pid < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ECHILD) => return Ok(()),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }

        let return_code = decode_wait_status(status);
        debug!("[REAPER] Reaped pid={pid} return_code={return_code}");
        notify_listeners(listeners, pid as u32, return_code);
    }
}

fn notify_listeners(listeners: &Listeners, pid: u32, return_code: i32) {
    // Snapshot so callbacks may (un)register without deadlocking.
    let callbacks: Vec<ExitCallback> = lock_listeners(listeners).values().cloned().collect();
    for callback in callbacks {
        callback(pid, return_code);
    }
}

/// Exit status for normal exit, negated signal number for a signaled child.
pub fn decode_wait_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        -libc::WTERMSIG(status)
    } else {
        // Stopped/continued are filtered by SA_NOCLDSTOP and never reaped.
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wait_status() {
        // Encoded the way the kernel reports them on Linux and macOS.
        assert_eq!(decode_wait_status(0), 0);
        assert_eq!(decode_wait_status(3 << 8), 3);
        assert_eq!(decode_wait_status(libc::SIGKILL), -9);
        assert_eq!(decode_wait_status(libc::SIGTERM), -15);
    }

    #[test]
    fn test_listeners_survive_a_poisoned_lock() {
        // Built directly: installing would claim SIGCHLD for the test binary.
        let reaper = ProcessReaper {
            listeners: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(0),
        };
        let listeners = reaper.listeners.clone();
        let _ = thread::spawn(move || {
            let _guard = listeners.lock();
            panic!("listener panicked while holding the lock");
        })
        .join();
        assert!(reaper.listeners.is_poisoned());

        let (tx, rx) = crossbeam_channel::unbounded();
        let id = reaper.register(move |pid, code| {
            let _ = tx.send((pid, code));
        });
        assert_eq!(reaper.listener_count(), 1);

        notify_listeners(&reaper.listeners, 42, -2);
        assert_eq!(rx.try_recv(), Ok((42, -2)));

        reaper.unregister(id);
        assert_eq!(reaper.listener_count(), 0);
    }
}
