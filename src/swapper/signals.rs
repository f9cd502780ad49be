//! Self-pipe signal plumbing.
//!
//! A signal handler may only perform async-signal-safe work, so the handlers
//! installed here do nothing but write one byte into a non-blocking pipe.
//! A regular thread blocks on the read end and does the real work.

use std::io;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicI32, Ordering};

const MAX_SIGNAL: usize = 65;

const NO_FD: AtomicI32 = AtomicI32::new(-1);
/// Write end of the wake pipe registered for each signal number.
static WAKE_FDS: [AtomicI32; MAX_SIGNAL] = [NO_FD; MAX_SIGNAL];

extern "C" fn on_signal(signo: c_int) {
    let Some(slot) = usize::try_from(signo).ok().and_then(|i| WAKE_FDS.get(i)) else {
        return;
    };
    let fd = slot.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    unsafe {
        let errno = errno_location();
        let saved = *errno;
        let byte = signo as u8;
        // EAGAIN means the pipe is full: a wake-up is already pending.
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *errno = saved;
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

/// A close-on-exec pipe whose write end is non-blocking.
#[derive(Debug)]
pub struct SelfPipe {
    read_fd: c_int,
    write_fd: c_int,
}

impl SelfPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_cloexec(pipe.read_fd)?;
        set_cloexec(pipe.write_fd)?;
        set_nonblocking(pipe.write_fd)?;
        Ok(pipe)
    }

    /// Route `signo` to this pipe and install the byte-writing handler.
    ///
    /// `SA_RESTART` keeps interrupted syscalls elsewhere in the process from
    /// failing with `EINTR`. `SA_NOCLDSTOP` suppresses SIGCHLD for stopped
    /// (not exited) children.
    pub fn route_signal(&self, signo: c_int) -> io::Result<()> {
        let slot = usize::try_from(signo)
            .ok()
            .and_then(|i| WAKE_FDS.get(i))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad signal number"))?;
        slot.store(self.write_fd, Ordering::SeqCst);

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signo, &action, std::ptr::null_mut()) != 0 {
                slot.store(-1, Ordering::SeqCst);
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Block until at least one signal arrived, then drain pending bytes.
    /// Returns the signal numbers seen (duplicates collapse).
    pub fn wait(&self) -> io::Result<Vec<c_int>> {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                let mut seen: Vec<c_int> = buf[..n as usize].iter().map(|b| *b as c_int).collect();
                seen.sort_unstable();
                seen.dedup();
                return Ok(seen);
            }
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "wake pipe closed"));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

fn set_cloexec(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Mark every descriptor from 3 upwards close-on-exec.
///
/// Runs in the forked child between `fork` and `exec`, so it only makes
/// async-signal-safe calls and never allocates. `max_fd` must be computed
/// before forking (see [`max_fd`]).
pub fn cloexec_inherited_fds(max_fd: c_int) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                3 as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        // Older kernels: fall through to the fcntl loop.
    }

    for fd in 3..max_fd {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
    Ok(())
}

/// Upper bound for descriptor numbers in this process.
pub fn max_fd() -> c_int {
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        4096
    } else {
        limit.min(65_536) as c_int
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        for slot in WAKE_FDS.iter() {
            let _ = slot.compare_exchange(self.write_fd, -1, Ordering::SeqCst, Ordering::SeqCst);
        }
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_drains_and_dedups() {
        let pipe = SelfPipe::new().unwrap();
        for byte in [17u8, 17, 15] {
            let n = unsafe {
                libc::write(pipe.write_fd, &byte as *const u8 as *const libc::c_void, 1)
            };
            assert_eq!(n, 1);
        }
        assert_eq!(pipe.wait().unwrap(), vec![15, 17]);
    }

    #[test]
    fn test_write_end_is_nonblocking() {
        let pipe = SelfPipe::new().unwrap();
        let flags = unsafe { libc::fcntl(pipe.write_fd, libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        let fd_flags = unsafe { libc::fcntl(pipe.read_fd, libc::F_GETFD) };
        assert!(fd_flags & libc::FD_CLOEXEC != 0);
    }
}
