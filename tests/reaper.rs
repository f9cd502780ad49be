mod common;

use std::process::Command;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use model_swapper::{ProcessReaper, SwapperError};

use common::REAPER;

/// Spawn `sh -c script` and return its pid plus a channel carrying its
/// return code as reported by the reaper.
fn spawn_watched(script: &str) -> (u32, Receiver<i32>) {
    let (tx, rx) = unbounded();
    // Registered before the spawn, so a fast exit is not missed.
    let listener = REAPER.register(move |pid, code| {
        let _ = tx.send((pid, code));
    });

    let child = Command::new("/bin/sh").args(["-c", script]).spawn().unwrap();
    let pid = child.id();
    drop(child);

    let (code_tx, code_rx) = unbounded();
    std::thread::spawn(move || {
        while let Ok((reaped, code)) = rx.recv_timeout(Duration::from_secs(10)) {
            if reaped == pid {
                let _ = code_tx.send(code);
                break;
            }
        }
        REAPER.unregister(listener);
    });
    (pid, code_rx)
}

#[test]
fn test_exit_status_is_reported() {
    let (_, codes) = spawn_watched("exit 3");
    assert_eq!(codes.recv_timeout(Duration::from_secs(10)).unwrap(), 3);
}

#[test]
fn test_signal_death_is_negative_signo() {
    let (pid, codes) = spawn_watched("sleep 30");
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    assert_eq!(codes.recv_timeout(Duration::from_secs(10)).unwrap(), -9);
}

#[test]
fn test_many_children_each_reported_once() {
    let watched: Vec<_> = (0..8).map(|i| spawn_watched(&format!("exit {i}"))).collect();
    for (i, (_, codes)) in watched.into_iter().enumerate() {
        assert_eq!(codes.recv_timeout(Duration::from_secs(10)).unwrap(), i as i32);
    }
}

#[test]
fn test_second_install_fails() {
    lazy_static::initialize(&REAPER);
    assert!(matches!(
        ProcessReaper::install(),
        Err(SwapperError::ReaperAlreadyInstalled)
    ));
}
