mod common;

use std::fs;
use std::thread;
use std::time::Duration;

use model_swapper::slot::runner_main::INJECTED_FAILURE_EXIT_CODE;
use model_swapper::slot::slot_agent::SlotAgent;
use model_swapper::SwapperError;

use common::{echo_runner, model, rows, REAPER};

const TIMEOUT: Duration = Duration::from_secs(10);

fn agent(slot_id: usize, extra_args: &[&str]) -> SlotAgent {
    SlotAgent::new(slot_id, echo_runner(extra_args), REAPER.clone(), TIMEOUT)
}

/// `pipe:[inode]` identity of descriptor `fd` of process `pid`.
fn fd_target(pid: &str, fd: &str) -> Option<std::path::PathBuf> {
    fs::read_link(format!("/proc/{pid}/fd/{fd}")).ok()
}

#[test]
fn test_concurrent_agents_exit_on_stdin_eof() {
    // Each runner only sees EOF if no sibling runner inherited its stdin.
    let handles: Vec<_> = (0..5)
        .map(|slot| {
            thread::spawn(move || {
                let mut agent = agent(slot, &[]);
                let info = agent
                    .start(&model(&format!("m{slot}")), None, Box::new(|_: u32, _: i32| {}))
                    .unwrap();
                assert!(!info.restored);
                assert_eq!(agent.pid(), Some(info.pid));

                agent.feed("b1", rows(1..=3)).unwrap();
                let results = agent.await_batch("b1", TIMEOUT).unwrap();
                assert_eq!(results.len(), 3);

                agent.close_input();
                let report = agent.stop_gracefully(TIMEOUT, false).unwrap();
                assert!(!agent.is_running());
                report
            })
        })
        .collect();

    for handle in handles {
        let report = handle.join().unwrap();
        assert_eq!(report.return_code, 0);
        assert!(!report.forced, "runner needed SIGKILL, its stdin leaked");
    }
}

#[test]
fn test_runner_does_not_inherit_parent_descriptors() {
    let mut fds = [0 as libc::c_int; 2];
    // Plain pipe(2): neither end is close-on-exec.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let own_pid = std::process::id().to_string();
    let read_end = fd_target(&own_pid, &fds[0].to_string()).unwrap();
    let write_end = fd_target(&own_pid, &fds[1].to_string()).unwrap();

    let mut agent = agent(0, &[]);
    let info = agent
        .start(&model("fd-check"), None, Box::new(|_: u32, _: i32| {}))
        .unwrap();

    let runner_pid = info.pid.to_string();
    let held: Vec<_> = fs::read_dir(format!("/proc/{runner_pid}/fd"))
        .unwrap()
        .filter_map(|entry| fd_target(&runner_pid, &entry.ok()?.file_name().to_string_lossy()))
        .collect();
    let report = agent.stop_gracefully(TIMEOUT, false).unwrap();
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }

    assert!(!held.is_empty());
    assert!(!held.contains(&read_end), "runner inherited {read_end:?}");
    assert!(!held.contains(&write_end), "runner inherited {write_end:?}");
    assert_eq!(report.return_code, 0);
}

#[test]
fn test_runner_leads_its_own_process_group() {
    let mut agent = agent(0, &[]);
    let info = agent
        .start(&model("pgrp"), None, Box::new(|_: u32, _: i32| {}))
        .unwrap();

    let pid = info.pid as libc::pid_t;
    let runner_group = unsafe { libc::getpgid(pid) };
    let own_group = unsafe { libc::getpgid(0) };
    let report = agent.stop_gracefully(TIMEOUT, true).unwrap();

    assert_eq!(runner_group, pid);
    assert_ne!(runner_group, own_group);
    assert_eq!(report.return_code, 0);
    assert!(report.checkpoint.is_some());
}

#[test]
fn test_swap_out_and_back_in_restores_state() {
    let xyz = model("xyz");
    let mut agent = agent(0, &[]);

    let info = agent.start(&xyz, None, Box::new(|_: u32, _: i32| {})).unwrap();
    assert!(!info.restored);
    agent.define(serde_json::json!({"window": 4}), TIMEOUT).unwrap();
    agent.feed("c1", rows(1..=3)).unwrap();
    agent.await_batch("c1", TIMEOUT).unwrap();

    let report = agent.stop_gracefully(TIMEOUT, true).unwrap();
    assert_eq!(report.return_code, 0);
    let checkpoint = report.checkpoint.expect("runner sent a checkpoint");

    let info = agent.start(&xyz, Some(&checkpoint), Box::new(|_: u32, _: i32| {})).unwrap();
    assert!(info.restored);

    // Rows 2 and 3 were already seen before the swap.
    agent.feed("c2", rows(2..=4)).unwrap();
    let results = agent.await_batch("c2", TIMEOUT).unwrap();
    let ids: Vec<i64> = results.iter().map(|r| r.row_id).collect();
    assert_eq!(ids, vec![4]);
    // Mean of 1, 2, 3 carried over from the checkpoint.
    assert!((results[0].anomaly_score - 2.0).abs() < 1e-9);

    assert_eq!(agent.stop_gracefully(TIMEOUT, false).unwrap().return_code, 0);
}

#[test]
fn test_runner_crash_is_reported() {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let mut agent = agent(0, &["--fail-on-row-id", "2"]);
    let info = agent
        .start(
            &model("crashy"),
            None,
            Box::new(move |pid: u32, return_code: i32| {
                let _ = tx.send((pid, return_code));
            }),
        )
        .unwrap();

    agent.feed("b1", rows(1..=3)).unwrap();
    let result = agent.await_batch("b1", TIMEOUT);
    assert!(matches!(
        result,
        Err(SwapperError::RunnerCrashed { return_code, .. }) if return_code == INJECTED_FAILURE_EXIT_CODE
    ));
    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        (info.pid, INJECTED_FAILURE_EXIT_CODE)
    );

    // Collecting the dead runner frees the slot without sending anything.
    let report = agent.stop_gracefully(TIMEOUT, true).unwrap();
    assert_eq!(report.return_code, INJECTED_FAILURE_EXIT_CODE);
    assert!(report.checkpoint.is_none());
    assert!(!agent.is_running());
}

#[test]
fn test_missing_program_fails_to_start() {
    let spawn = model_swapper::RunnerSpawnConfig::program("/nonexistent/runner", Vec::new());
    let mut agent = SlotAgent::new(0, spawn, REAPER.clone(), TIMEOUT);
    let result = agent.start(&model("m"), None, Box::new(|_: u32, _: i32| {}));
    assert!(matches!(result, Err(SwapperError::RunnerStartFailed { .. })));
    assert!(!agent.is_running());
}
