//! 守护进程端到端：真正派生 `pilot --supervisor`，关闭生命线后检查浏览器进程与 profile

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use pilot::supervisor::{SupervisorConfig, SupervisorHandle, SupervisorPayload, SupervisorSettings};

fn pilot_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pilot"))
}

/// 启动一个假浏览器进程；返回 pid 与其退出通知
fn spawn_fake_browser() -> (u32, mpsc::Receiver<()>) {
    let mut child = Command::new("sleep")
        .arg("60")
        .stdin(Stdio::null())
        .spawn()
        .expect("spawn sleep");
    let pid = child.id();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = child.wait();
        let _ = tx.send(());
    });
    (pid, rx)
}

fn fast_settings() -> SupervisorSettings {
    SupervisorSettings {
        kill_timeout_ms: 2_000,
        poll_interval_ms: 50,
        pid_poll_interval_ms: 100,
        release_base_url: None,
    }
}

fn local_payload(pid: u32, profile: &Path, preserve: bool) -> SupervisorPayload {
    SupervisorPayload::new(SupervisorConfig::Local {
        pid,
        user_data_dir: Some(profile.to_path_buf()),
        created_temp_profile: true,
        preserve_user_data_dir: preserve,
    })
    .with_settings(fast_settings())
}

#[tokio::test]
async fn test_lifeline_close_kills_browser_and_removes_profile() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("profile");
    std::fs::create_dir_all(profile.join("Default")).unwrap();

    let (pid, exited) = spawn_fake_browser();
    let handle = SupervisorHandle::spawn_with(&pilot_bin(), &local_payload(pid, &profile, false))
        .unwrap();

    // 模拟父进程消失
    handle.shutdown(Duration::from_secs(10)).await.unwrap();

    assert!(exited.recv_timeout(Duration::from_secs(10)).is_ok());
    assert!(!profile.exists());
}

#[tokio::test]
async fn test_preserved_profile_survives_cleanup() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("profile");
    std::fs::create_dir_all(&profile).unwrap();

    let (pid, exited) = spawn_fake_browser();
    let handle = SupervisorHandle::spawn_with(&pilot_bin(), &local_payload(pid, &profile, true))
        .unwrap();
    handle.shutdown(Duration::from_secs(10)).await.unwrap();

    assert!(exited.recv_timeout(Duration::from_secs(10)).is_ok());
    assert!(profile.exists());
}

#[tokio::test]
async fn test_browser_exit_triggers_profile_cleanup() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("profile");
    std::fs::create_dir_all(&profile).unwrap();

    let (pid, exited) = spawn_fake_browser();
    let handle = SupervisorHandle::spawn_with(&pilot_bin(), &local_payload(pid, &profile, false))
        .unwrap();

    // 浏览器自行退出，生命线仍然保持
    let status = Command::new("kill").arg(pid.to_string()).status().unwrap();
    assert!(status.success());
    assert!(exited.recv_timeout(Duration::from_secs(10)).is_ok());

    let mut removed = false;
    for _ in 0..100 {
        if !profile.exists() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(removed);
    handle.shutdown(Duration::from_secs(10)).await.unwrap();
}

#[tokio::test]
async fn test_rearm_switches_to_remote_and_only_once() {
    let root = tempfile::tempdir().unwrap();
    let profile = root.path().join("profile");
    std::fs::create_dir_all(&profile).unwrap();

    let (pid, exited) = spawn_fake_browser();
    let mut handle =
        SupervisorHandle::spawn_with(&pilot_bin(), &local_payload(pid, &profile, false)).unwrap();
    assert!(handle.pid().is_some());

    let remote = SupervisorConfig::Remote {
        api_key: "key".into(),
        project_id: "project".into(),
        session_id: "session-1".into(),
    };
    handle.rearm(&remote).await.unwrap();
    assert!(handle.rearm(&remote).await.is_err());
    // 等守护进程读到新配置
    tokio::time::sleep(Duration::from_millis(300)).await;

    // 远程清理没有配置 release URL，只记录日志；本地浏览器不再被管理
    handle.shutdown(Duration::from_secs(10)).await.unwrap();
    assert!(profile.exists());
    assert!(exited.try_recv().is_err());

    let _ = Command::new("kill").arg(pid.to_string()).status();
}

#[test]
fn test_invalid_payload_exits_cleanly() {
    let status = Command::new(pilot_bin())
        .arg("--supervisor")
        .arg("--supervisor-config={not json")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn test_malformed_supervisor_argv_exits_cleanly() {
    let status = Command::new(pilot_bin())
        .arg("--supervisor")
        .arg("--no-such-flag")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());
}
