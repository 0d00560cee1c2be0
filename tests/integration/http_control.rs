//! End-to-end coverage against a real `taskforced` child process: role
//! filtering, count control, dependency ordering, and unauthorized control
//! over a Unix-domain listener.
#[path = "common/mod.rs"]
mod common;

use assert_cmd::cargo::cargo_bin_cmd;
use common::{http_get, wait_for_status, HomeEnvGuard};
use std::fs;
use std::io::Write;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::time::Duration;
use tempfile::tempdir;

fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Daemon(Child);

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_daemon(config_path: &std::path::Path, http: &str, extra: &[&str]) -> Daemon {
    let mut cmd: Command = cargo_bin_cmd("taskforced");
    cmd.arg("--config-file")
        .arg(config_path)
        .arg("--http")
        .arg(http)
        .arg("--allow-control")
        .arg("--log-stderr")
        .args(extra);
    Daemon(cmd.spawn().expect("spawn taskforced"))
}

fn wait_for_listener(addr: &str) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {addr} to accept connections");
}

#[test]
fn role_switch_stops_out_of_scope_tasks() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("taskforce.yaml");
    let roles_path = temp.path().join("roles.txt");
    fs::write(
        &config_path,
        r#"
tasks:
  db_server:
    control: wait
    roles: [backend]
    commands:
      start: ["sleep", "30"]
  ws_server:
    control: wait
    roles: [frontend]
    count: 1
    commands:
      start: ["sleep", "30"]
  firewall:
    control: wait
    commands:
      start: ["sleep", "30"]
"#,
    )
    .unwrap();
    fs::write(&roles_path, "frontend\nbackend\n").unwrap();

    let port = free_tcp_port();
    let http_addr = format!("127.0.0.1:{port}");
    let _daemon = {
        let mut cmd: Command = cargo_bin_cmd("taskforced");
        cmd.arg("--config-file")
            .arg(&config_path)
            .arg("--roles-file")
            .arg(&roles_path)
            .arg("--http")
            .arg(&http_addr)
            .arg("--allow-control")
            .arg("--log-stderr");
        Daemon(cmd.spawn().expect("spawn taskforced"))
    };
    wait_for_listener(&http_addr);

    wait_for_status(&http_addr, |v| {
        let tasks = v["tasks"].as_array().unwrap();
        tasks.len() == 3 && tasks.iter().all(|t| !t["processes"].as_array().unwrap().is_empty())
    });

    fs::write(&roles_path, "frontend\n").unwrap();
    let (status, _) = http_get(&http_addr, "/manage/reload");
    assert_eq!(status, 202);

    wait_for_status(&http_addr, |v| {
        let tasks = v["tasks"].as_array().unwrap();
        let db = tasks.iter().find(|t| t["name"] == "db_server");
        let ws = tasks.iter().find(|t| t["name"] == "ws_server").unwrap();
        db.is_none_or(|t| t["processes"].as_array().unwrap().is_empty())
            && !ws["processes"].as_array().unwrap().is_empty()
    });
}

#[test]
fn count_control_scales_processes_and_reports_no_change() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("taskforce.yaml");
    fs::write(
        &config_path,
        r#"
tasks:
  ws_server:
    control: wait
    count: 4
    commands:
      start: ["sleep", "30"]
"#,
    )
    .unwrap();

    let port = free_tcp_port();
    let http_addr = format!("127.0.0.1:{port}");
    let _daemon = spawn_daemon(&config_path, &http_addr, &[]);
    wait_for_listener(&http_addr);

    wait_for_status(&http_addr, |v| {
        v["tasks"][0]["processes"].as_array().unwrap().len() == 4
    });

    let (status, body) = http_get(&http_addr, "/manage/count?ws_server=2");
    assert_eq!(status, 202);
    assert!(body.contains("ws_server\tchanged"));

    wait_for_status(&http_addr, |v| {
        v["tasks"][0]["processes"].as_array().unwrap().len() == 2
    });

    let (status, body) = http_get(&http_addr, "/manage/count?ws_server=2");
    assert_eq!(status, 200);
    assert_eq!(body.trim(), "ws_server\tno change");
}

#[test]
fn dependency_ordering_waits_for_once_task_to_stop() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("taskforce.yaml");
    fs::write(
        &config_path,
        r#"
tasks:
  a:
    control: once
    commands:
      start: ["true"]
  b:
    control: wait
    requires: [a]
    commands:
      start: ["sleep", "30"]
"#,
    )
    .unwrap();

    let port = free_tcp_port();
    let http_addr = format!("127.0.0.1:{port}");
    let _daemon = spawn_daemon(&config_path, &http_addr, &[]);
    wait_for_listener(&http_addr);

    let snapshot = wait_for_status(&http_addr, |v| {
        let tasks = v["tasks"].as_array().unwrap();
        let b = tasks.iter().find(|t| t["name"] == "b").unwrap();
        !b["processes"].as_array().unwrap().is_empty()
    });

    let tasks = snapshot["tasks"].as_array().unwrap();
    let a = tasks.iter().find(|t| t["name"] == "a").unwrap();
    assert!(a["processes"].as_array().unwrap().is_empty());
}

#[test]
fn unauthorized_unix_control_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let config_path = temp.path().join("taskforce.yaml");
    fs::write(
        &config_path,
        r#"
tasks:
  db_server:
    control: wait
    commands:
      start: ["sleep", "30"]
"#,
    )
    .unwrap();

    let sock_path = temp.path().join("s.tf");
    let mut cmd: Command = cargo_bin_cmd("taskforced");
    cmd.arg("--config-file")
        .arg(&config_path)
        .arg("--http")
        .arg(&sock_path)
        .arg("--log-stderr");
    let _daemon = Daemon(cmd.spawn().expect("spawn taskforced"));
    common::wait_for_path(&sock_path);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let (status, _) = loop {
        if let Ok(stream) = std::os::unix::net::UnixStream::connect(&sock_path) {
            drop(stream);
            break unix_get(&sock_path, "/manage/control?db_server=off");
        }
        if std::time::Instant::now() >= deadline {
            panic!("timed out connecting to unix listener");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(status, 403);
}

fn unix_get(path: &std::path::Path, target: &str) -> (u16, String) {
    use std::io::{BufRead, BufReader, Read};
    let mut stream = std::os::unix::net::UnixStream::connect(path).unwrap();
    write!(
        stream,
        "GET {target} HTTP/1.1\r\nHost: test\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).unwrap();
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}
