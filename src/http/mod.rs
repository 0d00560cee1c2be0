//! Control/status HTTP plane. Hand-rolled HTTP/1.1 over TCP or a
//! Unix-domain socket, thread-per-request, regex-routed.
mod tls;

use crate::config::{ControlMode, HttpListenerConfig};
use crate::error::HttpError;
use crate::legion::{ConfigHandle, Shared, Status};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use sysinfo::System;
use tracing::warn;

/// A bound listener, either loopback/TCP or a Unix-domain socket.
enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// One running control/status service, bound at `bind()` time and
/// dispatched to a thread per incoming connection.
pub struct HttpService {
    listener: Listener,
    tls: Option<openssl::ssl::SslAcceptor>,
    allow_control: bool,
    shared: Shared,
    status: Status,
    config: ConfigHandle,
}

/// Parsed request, enough to route and to read a urlencoded body.
struct Request {
    path: String,
    query: HashMap<String, String>,
    assignments: Vec<(String, String)>,
}

/// A response the route handlers build; written back verbatim.
struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Response {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    fn json<T: Serialize>(status: u16, value: &T, indent: bool) -> Self {
        let body = if indent {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .unwrap_or_else(|_| "{}".to_string());
        Response {
            status,
            content_type: "application/json",
            body,
        }
    }

    fn reason(status: u16) -> &'static str {
        match status {
            200 => "OK",
            202 => "Accepted",
            403 => "Forbidden",
            404 => "Not Found",
            400 => "Bad Request",
            _ => "Internal Server Error",
        }
    }
}

/// True when `listen` names an absolute filesystem path, i.e. a
/// Unix-domain socket rather than `[host][:port]`.
fn is_unix_path(listen: &str) -> bool {
    listen.starts_with('/')
}

impl HttpService {
    /// Binds the listener described by `cfg`. TCP binds `[host][:port]`
    /// (host defaults to `0.0.0.0`, port defaults to 8080); a Unix-domain
    /// socket path is removed first if a stale one is left over.
    pub fn bind(
        cfg: &HttpListenerConfig,
        shared: Shared,
        status: Status,
        config: ConfigHandle,
    ) -> Result<Self, HttpError> {
        let listener = if is_unix_path(&cfg.listen) {
            let path = PathBuf::from(&cfg.listen);
            let _ = std::fs::remove_file(&path);
            Listener::Unix(UnixListener::bind(&path)?)
        } else {
            let addr = parse_tcp_listen(&cfg.listen)?;
            Listener::Tcp(TcpListener::bind(addr)?)
        };

        let tls = match &cfg.certfile {
            Some(path) => Some(tls::build_acceptor(std::path::Path::new(path))?),
            None => None,
        };

        Ok(HttpService {
            listener,
            tls,
            allow_control: cfg.allow_control,
            shared,
            status,
            config,
        })
    }

    /// Runs the accept loop forever, handing each connection to its own
    /// thread. Never returns under normal operation.
    pub fn serve(self) -> Result<(), HttpError> {
        let allow_control = self.allow_control;
        let tls = self.tls.map(Arc::new);

        match self.listener {
            Listener::Tcp(listener) => {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(s) => s,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    let shared = Arc::clone(&self.shared);
                    let status = Arc::clone(&self.status);
                    let config = Arc::clone(&self.config);
                    let tls = tls.clone();
                    thread::spawn(move || {
                        if let Some(acceptor) = tls {
                            match acceptor.accept(stream) {
                                Ok(tls_stream) => {
                                    serve_conn(tls_stream, allow_control, &shared, &status, &config)
                                }
                                Err(err) => warn!(%err, "tls handshake failed"),
                            }
                        } else {
                            serve_conn(stream, allow_control, &shared, &status, &config);
                        }
                    });
                }
            }
            Listener::Unix(listener) => {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(s) => s,
                        Err(err) => {
                            warn!(%err, "accept failed");
                            continue;
                        }
                    };
                    let shared = Arc::clone(&self.shared);
                    let status = Arc::clone(&self.status);
                    let config = Arc::clone(&self.config);
                    thread::spawn(move || serve_conn(stream, allow_control, &shared, &status, &config));
                }
            }
        }
        Ok(())
    }
}

fn parse_tcp_listen(listen: &str) -> Result<String, HttpError> {
    if listen.is_empty() {
        return Ok("0.0.0.0:8080".to_string());
    }
    if let Some((host, port)) = listen.rsplit_once(':') {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(format!("{host}:{port}"))
    } else {
        Ok(format!("{listen}:8080"))
    }
}

fn parse_pairs(s: &str) -> Vec<(String, String)> {
    s.split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Reads one HTTP/1.1 request off `stream`. No keep-alive: one request
/// per connection, matching the teacher's thread-per-request model.
/// `task=value` control assignments may arrive either in the query string
/// or, for POST, in an `application/x-www-form-urlencoded` body; both are
/// merged into `assignments`, query first, so a body entry can override.
fn read_request<R: Read>(reader: &mut BufReader<R>) -> Result<Request, HttpError> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut parts = line.trim_end().splitn(3, ' ');
    let _method = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest("missing method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest("missing target".into()))?
        .to_string();

    let mut content_length: usize = 0;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }

    let (path, query_str) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let query: HashMap<String, String> = parse_pairs(query_str).into_iter().collect();

    let mut assignments: Vec<(String, String)> = query
        .iter()
        .filter(|(k, _)| k.as_str() != "indent" && k.as_str() != "fmt")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !body.is_empty() {
        if let Ok(body_str) = String::from_utf8(body) {
            assignments.extend(parse_pairs(&body_str));
        }
    }

    Ok(Request {
        path: path.to_string(),
        query,
        assignments,
    })
}

fn write_response<W: Write>(mut writer: W, resp: Response) -> std::io::Result<()> {
    let reason = Response::reason(resp.status);
    write!(
        writer,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        reason,
        resp.content_type,
        resp.body.len()
    )?;
    writer.write_all(resp.body.as_bytes())
}

fn serve_conn<S: Read + Write>(
    stream: S,
    allow_control: bool,
    shared: &Shared,
    status: &Status,
    config: &ConfigHandle,
) {
    let mut reader = BufReader::new(stream);
    let request = match read_request(&mut reader) {
        Ok(r) => r,
        Err(err) => {
            warn!(%err, "failed to parse request");
            return;
        }
    };
    let response = route(&request, allow_control, shared, status, config);
    let stream = reader.into_inner();
    if let Err(err) = write_response(stream, response) {
        warn!(%err, "failed to write response");
    }
}

/// Longest-prefix match among the fixed route table, then exact dispatch
/// within the matched group.
fn route(
    req: &Request,
    allow_control: bool,
    shared: &Shared,
    status: &Status,
    config: &ConfigHandle,
) -> Response {
    if let Some(fmt) = req.query.get("fmt") {
        if fmt != "json" {
            return Response::text(404, "unsupported fmt");
        }
    }
    let indent = req.query.contains_key("indent");

    let status_re = Regex::new(r"^/status/").unwrap();
    let manage_re = Regex::new(r"^/manage/").unwrap();

    if status_re.is_match(&req.path) {
        return handle_status(req, status, config, allow_control, indent);
    }
    if manage_re.is_match(&req.path) {
        if !allow_control {
            return Response::text(403, "control not permitted on this listener");
        }
        return handle_manage(req, shared, status, config);
    }
    Response::text(404, "not found")
}

#[derive(Serialize)]
struct PlatformInfo {
    system: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    release: Option<String>,
}

#[derive(Serialize)]
struct VersionInfo {
    taskforce: &'static str,
    platform: PlatformInfo,
}

fn handle_status(
    req: &Request,
    status: &Status,
    config: &ConfigHandle,
    allow_control: bool,
    indent: bool,
) -> Response {
    match req.path.as_str() {
        "/status/version" => {
            let platform = PlatformInfo {
                system: System::name().unwrap_or_else(|| "unknown".to_string()),
                platform: allow_control.then(System::long_os_version).flatten(),
                release: allow_control.then(System::kernel_version).flatten(),
            };
            let info = VersionInfo {
                taskforce: env!("CARGO_PKG_VERSION"),
                platform,
            };
            Response::json(200, &info, indent)
        }
        "/status/tasks" => {
            let snapshot = status.lock().unwrap_or_else(|p| p.into_inner()).clone();
            Response::json(200, &snapshot, indent)
        }
        "/status/config" => {
            let doc = config.lock().unwrap_or_else(|p| p.into_inner()).clone();
            Response::json(200, &doc, indent)
        }
        _ => Response::text(404, "not found"),
    }
}

fn handle_manage(req: &Request, shared: &Shared, status: &Status, config: &ConfigHandle) -> Response {
    match req.path.as_str() {
        "/manage/control" => handle_control(req, shared, status, config),
        "/manage/count" => handle_count(req, shared, status, config),
        "/manage/reload" => {
            shared.lock().unwrap_or_else(|p| p.into_inner()).reload_requested = true;
            Response::text(202, "reload scheduled")
        }
        "/manage/stop" => {
            shared.lock().unwrap_or_else(|p| p.into_inner()).exiting_requested = true;
            Response::text(202, "stop scheduled")
        }
        "/manage/reset" => {
            shared.lock().unwrap_or_else(|p| p.into_inner()).reset_requested = true;
            Response::text(202, "reset scheduled")
        }
        _ => Response::text(404, "not found"),
    }
}

fn handle_control(req: &Request, shared: &Shared, status: &Status, config: &ConfigHandle) -> Response {
    if req.assignments.is_empty() {
        return Response::text(404, "no task assignments given");
    }
    let known_tasks = config.lock().unwrap_or_else(|p| p.into_inner()).tasks.clone();
    let snapshot = status.lock().unwrap_or_else(|p| p.into_inner()).clone();

    let mut lines = Vec::new();
    let mut any_changed = false;
    let mut any_error = false;
    for (task, mode_str) in &req.assignments {
        if !known_tasks.contains_key(task) {
            lines.push(format!("{task}\tunknown task"));
            any_error = true;
            continue;
        }
        let Some(mode) = parse_control_mode(mode_str) else {
            lines.push(format!("{task}\tunknown control mode"));
            any_error = true;
            continue;
        };
        let current = snapshot.tasks.iter().find(|t| &t.name == task).map(|t| t.control);
        if current == Some(mode) {
            lines.push(format!("{task}\tno change"));
            continue;
        }
        shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .control_requests
            .insert(task.clone(), mode);
        lines.push(format!("{task}\tchanged"));
        any_changed = true;
    }

    let status_code = if any_error {
        404
    } else if any_changed {
        202
    } else {
        200
    };
    Response::text(status_code, lines.join("\n"))
}

fn handle_count(req: &Request, shared: &Shared, status: &Status, config: &ConfigHandle) -> Response {
    if req.assignments.is_empty() {
        return Response::text(404, "no task assignments given");
    }
    let known_tasks = config.lock().unwrap_or_else(|p| p.into_inner()).tasks.clone();
    let snapshot = status.lock().unwrap_or_else(|p| p.into_inner()).clone();

    let mut lines = Vec::new();
    let mut any_changed = false;
    let mut any_error = false;
    for (task, count_str) in &req.assignments {
        if !known_tasks.contains_key(task) {
            lines.push(format!("{task}\tunknown task"));
            any_error = true;
            continue;
        }
        let Ok(count) = count_str.parse::<i64>() else {
            lines.push(format!("{task}\tinvalid count"));
            any_error = true;
            continue;
        };
        if count <= 0 {
            lines.push(format!("{task}\tcount must be positive"));
            any_error = true;
            continue;
        }
        let current = snapshot.tasks.iter().find(|t| &t.name == task).map(|t| t.count);
        if current == Some(count as u32) {
            lines.push(format!("{task}\tno change"));
            continue;
        }
        shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .count_requests
            .insert(task.clone(), count as u32);
        lines.push(format!("{task}\tchanged"));
        any_changed = true;
    }

    let status_code = if any_error {
        404
    } else if any_changed {
        202
    } else {
        200
    };
    Response::text(status_code, lines.join("\n"))
}

fn parse_control_mode(s: &str) -> Option<ControlMode> {
    match s {
        "off" => Some(ControlMode::Off),
        "wait" => Some(ControlMode::Wait),
        "nowait" => Some(ControlMode::Nowait),
        "adopt" => Some(ControlMode::Adopt),
        "once" => Some(ControlMode::Once),
        "event" => Some(ControlMode::Event),
        "suspend" => Some(ControlMode::Suspend),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn empty_config() -> crate::config::Config {
        crate::config::Config {
            tasks: HashMap::new(),
            settings: crate::config::Settings::default(),
            defines: HashMap::new(),
            defaults: HashMap::new(),
            role_defines: HashMap::new(),
            role_defaults: HashMap::new(),
        }
    }

    #[test]
    fn parse_tcp_listen_defaults_host_and_port() {
        assert_eq!(parse_tcp_listen("").unwrap(), "0.0.0.0:8080");
        assert_eq!(parse_tcp_listen(":9000").unwrap(), "0.0.0.0:9000");
        assert_eq!(parse_tcp_listen("127.0.0.1:9000").unwrap(), "127.0.0.1:9000");
    }

    #[test]
    fn is_unix_path_detects_absolute_paths() {
        assert!(is_unix_path("/var/run/taskforce.sock"));
        assert!(!is_unix_path("localhost:8080"));
    }

    #[test]
    fn read_request_parses_path_and_query() {
        let raw = b"GET /status/tasks?indent=1 HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        let req = read_request(&mut reader).unwrap();
        assert_eq!(req.path, "/status/tasks");
        assert!(req.query.contains_key("indent"));
    }

    #[test]
    fn read_request_merges_body_assignments() {
        let raw = b"POST /manage/count HTTP/1.1\r\nContent-Length: 10\r\n\r\nworker=2&x=y".to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        let req = read_request(&mut reader).unwrap();
        assert!(req.assignments.contains(&("worker".to_string(), "2".to_string())));
    }

    #[test]
    fn manage_route_without_allow_control_is_forbidden() {
        let shared: Shared = Arc::new(std::sync::Mutex::new(crate::legion::SharedState::default()));
        let status: Status = Arc::new(std::sync::Mutex::new(crate::legion::StatusSnapshot::default()));
        let config: ConfigHandle = Arc::new(std::sync::Mutex::new(empty_config()));
        let req = Request {
            path: "/manage/reload".into(),
            query: HashMap::new(),
            assignments: Vec::new(),
        };
        let resp = route(&req, false, &shared, &status, &config);
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn manage_count_rejects_non_positive() {
        let shared: Shared = Arc::new(std::sync::Mutex::new(crate::legion::SharedState::default()));
        let status: Status = Arc::new(std::sync::Mutex::new(crate::legion::StatusSnapshot::default()));
        let mut config_doc = empty_config();
        config_doc
            .tasks
            .insert("worker".to_string(), crate::config::TaskConfig::default());
        let config: ConfigHandle = Arc::new(std::sync::Mutex::new(config_doc));
        let req = Request {
            path: "/manage/count".into(),
            query: HashMap::new(),
            assignments: vec![("worker".to_string(), "0".to_string())],
        };
        let resp = handle_count(&req, &shared, &status, &config);
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn manage_control_unknown_task_is_404() {
        let shared: Shared = Arc::new(std::sync::Mutex::new(crate::legion::SharedState::default()));
        let status: Status = Arc::new(std::sync::Mutex::new(crate::legion::StatusSnapshot::default()));
        let config: ConfigHandle = Arc::new(std::sync::Mutex::new(empty_config()));
        let req = Request {
            path: "/manage/control".into(),
            query: HashMap::new(),
            assignments: vec![("ghost".to_string(), "off".to_string())],
        };
        let resp = handle_control(&req, &shared, &status, &config);
        assert_eq!(resp.status, 404);
    }
}
