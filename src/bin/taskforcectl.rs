//! Thin out-of-band control client for a running taskforced instance.
//! Speaks the same hand-rolled HTTP/1.1 the server speaks; no keep-alive.
use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "taskforcectl", version, about = "Control client for a running taskforced instance")]
struct Cli {
    /// `[host][:port]`, or an absolute path to a Unix-domain socket.
    #[arg(long, default_value = "127.0.0.1:8080")]
    connect: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// GET /status/version
    Version,
    /// GET /status/tasks
    Tasks,
    /// GET /status/config
    Config,
    /// POST /manage/control, one or more `task=mode` pairs
    Control {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// POST /manage/count, one or more `task=count` pairs
    Count {
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// POST /manage/reload
    Reload,
    /// POST /manage/stop
    Stop,
    /// POST /manage/reset
    Reset,
}

fn is_unix_path(connect: &str) -> bool {
    connect.starts_with('/')
}

fn default_port(connect: &str) -> String {
    if connect.contains(':') {
        connect.to_string()
    } else {
        format!("{connect}:8080")
    }
}

fn send(connect: &str, method: &str, path: &str, body: Option<String>) -> std::io::Result<(u16, String)> {
    if is_unix_path(connect) {
        let stream = UnixStream::connect(connect)?;
        exchange(stream, method, path, body)
    } else {
        let stream = TcpStream::connect(default_port(connect))?;
        exchange(stream, method, path, body)
    }
}

fn exchange<S: Read + Write>(
    mut stream: S,
    method: &str,
    path: &str,
    body: Option<String>,
) -> std::io::Result<(u16, String)> {
    let body = body.unwrap_or_default();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: taskforcectl\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(0);

    let mut content_length = 0usize;
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
    reader.read_exact(&mut body)?;
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let (method, path, body) = match &cli.command {
        Command::Version => ("GET", "/status/version".to_string(), None),
        Command::Tasks => ("GET", "/status/tasks".to_string(), None),
        Command::Config => ("GET", "/status/config".to_string(), None),
        Command::Control { assignments } => ("POST", "/manage/control".to_string(), Some(assignments.join("&"))),
        Command::Count { assignments } => ("POST", "/manage/count".to_string(), Some(assignments.join("&"))),
        Command::Reload => ("POST", "/manage/reload".to_string(), None),
        Command::Stop => ("POST", "/manage/stop".to_string(), None),
        Command::Reset => ("POST", "/manage/reset".to_string(), None),
    };

    match send(&cli.connect, method, &path, body) {
        Ok((status, body)) => {
            println!("{body}");
            if status >= 400 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("taskforcectl: {err}");
            ExitCode::FAILURE
        }
    }
}
