use nix::unistd::Uid;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::thread;
use taskforce::cli::{parse_args, Cli};
use taskforce::config::HttpListenerConfig;
use taskforce::http::HttpService;
use taskforce::legion::Legion;
use taskforce::pidfile::PidFile;
use taskforce::runtime::{self, RuntimeMode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let euid = Uid::effective();

    let runtime_mode = if euid.is_root() {
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };
    runtime::init(runtime_mode);
    runtime::capture_socket_activation();
    init_logging(&args);

    let config_path = PathBuf::from(&args.config_file);
    let roles_path = args.roles_file.as_ref().map(PathBuf::from);

    if args.sanity {
        taskforce::config::load_config(&config_path)?;
        info!("configuration is valid");
        return Ok(());
    }

    let expires = args.expires.map(std::time::Duration::from_secs);
    let mut legion = Legion::bootstrap(config_path, roles_path, expires)?;

    let listeners = merged_listeners(&args, &legion);
    for cfg in listeners {
        let service = HttpService::bind(&cfg, legion.shared(), legion.status(), legion.config_handle())?;
        let listen = cfg.listen.clone();
        thread::spawn(move || {
            if let Err(err) = service.serve() {
                error!(%err, listen, "http service exited");
            }
        });
        info!(listen = %cfg.listen, "http service listening");
    }

    let pid_path = runtime::state_dir().join("taskforced.pid");
    let _pidfile = match PidFile::acquire(&pid_path) {
        Ok(pidfile) => pidfile,
        Err(err) => {
            error!(%err, path = %pid_path.display(), "failed to acquire pid file");
            return Err(Box::new(err));
        }
    };

    if let Err(err) = legion.run() {
        error!(%err, "supervisor exited with error");
        return Err(Box::new(err));
    }

    Ok(())
}

/// Combines `--http`/`--certfile`/`--allow-control` CLI listeners with any
/// declared under `settings.http` in the config document.
fn merged_listeners(args: &Cli, legion: &Legion) -> Vec<HttpListenerConfig> {
    let mut listeners = legion.config_listeners();
    for listen in &args.http {
        listeners.push(HttpListenerConfig {
            listen: listen.clone(),
            certfile: args.certfile.clone(),
            allow_control: args.allow_control,
        });
    }
    listeners
}

fn init_logging(args: &Cli) {
    let filter = EnvFilter::try_new(args.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));

    if args.log_stderr {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }

    let log_dir = runtime::log_dir();
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {:?}: {}", log_dir, err);
    }
    let log_path = log_dir.join("taskforced.log");

    let file = match fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {:?}: {}", log_path, err);
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().unwrap())
        .with_ansi(false)
        .try_init();
}
