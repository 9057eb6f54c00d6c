use clap::{Arg, Command};
use log::LevelFilter;
use module_tagger::config::Config;
use module_tagger::consumer::consume;
use module_tagger::handler::{BuildEvent, EventHandler};
use module_tagger::koji::KojiClient;
use module_tagger::matcher::RuleEngine;
use module_tagger::mbs::MbsClient;
use module_tagger::rules::load_rules;
use std::process;

const PID_FILE: &str = "/var/run/module-tagger.pid";

#[tokio::main]
async fn main() {
    let matches = Command::new("module-tagger")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tags module builds in koji based on declarative rules")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/module-tagger/config.yaml"),
        )
        .arg(
            Arg::new("rules")
                .long("rules")
                .value_name("FILE")
                .help("Rule file path, overriding the configured one")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("check-rules")
                .long("check-rules")
                .help("Load configuration and rules, report problems, and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Log matched tags without calling koji")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("event")
                .long("event")
                .value_name("FILE")
                .help("Handle a single build event from a JSON file and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("events")
                .long("events")
                .value_name("FILE")
                .help("Consume newline-delimited JSON events from a file instead of stdin")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let mut config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration from {config_path}: {e}");
            process::exit(1);
        }
    };
    if matches.get_flag("dry-run") {
        config.dry_run = true;
    }
    if let Some(rules_path) = matches.get_one::<String>("rules") {
        config.rules_file = rules_path.clone();
    }

    let rules = match load_rules(&config.rules_file) {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Error loading rules from {}: {e}", config.rules_file);
            process::exit(1);
        }
    };
    let engine = match RuleEngine::new(rules) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error compiling rule patterns: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("check-rules") {
        println!("Configuration: {config_path}");
        println!("Rule file: {}", config.rules_file);
        println!(
            "{} rule(s), {} distinct pattern(s), all regular expressions compile",
            engine.rules().len(),
            engine.pattern_count()
        );
        return;
    }

    let source = match MbsClient::new(&config.mbs_api_url) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error setting up the MBS client: {e}");
            process::exit(1);
        }
    };
    let credentials = config.koji_user.clone().zip(config.koji_password.clone());
    let dispatcher = match KojiClient::new(&config.koji_hub_url, credentials) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            eprintln!("Error setting up the koji client: {e}");
            process::exit(1);
        }
    };
    if config.dry_run {
        log::info!("Dry-run mode: matched tags will be logged, not applied");
    }
    let handler = EventHandler::new(engine, source, dispatcher, config.dry_run);

    if let Some(event_file) = matches.get_one::<String>("event") {
        let content = match std::fs::read_to_string(event_file) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Error reading event file {event_file}: {e}");
                process::exit(1);
            }
        };
        let event: BuildEvent = match serde_json::from_str(&content) {
            Ok(event) => event,
            Err(e) => {
                eprintln!("Error parsing event file {event_file}: {e}");
                process::exit(1);
            }
        };
        if let Err(e) = handler.handle(&event).await {
            log::error!("Failed to handle event for {}: {e:#}", event.nsvc());
            process::exit(1);
        }
        return;
    }

    if matches.get_flag("daemon") {
        // stdin is detached from the terminal once daemonized
        if matches.get_one::<String>("events").is_none() {
            eprintln!("--daemon requires --events FILE");
            process::exit(1);
        }
        #[cfg(unix)]
        daemonize();
        #[cfg(not(unix))]
        log::warn!("Daemon mode is only supported on unix, continuing in the foreground");
    }

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, cleaning up...");
        if std::path::Path::new(PID_FILE).exists() {
            if let Err(e) = std::fs::remove_file(PID_FILE) {
                log::warn!("Failed to remove PID file: {e}");
            }
        }
        std::process::exit(0);
    })
    .expect("Error setting shutdown signal handler");

    let result = match matches.get_one::<String>("events") {
        Some(events_file) => {
            let file = match tokio::fs::File::open(events_file).await {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("Error opening events file {events_file}: {e}");
                    process::exit(1);
                }
            };
            log::info!("Consuming build events from {events_file}");
            consume(tokio::io::BufReader::new(file), &handler).await
        }
        None => {
            log::info!("Consuming build events from stdin");
            consume(tokio::io::BufReader::new(tokio::io::stdin()), &handler).await
        }
    };
    if let Err(e) = result {
        log::error!("Event loop failed: {e:#}");
        process::exit(1);
    }
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Edit the koji credentials and rules_file before starting the service.");
        }
        Err(e) => {
            eprintln!("Error generating configuration file: {e}");
            process::exit(1);
        }
    }
}

#[cfg(unix)]
fn daemonize() {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    log::info!("Starting module-tagger in daemon mode...");

    // First fork
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to fork process");
            process::exit(1);
        }
        0 => {
            // Child process continues
        }
        _ => {
            // Parent process exits
            process::exit(0);
        }
    }

    // Create new session (become session leader)
    if unsafe { libc::setsid() } == -1 {
        log::error!("Failed to create new session");
        process::exit(1);
    }

    // Ignore SIGHUP to prevent the daemon from being killed when the session
    // leader exits
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so we are no longer a session leader and cannot acquire a
    // controlling terminal
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to second fork");
            process::exit(1);
        }
        0 => {
            // Child process continues as daemon
        }
        _ => {
            process::exit(0);
        }
    }

    // Change working directory to root to avoid keeping any directory in use
    let root_path = std::ffi::CString::new("/").unwrap();
    if unsafe { libc::chdir(root_path.as_ptr()) } == -1 {
        log::warn!("Failed to change working directory to /");
    }

    // Set file creation mask
    unsafe {
        libc::umask(0);
    }

    // Redirect standard file descriptors to /dev/null instead of closing
    // them, so stray writes cannot hit an unrelated fd
    if let Ok(dev_null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        let null_fd = dev_null.as_raw_fd();
        unsafe {
            libc::dup2(null_fd, 0); // stdin
            libc::dup2(null_fd, 1); // stdout
            libc::dup2(null_fd, 2); // stderr
        }
        std::mem::forget(dev_null);
    } else {
        log::warn!("Failed to open /dev/null, closing standard file descriptors");
        unsafe {
            libc::close(0);
            libc::close(1);
            libc::close(2);
        }
    }

    let pid = unsafe { libc::getpid() };
    if let Err(e) = std::fs::write(PID_FILE, pid.to_string()) {
        log::warn!("Failed to write PID file: {e}");
    } else {
        log::info!("PID file written: {PID_FILE} ({pid})");
    }
}
