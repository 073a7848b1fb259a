use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use clap::Parser;
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};
use radiance::config::{Configuration, ConfigurationError};
use radiance::database::Database;
use radiance::http_service::http_service;
use radiance::logging::setup_logging;
use radiance::scheduler;
use radiance::site_comm::SiteComm;
use radiance::tracker::{Stats, TorrentTracker};

#[derive(Parser)]
#[command(author, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    show_version: bool,

    /// Fork into the background.
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Path of the config file.
    #[arg(short = 'c', long, default_value = "./radiance.conf")]
    config: String,
}

fn main() {
    let args = Cli::parse();

    if args.show_version {
        println!("Radiance BitTorrent Tracker v{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let config = match Configuration::load_file(args.config.as_str()) {
        Ok(config) => config,
        Err(ConfigurationError::IOError(_)) => {
            eprintln!("Using default config because '{}' couldn't be opened", args.config);
            Configuration::default()
        }
        Err(error) => {
            eprintln!("Broken config file '{}': {}", args.config, error);
            exit(101);
        }
    };
    let config = Arc::new(config);

    setup_logging(&config);
    info!("{} - Version: {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    // The fork has to happen before any runtime thread exists.
    if config.tracker.daemonize || args.daemonize {
        info!("Running in Daemon Mode");
        let mut daemon = daemonize::Daemonize::new().umask(0);
        if config.tracker.pid_file != "none" && !config.tracker.pid_file.is_empty() {
            daemon = daemon.pid_file(config.tracker.pid_file.as_str());
        }
        if let Err(error) = daemon.start() {
            eprintln!("Unable to daemonize: {}", error);
            exit(1);
        }
    } else {
        info!("Running in Foreground");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Unable to start runtime: {}", error);
            exit(1);
        }
    };
    runtime.block_on(run(config, args.config));
}

async fn run(config: Arc<Configuration>, config_path: String) {
    let stats = Arc::new(Stats::new());
    let database = Arc::new(Database::new(&config, stats.clone()));
    let site_comm = Arc::new(SiteComm::new(&config));
    let tracker = Arc::new(TorrentTracker::new(config.clone(), database.clone(), site_comm, stats));

    if !database.readonly && !database.load_peerlists && database.clear_peerlists {
        info!("Clearing peerlists and resetting peer counts...");
        database.clear_peer_data().await;
        info!("done");
    }

    database.load_site_options(&tracker).await;
    database.load_users(&tracker).await;
    database.load_torrents(&tracker).await;
    database.load_tokens(&tracker).await;
    database.load_peers(&tracker).await;
    database.load_blacklist(&tracker).await;

    let addr: SocketAddr = match format!("{}:{}", config.tracker.listen_host, config.tracker.listen_port).parse() {
        Ok(addr) => addr,
        Err(error) => {
            error!("Invalid listen address {}:{} ({})", config.tracker.listen_host, config.tracker.listen_port, error);
            exit(1);
        }
    };
    let (_handle, server) = http_service(addr, tracker.clone()).await;
    tokio::spawn(server);

    scheduler::start(tracker.clone());

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            error!("Unable to install SIGINT handler: {}", error);
            exit(1);
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            error!("Unable to install SIGTERM handler: {}", error);
            exit(1);
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(error) => {
            error!("Unable to install SIGHUP handler: {}", error);
            exit(1);
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(error) => {
            error!("Unable to install SIGUSR1 handler: {}", error);
            exit(1);
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Caught SIGINT/SIGTERM");
                if tracker.shutdown().await {
                    exit(0);
                }
            }
            _ = sigterm.recv() => {
                info!("Caught SIGINT/SIGTERM");
                if tracker.shutdown().await {
                    exit(0);
                }
            }
            _ = sighup.recv() => {
                info!("Reloading config");
                match Configuration::load_file(config_path.as_str()) {
                    Ok(reloaded) => {
                        tracker.reload_config(&reloaded);
                        info!("Done reloading config");
                    }
                    Err(error) => {
                        error!("Config file '{}' couldn't be reloaded: {}", config_path, error);
                    }
                }
            }
            _ = sigusr1.recv() => {
                info!("Reloading from database");
                let tracker_clone = tracker.clone();
                tokio::spawn(async move {
                    tracker_clone.reload_lists().await;
                });
            }
        }
    }
}
