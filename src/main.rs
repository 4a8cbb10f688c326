//! dipa-link daemon
//!
//! Connects to a lighting-controller node over serial per the
//! configuration file, keeps the session alive through the reconnection
//! controller, and logs upward events until SIGINT/SIGTERM.

use dipa_link::{AppConfig, Scheduler, SerialConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/etc/dipalink.toml";

/// `-c/--config PATH`, or a bare positional path
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut path = DEFAULT_CONFIG_PATH.to_string();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    path = args[i + 1].clone();
                    i += 1;
                }
            }
            other => path = other.to_string(),
        }
        i += 1;
    }
    path
}

fn main() {
    let config_path = parse_config_path();
    let config = match AppConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Could not load {} ({}), using built-in defaults",
                config_path, e
            );
            AppConfig::default()
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.logging.level)
        .init();

    log::info!("dipa-link {} starting", env!("CARGO_PKG_VERSION"));

    if config.connector.kind != "serial" {
        log::error!(
            "Connector kind '{}' is not available in the daemon; only 'serial' is",
            config.connector.kind
        );
        std::process::exit(1);
    }

    let scheduler = Scheduler::new(config.reconnect.options());
    let events = scheduler.events().subscribe();

    let connector = SerialConnector::new(config.serial.profile(), scheduler.context());
    if let Err(e) = scheduler.attach(Box::new(connector)) {
        log::error!("Could not attach connector: {}", e);
        std::process::exit(1);
    }

    let criteria = config.connector.criteria();
    let reconnect = config.reconnect.options();
    match scheduler.auto_select(&criteria, reconnect.scan_window, reconnect.connect_timeout) {
        Ok(node) => log::info!("Using node {} ({})", node.name, node.mac),
        Err(e) => log::warn!("Initial selection failed: {}", e),
    }
    if let Err(e) = scheduler.connect(reconnect.connect_timeout) {
        log::warn!("Initial connect failed: {}", e);
    }

    let term = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&term)) {
            log::error!("Could not register signal handler: {}", e);
        }
    }

    while !term.load(Ordering::Relaxed) {
        while let Ok(event) = events.try_recv() {
            log::info!("Event: {:?}", event);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down");
    if let Err(e) = scheduler.destroy() {
        log::warn!("Teardown error: {}", e);
    }
}
