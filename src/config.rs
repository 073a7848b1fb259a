use std::collections::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    ParseError(#[from] toml::de::Error),
}

/// The `[tracker]` section of the config file. Every key has the same
/// default the daemon has always shipped with, so a missing file or a
/// partial file still yields a runnable configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TrackerConfig {
    // Listener
    pub listen_host: String,
    pub listen_port: u16,
    pub listen_path: String,
    pub max_connections: usize,
    pub connection_timeout: u64,
    pub keepalive_timeout: u64,

    // Tracker requests
    pub announce_interval: u32,
    pub max_request_size: usize,
    pub numwant_limit: u32,

    // Timers
    pub del_reason_lifetime: i64,
    pub peers_timeout: i64,
    pub reap_peers_interval: i64,
    pub schedule_interval: u64,

    // MySQL
    pub mysql_db: String,
    pub mysql_host: String,
    pub mysql_port: u16,
    pub mysql_username: String,
    pub mysql_password: String,
    pub mysql_connections: u32,
    pub mysql_timeout: u64,

    // Site communication
    pub site_host: String,
    pub site_port: u16,
    pub site_path: String,
    pub site_password: String,
    pub report_password: String,

    // General control
    pub readonly: bool,
    pub clear_peerlists: bool,
    pub load_peerlists: bool,
    pub daemonize: bool,
    pub syslog_path: String,
    pub syslog_level: String,
    pub pid_file: String,
}

impl Default for TrackerConfig {
    fn default() -> TrackerConfig {
        TrackerConfig {
            listen_host: String::from("0.0.0.0"),
            listen_port: 2710,
            listen_path: String::from(""),
            max_connections: 1024,
            connection_timeout: 10,
            keepalive_timeout: 0,

            announce_interval: 1800,
            max_request_size: 4096,
            numwant_limit: 50,

            del_reason_lifetime: 86400,
            peers_timeout: 7200,
            reap_peers_interval: 1800,
            schedule_interval: 3,

            mysql_db: String::from("gazelle"),
            mysql_host: String::from("localhost"),
            mysql_port: 3306,
            mysql_username: String::from(""),
            mysql_password: String::from(""),
            mysql_connections: 8,
            mysql_timeout: 30,

            site_host: String::from("127.0.0.1"),
            site_port: 80,
            site_path: String::from(""),
            site_password: String::from("00000000000000000000000000000000"),
            report_password: String::from("00000000000000000000000000000000"),

            readonly: false,
            clear_peerlists: true,
            load_peerlists: false,
            daemonize: false,
            syslog_path: String::from("off"),
            syslog_level: String::from("info"),
            pid_file: String::from("./radiance.pid"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Configuration {
    pub tracker: TrackerConfig,
}

impl Configuration {
    pub fn load(data: &str) -> Result<Configuration, toml::de::Error> {
        toml::from_str(data)
    }

    pub fn load_file(path: &str) -> Result<Configuration, ConfigurationError> {
        let data = std::fs::read_to_string(path)?;
        Ok(Self::load(data.as_str())?)
    }
}

/// Site-wide options. Unlike `Configuration` these come from the `options`
/// table of the companion site's database, and the site can rewrite them at
/// runtime through the admin channel.
pub struct SiteOptions {
    settings: Mutex<HashMap<String, String>>,
}

impl Default for SiteOptions {
    fn default() -> SiteOptions {
        SiteOptions::new()
    }
}

impl SiteOptions {
    pub fn new() -> SiteOptions {
        let mut settings = HashMap::new();
        settings.insert(String::from("SitewideFreeleechMode"), String::from("off"));
        settings.insert(String::from("SitewideFreeleechStartTime"), String::from("0"));
        settings.insert(String::from("SitewideFreeleechEndTime"), String::from("0"));
        settings.insert(String::from("SitewideDoubleseedMode"), String::from("off"));
        settings.insert(String::from("SitewideDoubleseedStartTime"), String::from("0"));
        settings.insert(String::from("SitewideDoubleseedEndTime"), String::from("0"));
        settings.insert(String::from("EnableIPv6Tracker"), String::from("0"));
        SiteOptions { settings: Mutex::new(settings) }
    }

    pub fn keys(&self) -> Vec<String> {
        self.settings.lock().keys().cloned().collect()
    }

    pub fn get_str(&self, name: &str) -> String {
        self.settings.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn get_time(&self, name: &str) -> i64 {
        self.get_str(name).parse::<i64>().unwrap_or(0)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get_str(name).as_str(), "1" | "true" | "yes")
    }

    pub fn set(&self, name: &str, value: &str) {
        let mut settings = self.settings.lock();
        match settings.get_mut(name) {
            Some(current) => {
                *current = value.to_string();
            }
            None => {
                log::warn!("Unrecognized site option '{}'", name);
            }
        }
    }
}
