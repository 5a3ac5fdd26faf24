//! Configuration options.
//!
//! Applications embedding the broker are free to define their own command
//! line arguments; the broker itself takes a TOML configuration file that
//! defines the listeners and the stock policy's limits. A minimal file:
//!
//! ```toml
//! [[tcp]]
//!     address = "0.0.0.0:8000"
//!     server_id = 0
//!
//! [[websocket]]
//!     address = "0.0.0.0:8001"
//!     server_id = 1
//!
//! [limits]
//!     header_message_max_size = 50
//!     header_max_size = 200
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> RuntimeConfig {
    let config_str = fs::read_to_string(path).expect("ERROR: File read failed");
    let config: RuntimeConfig = toml::from_str(&config_str).expect("Invalid config file");
    if config.tcp.is_empty() && config.websocket.is_empty() {
        log::error!("Configure at least one listener: {:#?}", config);
        panic!();
    }
    config
}

/// A default configuration: one TCP listener and one WebSocket listener on
/// the loopback interface. For demonstration purposes only.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Byte-stream (plain TCP) listeners.
    #[serde(default)]
    pub tcp: Vec<ListenerConfig>,

    /// Frame-stream (WebSocket) listeners.
    #[serde(default)]
    pub websocket: Vec<ListenerConfig>,

    /// Header-phase size limits enforced by the stock policy.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Timing knobs for the stock policy.
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            tcp: vec![ListenerConfig {
                address: "127.0.0.1:8000".to_string(),
                server_id: 0,
            }],
            websocket: vec![ListenerConfig {
                address: "127.0.0.1:8001".to_string(),
                server_id: 1,
            }],
            limits: LimitsConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// One listening socket.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address, e.g. `0.0.0.0:8000`.
    pub address: String,

    /// Tag recorded on every connection this listener produces; policies can
    /// discriminate on it. Defaults to `0`.
    #[serde(default)]
    pub server_id: usize,
}

/// Header-phase size limits. Zero means unlimited.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum size of a single header-phase message in bytes.
    #[serde(default = "default_header_message_max_size")]
    pub header_message_max_size: usize,

    /// Maximum total size of the header phase in bytes.
    #[serde(default = "default_header_max_size")]
    pub header_max_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            header_message_max_size: default_header_message_max_size(),
            header_max_size: default_header_max_size(),
        }
    }
}

fn default_header_message_max_size() -> usize {
    50
}

fn default_header_max_size() -> usize {
    200
}

/// Timing knobs for the stock policy, in milliseconds. Zero disables the
/// corresponding mechanism.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PolicyConfig {
    /// Minimum time between trigger commands from one connection.
    #[serde(default)]
    pub min_trigger_interval_ms: u64,

    /// How long a `Freeze` action suspends command processing.
    #[serde(default)]
    pub freeze_ms: u64,

    /// Connections idle longer than this are closed.
    #[serde(default)]
    pub keep_alive_ms: u64,
}
