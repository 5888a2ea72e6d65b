//! Command-line options shared by the `audiovisor` and `tui` binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::ble::BleTransport;
use crate::decode::DecodeStrategy;
use crate::protocol::DEFAULT_BUFFER_CAPACITY;
use crate::session::SessionConfig;
use crate::settings::DEFAULT_SETTINGS_FILE;
use crate::sim::SimTransport;
use crate::transport::Transport;

#[derive(Debug, Clone, Args)]
pub struct SessionArgs {
    /// Use generated sensor data instead of Bluetooth hardware.
    #[arg(long)]
    pub simulate: bool,

    /// Payload format of the firmware: `float` or `ascii`.
    #[arg(long, default_value = "float")]
    pub decoder: DecodeStrategy,

    /// Samples kept per channel.
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    pub buffer: usize,

    /// Rolling-average window in seconds.
    #[arg(long, default_value_t = 600)]
    pub window: u64,

    /// Seconds to scan for a device before giving up.
    #[arg(long, default_value_t = 15)]
    pub scan_timeout: u64,

    /// Accept an extra advertised name (repeatable).
    #[arg(long = "name", value_name = "NAME")]
    pub names: Vec<String>,

    /// Settings file holding sensitivity and brightness.
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: PathBuf,
}

impl SessionArgs {
    pub fn config(&self) -> SessionConfig {
        let mut config = SessionConfig {
            buffer_capacity: self.buffer.max(1),
            rolling_window: Duration::from_secs(self.window.max(1)),
            decoder: self.decoder,
            scan_timeout: Duration::from_secs(self.scan_timeout),
            ..SessionConfig::default()
        };
        config.filter.names.extend(self.names.iter().cloned());
        config
    }

    pub fn transport(&self, config: &SessionConfig) -> Arc<dyn Transport> {
        if self.simulate {
            Arc::new(SimTransport::synthetic())
        } else {
            Arc::new(BleTransport::new(config.scan_timeout))
        }
    }
}
