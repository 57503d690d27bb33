//! Server and system configuration with synchronous validation.
//!
//! Construction is infallible; [`ServerSettings::validate`] is called by the
//! runtime before any task is spawned and rejects impossible configurations
//! with [`ConfigError`], so a misconfigured server never gets as far as
//! binding a socket.

use std::time::Duration;

use thiserror::Error;

use crate::volume::Watermarks;

/// Default connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default low watermark, as a fraction of `max_connections`.
pub const DEFAULT_LOW_WATERMARK: f64 = 0.75;

/// Default high watermark, as a fraction of `max_connections`.
pub const DEFAULT_HIGH_WATERMARK: f64 = 0.85;

/// Default idle bound applied while the server is in `HighWater`.
pub const DEFAULT_HIGH_WATER_MAX_IDLE_TIME: Duration = Duration::from_millis(100);

/// Impossible configuration, detected synchronously at startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A watermark percentage is outside `[0, 1]`.
    #[error("{which} watermark percentage {value} is outside [0, 1]")]
    PercentageOutOfRange {
        /// Which percentage ("low" or "high").
        which: &'static str,
        /// The offending value.
        value: f64,
    },

    /// The low watermark exceeds the high one.
    #[error("low watermark percentage {low} exceeds high watermark percentage {high}")]
    WatermarkOrder {
        /// Low percentage.
        low: f64,
        /// High percentage.
        high: f64,
    },

    /// The high-water idle bound is zero.
    #[error("high-water max idle time must be non-zero")]
    ZeroHighWaterIdleTime,

    /// A name is empty.
    #[error("{0} name must not be empty")]
    EmptyName(&'static str),
}

/// Settings for one listening server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Name, used to namespace the server's metrics and log events.
    pub name: String,
    /// Interface to bind, e.g. `"0.0.0.0"` or `"127.0.0.1"`.
    pub interface: String,
    /// Port to bind; `0` picks an ephemeral port.
    pub port: u16,
    /// Hard admission cap. Sockets accepted beyond it are closed
    /// immediately, never surfaced to a worker.
    pub max_connections: usize,
    /// Idle bound while in `Normal`; `None` means connections never idle
    /// out under normal volume.
    pub max_idle_time: Option<Duration>,
    /// Fraction of `max_connections` at which `HighWater` clears.
    pub low_watermark_percentage: f64,
    /// Fraction of `max_connections` at which `HighWater` sets.
    pub high_watermark_percentage: f64,
    /// Idle bound while in `HighWater`; always finite.
    pub high_water_max_idle_time: Duration,
    /// Listen backlog; `None` leaves it to a conservative default.
    pub tcp_backlog_size: Option<u32>,
}

impl ServerSettings {
    /// Settings for `name` on `port`, everything else defaulted.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            interface: "0.0.0.0".to_string(),
            port,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_idle_time: None,
            low_watermark_percentage: DEFAULT_LOW_WATERMARK,
            high_watermark_percentage: DEFAULT_HIGH_WATERMARK,
            high_water_max_idle_time: DEFAULT_HIGH_WATER_MAX_IDLE_TIME,
            tcp_backlog_size: None,
        }
    }

    /// Sets the admission cap.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the normal-volume idle bound.
    #[must_use]
    pub fn with_max_idle_time(mut self, bound: Duration) -> Self {
        self.max_idle_time = Some(bound);
        self
    }

    /// Sets both watermark percentages.
    #[must_use]
    pub fn with_watermarks(mut self, low: f64, high: f64) -> Self {
        self.low_watermark_percentage = low;
        self.high_watermark_percentage = high;
        self
    }

    /// Sets the high-water idle bound.
    #[must_use]
    pub fn with_high_water_max_idle_time(mut self, bound: Duration) -> Self {
        self.high_water_max_idle_time = bound;
        self
    }

    /// Sets the bind interface.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// Sets the listen backlog.
    #[must_use]
    pub fn with_tcp_backlog_size(mut self, backlog: u32) -> Self {
        self.tcp_backlog_size = Some(backlog);
        self
    }

    /// Check every invariant the runtime relies on.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName("server"));
        }

        for (which, value) in [
            ("low", self.low_watermark_percentage),
            ("high", self.high_watermark_percentage),
        ] {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                return Err(ConfigError::PercentageOutOfRange { which, value });
            }
        }

        if self.low_watermark_percentage > self.high_watermark_percentage {
            return Err(ConfigError::WatermarkOrder {
                low: self.low_watermark_percentage,
                high: self.high_watermark_percentage,
            });
        }

        if self.high_water_max_idle_time.is_zero() {
            return Err(ConfigError::ZeroHighWaterIdleTime);
        }

        Ok(())
    }

    /// Absolute watermark thresholds for these settings.
    pub fn watermarks(&self) -> Watermarks {
        Watermarks::derive(
            self.max_connections,
            self.low_watermark_percentage,
            self.high_watermark_percentage,
        )
    }
}

/// Settings for one I/O system.
#[derive(Debug, Clone)]
pub struct IoSystemConfig {
    /// Name, used to namespace logs and metrics.
    pub name: String,
    /// Worker pool size; `None` uses the hardware parallelism. `0` is
    /// accepted for tests but such a system cannot host connections.
    pub num_workers: Option<usize>,
}

impl IoSystemConfig {
    /// Config named `name` with the worker count defaulted.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), num_workers: None }
    }

    /// Sets an explicit worker count.
    #[must_use]
    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = Some(workers);
        self
    }

    /// Check the config.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyName`] if the name is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName("io system"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert_eq!(ServerSettings::new("web", 8080).validate(), Ok(()));
        assert_eq!(IoSystemConfig::new("sys").validate(), Ok(()));
    }

    #[test]
    fn rejects_percentage_out_of_range() {
        let settings = ServerSettings::new("web", 8080).with_watermarks(-0.1, 0.8);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::PercentageOutOfRange { which: "low", .. })
        ));

        let settings = ServerSettings::new("web", 8080).with_watermarks(0.5, 1.5);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::PercentageOutOfRange { which: "high", .. })
        ));
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let settings = ServerSettings::new("web", 8080).with_watermarks(0.9, 0.5);
        assert!(matches!(settings.validate(), Err(ConfigError::WatermarkOrder { .. })));
    }

    #[test]
    fn rejects_zero_highwater_idle_time() {
        let settings =
            ServerSettings::new("web", 8080).with_high_water_max_idle_time(Duration::ZERO);
        assert_eq!(settings.validate(), Err(ConfigError::ZeroHighWaterIdleTime));
    }

    #[test]
    fn rejects_empty_names() {
        assert_eq!(ServerSettings::new("", 8080).validate(), Err(ConfigError::EmptyName("server")));
        assert_eq!(IoSystemConfig::new("").validate(), Err(ConfigError::EmptyName("io system")));
    }

    #[test]
    fn watermarks_derive_from_settings() {
        let settings =
            ServerSettings::new("web", 8080).with_max_connections(10).with_watermarks(0.5, 0.8);
        assert_eq!(settings.watermarks(), Watermarks { low: 5, high: 8 });
    }
}
