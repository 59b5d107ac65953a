use crate::error::{MuxRpcError, Result};
use std::time::Duration;

/// Default cap on a single RPC message payload.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default number of transient errors remembered per session.
pub const DEFAULT_ERROR_WINDOW_CAPACITY: usize = 5;

/// Default span within which a full error window trips.
pub const DEFAULT_ERROR_WINDOW_THRESHOLD: Duration = Duration::from_secs(10);

/// Configuration for a multiplexed session.
///
/// # Examples
///
/// ```rust
/// use muxrpc::{Config, ConfigBuilder};
/// use std::time::Duration;
///
/// let config = Config::default();
/// assert_eq!(config.version, 1);
/// assert!(config.enable_keep_alive);
///
/// let config = ConfigBuilder::new()
///     .keep_alive_interval(Duration::from_secs(30))
///     .keep_alive_timeout(Duration::from_secs(90))
///     .max_frame_size(16 * 1024)
///     .build()
///     .expect("Valid configuration");
/// assert_eq!(config.max_frame_size, 16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub version: u8,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub max_frame_size: usize,
    /// Outgoing frames queued for the writer task before senders wait.
    pub send_queue_size: usize,
    /// Peer-opened streams buffered until `accept_stream` picks them up.
    pub accept_backlog: usize,
    pub enable_keep_alive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            keep_alive_interval: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(30),
            max_frame_size: 32 * 1024, // 32KB
            send_queue_size: 1024,
            accept_backlog: 16,
            enable_keep_alive: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(MuxRpcError::Config("Version cannot be 0".to_string()));
        }

        if self.enable_keep_alive && self.keep_alive_timeout <= self.keep_alive_interval {
            return Err(MuxRpcError::Config(
                "Keep-alive timeout must be greater than keep-alive interval".to_string(),
            ));
        }

        if self.enable_keep_alive && self.keep_alive_interval.is_zero() {
            return Err(MuxRpcError::Config(
                "Keep-alive interval cannot be 0".to_string(),
            ));
        }

        if self.max_frame_size <= crate::frame::HEADER_SIZE {
            return Err(MuxRpcError::Config(
                "Max frame size must leave room for a payload".to_string(),
            ));
        }

        // The length field on the wire is a u16.
        if self.max_frame_size > crate::frame::HEADER_SIZE + u16::MAX as usize {
            return Err(MuxRpcError::Config(
                "Max frame size cannot exceed 64KB plus header".to_string(),
            ));
        }

        if self.send_queue_size == 0 {
            return Err(MuxRpcError::Config(
                "Send queue size cannot be 0".to_string(),
            ));
        }

        if self.accept_backlog == 0 {
            return Err(MuxRpcError::Config(
                "Accept backlog cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for creating custom `Config` instances.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn version(mut self, version: u8) -> Self {
        self.config.version = version;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn send_queue_size(mut self, size: usize) -> Self {
        self.config.send_queue_size = size;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn enable_keep_alive(mut self, enable: bool) -> Self {
        self.config.enable_keep_alive = enable;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`Conn`](crate::Conn).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub session: Config,
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            session: Config::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.max_message_size == 0 {
            return Err(MuxRpcError::Config(
                "Max message size cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options for [`Server`](crate::Server).
///
/// The error window decides when a session producing transient accept errors
/// is abandoned: once `error_window_capacity` errors have been recorded, the
/// session is closed if they all fall within `error_window_threshold`.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub session: Config,
    pub max_message_size: usize,
    pub error_window_capacity: usize,
    pub error_window_threshold: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            session: Config::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            error_window_capacity: DEFAULT_ERROR_WINDOW_CAPACITY,
            error_window_threshold: DEFAULT_ERROR_WINDOW_THRESHOLD,
        }
    }
}

impl ServerOptions {
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder {
            options: ServerOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.max_message_size == 0 {
            return Err(MuxRpcError::Config(
                "Max message size cannot be 0".to_string(),
            ));
        }
        if self.error_window_capacity == 0 {
            return Err(MuxRpcError::Config(
                "Error window capacity cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ServerOptions`].
pub struct ServerOptionsBuilder {
    options: ServerOptions,
}

impl ServerOptionsBuilder {
    pub fn session(mut self, config: Config) -> Self {
        self.options.session = config;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.options.max_message_size = size;
        self
    }

    pub fn error_window_capacity(mut self, capacity: usize) -> Self {
        self.options.error_window_capacity = capacity;
        self
    }

    pub fn error_window_threshold(mut self, threshold: Duration) -> Self {
        self.options.error_window_threshold = threshold;
        self
    }

    pub fn build(self) -> Result<ServerOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
