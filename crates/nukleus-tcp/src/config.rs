use nukleus_timing::Duration;

use crate::errors::ConfigError;

/// Recognized configuration options. Sizing fields that back a shared-memory
/// ring must be powers of two.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub max_connections: usize,
    pub window_size: i32,
    pub window_padding: i32,
    pub max_message_length: usize,
    pub command_buffer_capacity: usize,
    pub response_buffer_capacity: usize,
    pub counter_values_buffer_capacity: usize,
    pub streams_buffer_capacity: usize,
    pub reconnect_interval: Duration,
    pub connect_retry_budget: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            window_size: 64 * 1024,
            window_padding: 0,
            max_message_length: 64 * 1024,
            command_buffer_capacity: 1024,
            response_buffer_capacity: 1024,
            counter_values_buffer_capacity: 4096,
            streams_buffer_capacity: 4096,
            reconnect_interval: Duration::from_secs(2),
            connect_retry_budget: 8,
        }
    }
}

impl TcpConfig {
    pub fn builder() -> TcpConfigBuilder {
        TcpConfigBuilder { cfg: Self::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        if self.window_size <= 0 {
            return Err(ConfigError::InvalidWindowSize);
        }
        if self.max_message_length == 0 {
            return Err(ConfigError::InvalidMaxMessageLength);
        }
        for (field, value) in [
            ("commandBufferCapacity", self.command_buffer_capacity),
            ("responseBufferCapacity", self.response_buffer_capacity),
            ("counterValuesBufferCapacity", self.counter_values_buffer_capacity),
            ("streamsBufferCapacity", self.streams_buffer_capacity),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::CapacityNotPowerOfTwo { field, value });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TcpConfigBuilder {
    cfg: TcpConfig,
}

impl TcpConfigBuilder {
    pub fn max_connections(mut self, v: usize) -> Self {
        self.cfg.max_connections = v;
        self
    }

    pub fn window_size(mut self, v: i32) -> Self {
        self.cfg.window_size = v;
        self
    }

    pub fn window_padding(mut self, v: i32) -> Self {
        self.cfg.window_padding = v;
        self
    }

    pub fn max_message_length(mut self, v: usize) -> Self {
        self.cfg.max_message_length = v;
        self
    }

    pub fn command_buffer_capacity(mut self, v: usize) -> Self {
        self.cfg.command_buffer_capacity = v;
        self
    }

    pub fn response_buffer_capacity(mut self, v: usize) -> Self {
        self.cfg.response_buffer_capacity = v;
        self
    }

    pub fn counter_values_buffer_capacity(mut self, v: usize) -> Self {
        self.cfg.counter_values_buffer_capacity = v;
        self
    }

    pub fn streams_buffer_capacity(mut self, v: usize) -> Self {
        self.cfg.streams_buffer_capacity = v;
        self
    }

    pub fn reconnect_interval(mut self, v: Duration) -> Self {
        self.cfg.reconnect_interval = v;
        self
    }

    pub fn connect_retry_budget(mut self, v: u32) -> Self {
        self.cfg.connect_retry_budget = v;
        self
    }

    pub fn build(self) -> Result<TcpConfig, ConfigError> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
