use crate::error::{Error, Result};

/// Pool configuration. Worker count and queue size are fixed once the pool
/// has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub num_workers: usize,
    /// Intake capacity. `0` makes every submission a direct hand-off to a
    /// ready worker.
    pub queue_size: usize,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            queue_size: 10,
            thread_name_prefix: "workpool-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// One worker per logical CPU, everything else default.
    pub fn per_cpu() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(Error::config("num_workers must be > 0"));
        }
        if let Some(0) = self.stack_size {
            return Err(Error::config("stack_size must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.num_workers = n;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.queue_size = size;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
