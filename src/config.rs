use crate::error::StoreError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Point reads see committed state plus the reader's own writes.
    #[default]
    ReadCommitted,
    /// Transactional point reads also take the row lock, holding it until
    /// the transaction ends.
    RepeatableRead,
}

/// Runtime configuration for a structdb database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub update_many_batch_size: usize,
    pub migration_batch_size: usize,
    pub read_page_size: usize,
    pub lock_timeout: Duration,
    pub isolation_level: IsolationLevel,
    pub cache_capacity_per_type: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            update_many_batch_size: 500,
            migration_batch_size: 500,
            read_page_size: 500,
            lock_timeout: Duration::from_secs(5),
            isolation_level: IsolationLevel::ReadCommitted,
            cache_capacity_per_type: 1024,
        }
    }
}

impl DatabaseConfig {
    /// Short lock waits so contention shows up quickly in tests and local runs.
    pub fn development() -> Self {
        Self {
            lock_timeout: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// Larger batches and pages for offline rewrites of big structure sets.
    pub fn bulk_load() -> Self {
        Self {
            update_many_batch_size: 2_000,
            migration_batch_size: 2_000,
            read_page_size: 2_000,
            lock_timeout: Duration::from_secs(30),
            ..Self::default()
        }
    }

    pub fn with_update_many_batch_size(mut self, batch_size: usize) -> Self {
        self.update_many_batch_size = batch_size;
        self
    }

    pub fn with_migration_batch_size(mut self, batch_size: usize) -> Self {
        self.migration_batch_size = batch_size;
        self
    }

    pub fn with_read_page_size(mut self, page_size: usize) -> Self {
        self.read_page_size = page_size;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_cache_capacity_per_type(mut self, capacity: usize) -> Self {
        self.cache_capacity_per_type = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.update_many_batch_size == 0 {
            return Err(StoreError::InvalidConfig {
                message: "update_many_batch_size must be > 0".into(),
            });
        }
        if self.migration_batch_size == 0 {
            return Err(StoreError::InvalidConfig {
                message: "migration_batch_size must be > 0".into(),
            });
        }
        if self.read_page_size == 0 {
            return Err(StoreError::InvalidConfig {
                message: "read_page_size must be > 0".into(),
            });
        }
        if self.lock_timeout.is_zero() {
            return Err(StoreError::InvalidConfig {
                message: "lock_timeout must be > 0".into(),
            });
        }
        if self.cache_capacity_per_type == 0 {
            return Err(StoreError::InvalidConfig {
                message: "cache_capacity_per_type must be > 0".into(),
            });
        }
        Ok(())
    }
}
