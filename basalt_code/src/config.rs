//! Code cache configuration.
//!
//! All sizes are fixed at startup: code regions never grow, and the
//! runtime region's capacity is the hard ceiling after which compilation
//! is fatal. Choose generously.

/// Configuration for the code cache.
///
/// # Example
///
/// ```ignore
/// use basalt_code::CodeConfig;
///
/// // Server configuration with a larger runtime region
/// let config = CodeConfig {
///     runtime_region_size: 128 * 1024 * 1024,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CodeConfig {
    // =========================================================================
    // Region Capacities
    // =========================================================================
    /// Capacity of the boot code region in bytes.
    ///
    /// Holds methods compiled while the VM is bootstrapping. Bound at
    /// manager construction and never resized.
    ///
    /// Default: 4MB
    pub boot_region_size: usize,

    /// Capacity of the runtime code region in bytes.
    ///
    /// Every method compiled after bootstrap lands here. There is no
    /// eviction or compaction: exhausting this region terminates the
    /// process.
    ///
    /// Default: 32MB
    pub runtime_region_size: usize,

    // =========================================================================
    // Allocation Behavior
    // =========================================================================
    /// Allocate bundles from GC-managed memory so code can be relocated.
    ///
    /// When enabled, the allocation window additionally disables
    /// GC-triggering allocation for the current thread while raw bundle
    /// memory is initialized.
    ///
    /// Default: false
    pub allocate_in_heap: bool,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Trace every bundle allocation to the diagnostic stream.
    ///
    /// Logs the owning method, the address range, and the size.
    ///
    /// Default: false
    pub trace_allocations: bool,
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            boot_region_size: 4 * 1024 * 1024,      // 4MB
            runtime_region_size: 32 * 1024 * 1024,  // 32MB
            allocate_in_heap: false,
            trace_allocations: false,
        }
    }
}

impl CodeConfig {
    /// Create a configuration sized for tests and small embeddings.
    pub fn small() -> Self {
        Self {
            boot_region_size: 256 * 1024,
            runtime_region_size: 1024 * 1024,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.boot_region_size < 64 * 1024 {
            return Err(ConfigError::BootRegionTooSmall);
        }
        if self.runtime_region_size < 256 * 1024 {
            return Err(ConfigError::RuntimeRegionTooSmall);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Boot region capacity is too small (minimum 64KB).
    BootRegionTooSmall,
    /// Runtime region capacity is too small (minimum 256KB).
    RuntimeRegionTooSmall,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::BootRegionTooSmall => {
                write!(f, "boot region must be at least 64KB")
            }
            ConfigError::RuntimeRegionTooSmall => {
                write!(f, "runtime region must be at least 256KB")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
