use std::time::Duration;

/// Default swap-buffer size for reads submitted without a caller buffer.
pub const DEFAULT_SWAP_BUFFER_SIZE: usize = 64 * 1024;

/// Default interval for the dropped-handle sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a [`Watcher`](crate::Watcher).
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of each of the two internal swap buffers. A read
    /// submitted without a buffer receives at most this many bytes per
    /// completion.
    pub swap_buffer_size: usize,
    /// How often the loop sweeps for connection handles the caller has
    /// dropped. A swept connection has its descriptor released as if
    /// `free` had been called.
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            swap_buffer_size: DEFAULT_SWAP_BUFFER_SIZE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}
