// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.

/// Default stack size for spawned strands.
const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Per-instance configuration, passed to [`run_with`](crate::run_with) or
/// [`spawn_scheduler_with`](crate::spawn_scheduler_with).
#[derive(Debug, Clone)]
pub struct Config {
    stack_size: usize,
}

impl Config {
    pub fn new() -> Self {
        Config {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Stack size for each strand's execution context. Values below the
    /// platform minimum are raised by the OS.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub(crate) fn stack_bytes(&self) -> usize {
        self.stack_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
