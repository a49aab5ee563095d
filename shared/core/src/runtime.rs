use anyhow::Result;

use crate::blob::BlobRef;
use crate::net::Net;

/// The external multi-threaded graph executor, as seen from graph
/// construction. Scheduling, cancellation and timeouts live behind it.
pub trait NetExecutor {
    /// Executes `net` once, immediately.
    fn run_once(&mut self, net: &Net) -> Result<()>;

    /// Registers `net` for repeated execution under its name.
    fn create_persistent(&mut self, net: &Net) -> Result<()>;

    /// Executes a previously registered net.
    fn run(&mut self, net_name: &str) -> Result<()>;
}

/// Optional post-build memory-reuse pass over the training net, applied once
/// per device namespace.
pub trait MemoryOptimizer {
    fn share_gradient_buffers(
        &self,
        net: &mut Net,
        losses: &[BlobRef],
        namespace: &str,
    ) -> Result<()>;
}
