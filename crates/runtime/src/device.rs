//! Description of the execution target used by launch heuristics.

use rayon::current_num_threads;

/// Parallel capacity of the device executing a launch.
///
/// `compute_units` plays the role of the streaming-multiprocessor count in the
/// split-KV heuristic and of the persistent-program cap in the layer norm
/// forward kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub name: String,
    pub compute_units: usize,
}

impl DeviceProfile {
    /// Profile of the host rayon pool.
    pub fn host() -> Self {
        Self {
            name: "host".to_string(),
            compute_units: current_num_threads().max(1),
        }
    }

    pub fn with_compute_units(mut self, compute_units: usize) -> Self {
        self.compute_units = compute_units.max(1);
        self
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::host()
    }
}
