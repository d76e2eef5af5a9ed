//! Compute device selection
//!
//! Resolved once at construction and passed down, never queried ad hoc
//! mid-run. `Auto` prefers CUDA and falls back to CPU the way ONNX Runtime
//! resolves its execution-provider list; forcing `Cuda` makes session
//! creation fail instead of silently running on CPU.

use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use serde::{Deserialize, Serialize};

/// Compute device the model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CUDA if available, otherwise CPU
    Auto,
    /// CUDA only; loading fails when no CUDA device is usable
    Cuda,
    /// CPU only
    Cpu,
}

impl Default for Device {
    fn default() -> Self {
        Device::Auto
    }
}

impl Device {
    /// Execution providers to register, in preference order
    pub(crate) fn execution_providers(self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Device::Auto => vec![
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
            Device::Cuda => vec![CUDAExecutionProvider::default()
                .build()
                .error_on_failure()],
            Device::Cpu => vec![CPUExecutionProvider::default().build()],
        }
    }

    /// Label for log messages
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Device::Auto => "auto (cuda or cpu)",
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_serde() {
        assert_eq!(serde_json::to_string(&Device::Cuda).unwrap(), "\"cuda\"");
        let device: Device = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(device, Device::Auto);
    }

    #[test]
    fn test_provider_ordering() {
        assert_eq!(Device::Auto.execution_providers().len(), 2);
        assert_eq!(Device::Cuda.execution_providers().len(), 1);
        assert_eq!(Device::Cpu.execution_providers().len(), 1);
    }
}
