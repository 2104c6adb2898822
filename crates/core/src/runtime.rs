use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Execution backends a host integration may declare for its collaborators.
///
/// Hosts state up front which providers exist and consult the static fallback
/// order below; the core performs no runtime capability discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    Cpu,
    Gpu,
    Npu,
}

impl ExecutionProvider {
    /// Providers to try, in order, when the preferred one is unavailable.
    /// Every chain ends at `Cpu`.
    pub fn fallback_chain(self) -> &'static [ExecutionProvider] {
        match self {
            ExecutionProvider::Cpu => &[ExecutionProvider::Cpu],
            ExecutionProvider::Gpu => &[ExecutionProvider::Gpu, ExecutionProvider::Cpu],
            ExecutionProvider::Npu => &[
                ExecutionProvider::Npu,
                ExecutionProvider::Gpu,
                ExecutionProvider::Cpu,
            ],
        }
    }
}
