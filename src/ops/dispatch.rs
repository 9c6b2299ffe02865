//! Kernel Dispatch Layer
//!
//! Selects the backend for each primitive from the kind of the engine it was
//! compiled for.
//!
//! # Behavior
//! 1. `Gpu` engines try the `wgpu` backend first (if the feature is enabled);
//!    kernels it does not implement, or any GPU failure, fall through
//! 2. Everything lands on the `Cpu` backend otherwise
//!
//! The fallback is deterministic: a kernel either runs fully on one backend or
//! fully on the CPU.

use super::Kernel;
use crate::engine::EngineKind;

/// Runs `kernel` for an engine of `kind`.
///
/// # Errors
/// The backend's description of why the kernel could not run.
pub fn run(kind: EngineKind, kernel: &Kernel<'_>, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, String> {
    match kind {
        EngineKind::Gpu => {
            #[cfg(feature = "wgpu")]
            {
                if let Some(result) = super::wgpu::run(kernel, inputs) {
                    return Ok(result);
                }
            }
        }
        EngineKind::Cpu => {}
    }

    super::cpu::run(kernel, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_engines_fall_back_to_cpu_results() {
        let inputs = vec![vec![-1.0, 2.0]];
        let kernel = Kernel::ReluForward { alpha: 0.0 };
        assert_eq!(
            run(EngineKind::Gpu, &kernel, &inputs).unwrap(),
            run(EngineKind::Cpu, &kernel, &inputs).unwrap()
        );
    }
}
