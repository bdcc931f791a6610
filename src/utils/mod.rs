use std::io::Write;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;

use crate::error::Result;

pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Progress callback that prints one dot to stderr per `1 / n_steps` of
/// progress and a newline on completion.
pub fn progress_dots(n_steps: usize) -> impl FnMut(f32) {
    let n_steps = n_steps.max(1);
    let mut printed = 0usize;
    move |fraction: f32| {
        let target = dots_for(fraction, n_steps);
        if target > printed {
            let mut err = std::io::stderr().lock();
            let _ = err.write_all(".".repeat(target - printed).as_bytes());
            if target == n_steps {
                let _ = err.write_all(b"\n");
            }
            let _ = err.flush();
            printed = target;
        }
    }
}

fn dots_for(fraction: f32, n_steps: usize) -> usize {
    ((fraction.clamp(0.0, 1.0) * n_steps as f32) as usize).min(n_steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_when_forced() {
        assert!(matches!(select_device(true).unwrap(), Device::Cpu));
    }

    #[test]
    fn dot_count_tracks_fraction() {
        assert_eq!(dots_for(0.0, 20), 0);
        assert_eq!(dots_for(0.5, 20), 10);
        assert_eq!(dots_for(1.0, 20), 20);
        assert_eq!(dots_for(7.0, 20), 20);
    }
}
