use tch::Device;
use tracing::{ info, warn };

/// One-shot process setup: seed, intra-op threads and the training device.
/// A CPU fallback is logged at warn level, never silently.
pub fn setup(seed: i64) -> Device {
    tch::manual_seed(seed);

    let threads = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1);
    tch::set_num_threads(threads);

    let device = Device::cuda_if_available();
    match device {
        Device::Cuda(ordinal) => info!("training on cuda:{ordinal} with {threads} threads"),
        _ => warn!("CUDA unavailable, training on CPU with {threads} threads"),
    }

    device
}
