//! Backend detection and auto-selection.

use tracing::{debug, warn};

use super::Backend;

/// Environment variable that overrides `Backend::Auto` resolution.
pub const BACKEND_ENV: &str = "MACENKO_BACKEND";

/// Information about a compute backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Backend type.
    pub backend: Backend,
    /// Human-readable name.
    pub name: &'static str,
    /// Whether backend is available.
    pub available: bool,
    /// Priority for auto-selection (higher = preferred).
    pub priority: u32,
    /// Description.
    pub description: &'static str,
}

/// Detect all available backends.
pub fn detect_backends() -> Vec<BackendInfo> {
    #[allow(unused_mut)]
    let mut backends = vec![
        BackendInfo {
            backend: Backend::Cpu,
            name: "CPU",
            available: true,
            priority: 10,
            description: "CPU with rayon parallelization",
        },
    ];

    #[cfg(feature = "wgpu")]
    {
        let wgpu_available = super::WgpuPrimitives::is_available();
        backends.push(BackendInfo {
            backend: Backend::Wgpu,
            name: "wgpu",
            available: wgpu_available,
            priority: if wgpu_available { 100 } else { 0 },
            description: "GPU via wgpu (Vulkan/Metal/DX12)",
        });
    }

    backends.sort_by(|a, b| b.priority.cmp(&a.priority));
    backends
}

/// Select the best available backend.
///
/// `MACENKO_BACKEND=cpu|wgpu` takes precedence when the named backend is
/// available.
pub fn select_best_backend() -> Backend {
    if let Some(forced) = env_override() {
        return forced;
    }

    detect_backends()
        .into_iter()
        .filter(|b| b.available)
        .max_by_key(|b| b.priority)
        .map(|b| b.backend)
        .unwrap_or(Backend::Cpu)
}

/// Get description of available backends.
pub fn describe_backends() -> String {
    let backends = detect_backends();
    let mut desc = String::new();

    for info in backends {
        let status = if info.available { "+" } else { "-" };
        desc.push_str(&format!("[{}] {}: {}\n", status, info.name, info.description));
    }

    desc
}

fn env_override() -> Option<Backend> {
    parse_override(&std::env::var(BACKEND_ENV).ok()?)
}

/// Backend named by an override value, if it is concrete and available.
fn parse_override(value: &str) -> Option<Backend> {
    match Backend::from_name(value) {
        Some(Backend::Auto) => None,
        Some(backend) if backend.is_available() => {
            debug!(backend = backend.name(), "Backend forced by {}", BACKEND_ENV);
            Some(backend)
        }
        Some(backend) => {
            warn!(backend = backend.name(), "{} names an unavailable backend, ignoring", BACKEND_ENV);
            None
        }
        None => {
            warn!(value = %value, "Unrecognized {} value, ignoring", BACKEND_ENV);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_detected() {
        let backends = detect_backends();
        assert!(backends.iter().any(|b| b.backend == Backend::Cpu && b.available));
        assert!(backends.windows(2).all(|w| w[0].priority >= w[1].priority));
    }

    #[test]
    fn test_describe_lists_cpu() {
        let desc = describe_backends();
        assert!(desc.contains("[+] CPU"));
    }

    #[test]
    fn test_override_values() {
        assert_eq!(parse_override("cpu"), Some(Backend::Cpu));
        assert_eq!(parse_override(" CPU "), Some(Backend::Cpu));
        // auto defers to detection
        assert_eq!(parse_override("auto"), None);
        assert_eq!(parse_override("cuda"), None);
        assert_eq!(parse_override(""), None);
    }

    #[test]
    fn test_override_wgpu_follows_availability() {
        let expected = Backend::Wgpu.is_available().then_some(Backend::Wgpu);
        assert_eq!(parse_override("wgpu"), expected);
        assert_eq!(parse_override("gpu"), expected);
    }
}
