//! Host platform detection.

use std::path::Path;
use std::sync::OnceLock;

/// Whether we are a Linux userland running on a Windows kernel (WSL).
///
/// Native file notifications are unreliable there, especially for paths that
/// live on the Windows side of the bridge.
pub fn is_wsl() -> bool {
    static WSL: OnceLock<bool> = OnceLock::new();
    *WSL.get_or_init(|| {
        if !cfg!(target_os = "linux") {
            return false;
        }
        if std::env::var_os("WSL_DISTRO_NAME").is_some() || std::env::var_os("WSL_INTEROP").is_some()
        {
            return true;
        }
        ["/proc/sys/kernel/osrelease", "/proc/version"]
            .iter()
            .filter_map(|p| std::fs::read_to_string(Path::new(p)).ok())
            .any(|s| kernel_release_is_wsl(&s))
    })
}

/// Matches kernel release strings such as `5.15.153.1-microsoft-standard-WSL2`.
pub fn kernel_release_is_wsl(release: &str) -> bool {
    let release = release.to_ascii_lowercase();
    release.contains("microsoft") || release.contains("wsl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_wsl_kernels() {
        assert!(kernel_release_is_wsl("5.15.153.1-microsoft-standard-WSL2"));
        assert!(kernel_release_is_wsl("4.4.0-19041-Microsoft"));
        assert!(!kernel_release_is_wsl("6.8.0-45-generic"));
    }
}
