use std::fmt;

use crate::domain::updater::UpdateError;

/// Architectures with published release artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn detect() -> Result<Self, UpdateError> {
        Self::from_target(std::env::consts::ARCH)
    }

    pub fn from_target(arch: &str) -> Result<Self, UpdateError> {
        match arch {
            "x86_64" => Ok(Arch::Amd64),
            "aarch64" => Ok(Arch::Arm64),
            other => Err(UpdateError::UnsupportedArch(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expand the release URL template for a version tag (with or without a
/// leading `v`) and architecture.
pub fn artifact_url(template: &str, version: &str, arch: Arch) -> String {
    template
        .replace("{version}", version.trim_start_matches('v'))
        .replace("{arch}", arch.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_rust_arch_names() {
        assert_eq!(Arch::from_target("x86_64").unwrap(), Arch::Amd64);
        assert_eq!(Arch::from_target("aarch64").unwrap(), Arch::Arm64);
        assert!(matches!(
            Arch::from_target("riscv64"),
            Err(UpdateError::UnsupportedArch(a)) if a == "riscv64"
        ));
    }

    #[test]
    fn expands_template() {
        let url = artifact_url(
            "https://example.com/releases/download/v{version}/edge-agent-linux-{arch}",
            "v1.4.0",
            Arch::Arm64,
        );
        assert_eq!(
            url,
            "https://example.com/releases/download/v1.4.0/edge-agent-linux-arm64"
        );
    }
}
