//! Where the SIDESPLITTER binary lives, how to build it and how to run it.

use crate::error::WorkflowError;
use crate::invoker::{ArgumentMap, ExternalTool, ToolEnviron};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable pointing at the tool installation.
pub const HOME_VAR: &str = "SIDESPLITTER_HOME";

/// Environment variable for the root of all EM software installs.
pub const EM_ROOT_VAR: &str = "EM_ROOT";

/// Program name inside the tool home.
pub const PROGRAM_NAME: &str = "sidesplitter";

/// Reference to cite when publishing results produced with the filter.
pub const CITATION: &str = r#"@article{Ramlaul2020,
title = "Mitigating Local Over-fitting During Single Particle Reconstruction with SIDESPLITTER",
journal = "BioRxiv",
year = "2020",
doi = "https://dx.doi.org/10.1101/2019.12.12.874081",
url = "https://www.biorxiv.org/content/10.1101/2019.12.12.874081v2",
author = "Kailash Ramlaul, Colin M. Palmer and Christopher H. S. Aylett",
}"#;

/// How a released version of the tool is unpacked and compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPackage {
    pub name: &'static str,
    pub version: &'static str,
    /// Source archive, expected next to the tool home.
    pub tarball: &'static str,
    /// Build script run with `$SHELL` inside the tool home.
    pub build_script: &'static str,
    /// Files the build must produce.
    pub targets: &'static [&'static str],
}

impl BinaryPackage {
    /// The only supported release.
    pub const V1_0: BinaryPackage = BinaryPackage {
        name: "sidesplitter",
        version: "1.0",
        tarball: "sidesplitter_v1.0.tgz",
        build_script: "compile.sh",
        targets: &[PROGRAM_NAME],
    };

    /// Directory name of the installation, e.g. `sidesplitter-1.0`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// Resolved location of the tool installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPlugin {
    home: PathBuf,
    package: BinaryPackage,
}

impl ToolPlugin {
    /// Uses `home` as the installation directory. A relative `home` is
    /// taken relative to the current directory.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: absolute(home.into()),
            package: BinaryPackage::V1_0,
        }
    }

    /// Resolves the home from `SIDESPLITTER_HOME`, falling back to
    /// `$EM_ROOT/sidesplitter-1.0` and then `software/em/sidesplitter-1.0`.
    pub fn from_env() -> Self {
        let package = BinaryPackage::V1_0;
        let home = std::env::var_os(HOME_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os(EM_ROOT_VAR)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("software").join("em"))
                    .join(package.dir_name())
            });
        Self {
            home: absolute(home),
            package,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn package(&self) -> &BinaryPackage {
        &self.package
    }

    /// Full path of the filter binary.
    pub fn program(&self) -> PathBuf {
        self.home.join(PROGRAM_NAME)
    }

    /// Inherited environment with the tool home first on `PATH`.
    pub fn environ(&self) -> ToolEnviron {
        let mut environ = ToolEnviron::new();
        environ.prepend_path("PATH", &self.home);
        environ
    }

    /// The filter binary ready to be invoked.
    pub fn tool(&self) -> ExternalTool {
        ExternalTool::new(self.program(), self.environ())
    }

    /// `true` when every build target exists.
    pub fn is_installed(&self) -> bool {
        self.package
            .targets
            .iter()
            .all(|target| self.home.join(target).is_file())
    }

    /// Unpacks (if needed) and compiles the tool.
    ///
    /// The source archive is looked up next to the home directory. Already
    /// installed tools are left untouched.
    pub async fn install(&self) -> Result<(), WorkflowError> {
        if self.is_installed() {
            info!("{} already installed in {}", self.package.name, self.home.display());
            return Ok(());
        }

        if !self.home.is_dir() {
            self.unpack().await?;
        }

        let shell = std::env::var_os("SHELL").unwrap_or_else(|| "bash".into());
        let mut args = ArgumentMap::new();
        args.switch(self.package.build_script);
        ExternalTool::new(shell, ToolEnviron::new())
            .with_log_file(self.home.join("install.log"))
            .invoke(&args, &self.home, 1)
            .await?;

        for target in self.package.targets {
            let path = self.home.join(target);
            if !path.is_file() {
                return Err(WorkflowError::MissingOutput {
                    path,
                    details: format!("{} did not produce it", self.package.build_script),
                });
            }
        }
        info!("Installed {} {}", self.package.name, self.package.version);
        Ok(())
    }

    async fn unpack(&self) -> Result<(), WorkflowError> {
        let parent = self
            .home
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let tarball = parent.join(self.package.tarball);
        if !tarball.is_file() {
            return Err(WorkflowError::Configuration(format!(
                "{} is not installed and '{}' was not found",
                self.package.name,
                tarball.display()
            )));
        }

        let mut args = ArgumentMap::new();
        args.insert("-xzf", self.package.tarball);
        ExternalTool::new("tar", ToolEnviron::new())
            .invoke(&args, parent, 1)
            .await
    }
}

/// Resolves `path` against the current directory, not the scratch directory
/// the filter later runs in.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(e) => {
            warn!("Cannot resolve '{}' against the current directory: {}", path.display(), e);
            path
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_and_environ() {
        let plugin = ToolPlugin::with_home("/opt/em/sidesplitter-1.0");
        assert_eq!(
            plugin.program(),
            PathBuf::from("/opt/em/sidesplitter-1.0/sidesplitter")
        );
        let path = plugin.environ().get("PATH").cloned().unwrap();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, PathBuf::from("/opt/em/sidesplitter-1.0"));
        assert_eq!(plugin.tool().program(), plugin.program().as_path());
    }

    #[test]
    fn test_relative_home_is_made_absolute() {
        let plugin = ToolPlugin::with_home("tools/sidesplitter-1.0");
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(plugin.home(), cwd.join("tools/sidesplitter-1.0"));
        assert!(plugin.program().is_absolute());
        assert!(plugin.tool().program().is_absolute());

        let path = plugin.environ().get("PATH").cloned().unwrap();
        let first = std::env::split_paths(&path).next().unwrap();
        assert!(first.is_absolute());
    }

    #[test]
    fn test_package_dir_name() {
        assert_eq!(BinaryPackage::V1_0.dir_name(), "sidesplitter-1.0");
        assert!(CITATION.contains("Ramlaul2020"));
    }

    #[tokio::test]
    async fn test_install_without_sources_fails() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = ToolPlugin::with_home(dir.path().join("sidesplitter-1.0"));
        assert!(!plugin.is_installed());
        let err = plugin.install().await.unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_runs_build_script() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("sidesplitter-1.0");
        std::fs::create_dir(&home).unwrap();
        std::fs::write(
            home.join("compile.sh"),
            "printf '#!/bin/sh\\nexit 0\\n' > sidesplitter\nchmod +x sidesplitter\n",
        )
        .unwrap();

        let plugin = ToolPlugin::with_home(&home);
        plugin.install().await.unwrap();
        assert!(plugin.is_installed());
        // second call is a no-op
        plugin.install().await.unwrap();
    }
}
