//! Launching the external filtering program.

use crate::error::WorkflowError;
use indexmap::IndexMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, instrument, warn};

/// Environment variable the filter reads to size its OpenMP thread pool.
pub const THREADS_ENV: &str = "OMP_NUM_THREADS";

/// Command-line flags in the order they were added.
///
/// Each entry renders as `flag value`. A flag with an empty value is a
/// presence-only switch and renders as `flag ` with nothing after it.
///
/// # Examples
///
/// ```
/// use halfmap_filter::ArgumentMap;
///
/// let mut args = ArgumentMap::new();
/// args.insert("--v1", "a.mrc").insert("--v2", "b.mrc").switch("--spectrum");
/// assert_eq!(args.to_string(), "--v1 a.mrc --v2 b.mrc --spectrum ");
/// assert_eq!(args.argv(), vec!["--v1", "a.mrc", "--v2", "b.mrc", "--spectrum"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentMap {
    flags: IndexMap<String, String>,
}

impl ArgumentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `flag` to `value`. Re-setting a flag keeps its original position.
    pub fn insert(&mut self, flag: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.flags.insert(flag.into(), value.into());
        self
    }

    /// Adds a presence-only flag.
    pub fn switch(&mut self, flag: impl Into<String>) -> &mut Self {
        self.insert(flag, "")
    }

    pub fn get(&self, flag: &str) -> Option<&str> {
        self.flags.get(flag).map(String::as_str)
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.flags.contains_key(flag)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.flags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Argument vector for the child process; empty values are dropped.
    pub fn argv(&self) -> Vec<&str> {
        self.iter()
            .flat_map(|(flag, value)| std::iter::once(flag).chain((!value.is_empty()).then_some(value)))
            .collect()
    }
}

impl fmt::Display for ArgumentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (flag, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{flag} {value}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ArgumentMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut args = Self::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}

/// Environment overrides applied on top of the inherited environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolEnviron {
    vars: IndexMap<String, OsString>,
}

impl ToolEnviron {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OsString>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Puts `dir` in front of the current value of the path-list variable `key`.
    pub fn prepend_path(&mut self, key: &str, dir: &Path) -> &mut Self {
        let current = self
            .vars
            .get(key)
            .cloned()
            .or_else(|| std::env::var_os(key));
        let mut entries = vec![dir.to_path_buf()];
        if let Some(current) = current {
            entries.extend(std::env::split_paths(&current));
        }
        match std::env::join_paths(entries) {
            Ok(joined) => {
                self.vars.insert(key.to_string(), joined);
            }
            Err(e) => warn!("Cannot add '{}' to {}: {}", dir.display(), key, e),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&OsString> {
        self.vars.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OsString)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// An external program plus the environment it runs in.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: PathBuf,
    environ: ToolEnviron,
    log_file: Option<PathBuf>,
}

impl ExternalTool {
    pub fn new(program: impl Into<PathBuf>, environ: ToolEnviron) -> Self {
        Self {
            program: program.into(),
            environ,
            log_file: None,
        }
    }

    /// Sends the child's stdout and stderr to `path` (appending).
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs the program in `cwd` and waits for it to exit.
    ///
    /// Relative paths in `args` resolve against `cwd`. Output files are not
    /// checked here.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::ExternalProcess`] if the program cannot be started or
    /// exits with a non-zero status.
    #[instrument(level = "debug", skip(self, args), fields(program = %self.program.display()))]
    pub async fn invoke(
        &self,
        args: &ArgumentMap,
        cwd: &Path,
        threads: usize,
    ) -> Result<(), WorkflowError> {
        info!("Running: {}={} {} {}", THREADS_ENV, threads, self.program.display(), args);

        let mut cmd = Command::new(&self.program);
        cmd.args(args.argv())
            .current_dir(cwd)
            .envs(self.environ.iter())
            .env(THREADS_ENV, threads.to_string())
            .stdin(Stdio::null());

        if let Some(log) = &self.log_file {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log)
                .map_err(|e| self.process_error(None, format!("cannot open log '{}': {e}", log.display())))?;
            let err_file = file
                .try_clone()
                .map_err(|e| self.process_error(None, e.to_string()))?;
            cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| self.process_error(None, format!("cannot start: {e}")))?;

        if status.success() {
            info!("{} finished successfully", self.program.display());
            Ok(())
        } else {
            Err(self.process_error(status.code(), status.to_string()))
        }
    }

    fn process_error(&self, exit_code: Option<i32>, details: String) -> WorkflowError {
        WorkflowError::ExternalProcess {
            program: self.program.display().to_string(),
            exit_code,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_string_preserves_insertion_order() {
        let args: ArgumentMap = [("--v1", "a.mrc"), ("--v2", "b.mrc"), ("--mask", "m.mrc")]
            .into_iter()
            .collect();
        assert_eq!(args.to_string(), "--v1 a.mrc --v2 b.mrc --mask m.mrc");
    }

    #[test]
    fn test_presence_flag_keeps_trailing_space() {
        let mut args = ArgumentMap::new();
        args.switch("--spectrum");
        assert_eq!(args.to_string(), "--spectrum ");
        assert_eq!(args.argv(), vec!["--spectrum"]);
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let mut args = ArgumentMap::new();
        args.insert("--v1", "old.mrc").insert("--v2", "b.mrc").insert("--v1", "a.mrc");
        assert_eq!(args.to_string(), "--v1 a.mrc --v2 b.mrc");
        assert_eq!(args.get("--v1"), Some("a.mrc"));
        assert!(!args.contains("--mask"));
    }

    #[test]
    fn test_prepend_path() {
        let mut env = ToolEnviron::new();
        env.set("PATH", "/usr/bin");
        env.prepend_path("PATH", Path::new("/opt/sidesplitter"));
        let joined = env.get("PATH").unwrap();
        let parts: Vec<_> = std::env::split_paths(joined).collect();
        assert_eq!(
            parts,
            vec![PathBuf::from("/opt/sidesplitter"), PathBuf::from("/usr/bin")]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExternalTool::new("/bin/sh", ToolEnviron::new());
        let mut args = ArgumentMap::new();
        args.insert("-c", "exit 3");
        let err = tool.invoke(&args, dir.path(), 1).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_sets_threads_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExternalTool::new("/bin/sh", ToolEnviron::new())
            .with_log_file(dir.path().join("run.log"));
        let mut args = ArgumentMap::new();
        args.insert("-c", "echo $OMP_NUM_THREADS > threads.txt; echo done");
        tool.invoke(&args, dir.path(), 4).await.unwrap();

        let threads = std::fs::read_to_string(dir.path().join("threads.txt")).unwrap();
        assert_eq!(threads.trim(), "4");
        let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert_eq!(log.trim(), "done");
    }

    #[tokio::test]
    async fn test_missing_program_is_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExternalTool::new(dir.path().join("no-such-binary"), ToolEnviron::new());
        let err = tool.invoke(&ArgumentMap::new(), dir.path(), 1).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ExternalProcess { exit_code: None, .. }));
    }
}
