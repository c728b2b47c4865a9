use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Output, Stdio};

/// Result of a best-effort removal. Absence is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    NotFound,
}

impl CleanupOutcome {
    pub fn merge(self, other: CleanupOutcome) -> CleanupOutcome {
        if self == CleanupOutcome::Removed || other == CleanupOutcome::Removed {
            CleanupOutcome::Removed
        } else {
            CleanupOutcome::NotFound
        }
    }
}

/// Local command execution helpers
pub mod local {
    use super::*;

    pub fn execute(program: &str, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped()); // Capture stdout for parsing
        cmd.stderr(Stdio::piped()); // Capture stderr for error messages
        cmd.stdin(Stdio::null());
        cmd.output()
            .with_context(|| format!("Failed to execute command: {}", program))
    }

    /// Check if a command exists using native Rust (which crate)
    pub fn check_command_exists(command: &str) -> bool {
        which::which(command).is_ok()
    }

    pub fn read_file(path: impl AsRef<Path>) -> Result<String> {
        let path_ref = path.as_ref();
        std::fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read file: {}", path_ref.display()))
    }

    /// Remove a file or directory tree, treating absence as success
    pub fn remove_path(path: impl AsRef<Path>) -> Result<CleanupOutcome> {
        let path_ref = path.as_ref();
        let metadata = match std::fs::symlink_metadata(path_ref) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CleanupOutcome::NotFound),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to inspect: {}", path_ref.display()));
            }
        };

        let removed = if metadata.is_dir() {
            std::fs::remove_dir_all(path_ref)
        } else {
            std::fs::remove_file(path_ref)
        };
        match removed {
            Ok(()) => Ok(CleanupOutcome::Removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CleanupOutcome::NotFound),
            Err(e) => Err(e).with_context(|| format!("Failed to remove: {}", path_ref.display())),
        }
    }

    /// Whether a directory exists and contains anything
    pub fn has_entries(path: impl AsRef<Path>) -> Result<bool> {
        let path_ref = path.as_ref();
        match std::fs::read_dir(path_ref) {
            Ok(mut entries) => Ok(entries.next().is_some()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read directory: {}", path_ref.display()))
            }
        }
    }

    /// Remove everything inside a directory but keep the directory itself
    pub fn clear_directory(path: impl AsRef<Path>) -> Result<CleanupOutcome> {
        let path_ref = path.as_ref();
        let entries = match std::fs::read_dir(path_ref) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CleanupOutcome::NotFound),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read directory: {}", path_ref.display()));
            }
        };

        let mut outcome = CleanupOutcome::NotFound;
        for entry in entries {
            let entry = entry?;
            outcome = outcome.merge(remove_path(entry.path())?);
        }
        Ok(outcome)
    }
}

/// Trait for executing commands and touching the filesystem on the node
pub trait CommandExecutor {
    /// Execute a program directly, capturing output
    fn execute_simple(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Check if a command exists
    fn check_command_exists(&self, command: &str) -> Result<bool>;

    fn read_file(&self, path: &Path) -> Result<String>;

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Create directory recursively
    fn mkdir_p(&self, path: &Path) -> Result<()>;

    fn file_exists(&self, path: &Path) -> Result<bool>;

    /// Whether a directory exists and is not empty
    fn has_entries(&self, path: &Path) -> Result<bool>;

    /// Remove a file or directory tree
    fn remove_path(&self, path: &Path) -> Result<CleanupOutcome>;

    /// Empty a directory, leaving the directory in place
    fn clear_directory(&self, path: &Path) -> Result<CleanupOutcome>;

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Change owner and group of a path (not recursive)
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
}

/// Executor for the node this process runs on
#[derive(Debug, Default, Clone, Copy)]
pub struct Executor;

impl Executor {
    pub fn local() -> Self {
        Executor
    }
}

impl CommandExecutor for Executor {
    fn execute_simple(&self, program: &str, args: &[&str]) -> Result<Output> {
        local::execute(program, args)
    }

    fn check_command_exists(&self, command: &str) -> Result<bool> {
        Ok(local::check_command_exists(command))
    }

    fn read_file(&self, path: &Path) -> Result<String> {
        local::read_file(path)
    }

    fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.mkdir_p(parent)?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write file: {}", path.display()))
    }

    fn mkdir_p(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))
    }

    fn file_exists(&self, path: &Path) -> Result<bool> {
        Ok(path.is_file())
    }

    fn has_entries(&self, path: &Path) -> Result<bool> {
        local::has_entries(path)
    }

    fn remove_path(&self, path: &Path) -> Result<CleanupOutcome> {
        local::remove_path(path)
    }

    fn clear_directory(&self, path: &Path) -> Result<CleanupOutcome> {
        local::clear_directory(path)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::copy(from, to).with_context(|| {
            format!(
                "Failed to copy file from {} to {}",
                from.display(),
                to.display()
            )
        })?;
        Ok(())
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .with_context(|| format!("Failed to change ownership of {}", path.display()))
    }
}
