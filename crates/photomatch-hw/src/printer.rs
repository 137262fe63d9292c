//! Print spooling through the system `lp` command.

use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrintError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("print job rejected ({status}): {stderr}")]
    Rejected { status: String, stderr: String },
}

/// Handle to the print spooler.
#[derive(Debug, Clone)]
pub struct Printer {
    command: String,
}

impl Default for Printer {
    fn default() -> Self {
        Self { command: "lp".into() }
    }
}

impl Printer {
    /// Use a different spooler binary with `lp`-compatible arguments.
    pub fn with_command(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    /// Submit `path` for printing. `target` selects a printer; `None` uses the default.
    pub fn print(&self, path: &Path, target: Option<&str>, copies: u32) -> Result<(), PrintError> {
        if !path.is_file() {
            return Err(PrintError::FileNotFound(path.display().to_string()));
        }

        let output = Command::new(&self.command)
            .args(lp_args(path, target, copies))
            .output()
            .map_err(|source| PrintError::Spawn { command: self.command.clone(), source })?;

        if !output.status.success() {
            return Err(PrintError::Rejected {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        tracing::info!(
            path = %path.display(),
            target = target.unwrap_or("default"),
            copies,
            job = %String::from_utf8_lossy(&output.stdout).trim(),
            "print job submitted"
        );
        Ok(())
    }
}

fn lp_args(path: &Path, target: Option<&str>, copies: u32) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(t) = target.filter(|t| !t.is_empty()) {
        args.push("-d".into());
        args.push(t.into());
    }
    args.push("-n".into());
    args.push(copies.max(1).to_string().into());
    args.push(path.as_os_str().to_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lp_args_with_target() {
        let args = lp_args(Path::new("/tmp/p.jpg"), Some("kiosk-printer"), 2);
        assert_eq!(args, vec!["-d", "kiosk-printer", "-n", "2", "/tmp/p.jpg"]);
    }

    #[test]
    fn test_lp_args_default_target_and_min_copies() {
        let args = lp_args(Path::new("/tmp/p.jpg"), None, 0);
        assert_eq!(args, vec!["-n", "1", "/tmp/p.jpg"]);
        assert_eq!(lp_args(Path::new("/x"), Some(""), 1), vec!["-n", "1", "/x"]);
    }

    #[test]
    fn test_missing_file() {
        let err = Printer::default().print(Path::new("/nonexistent/p.jpg"), None, 1);
        assert!(matches!(err, Err(PrintError::FileNotFound(_))));
    }

    #[test]
    fn test_spooler_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("p.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        assert!(Printer::with_command("true").print(&file, None, 1).is_ok());
        assert!(matches!(
            Printer::with_command("false").print(&file, None, 1),
            Err(PrintError::Rejected { .. })
        ));
        assert!(matches!(
            Printer::with_command("/nonexistent/lp").print(&file, None, 1),
            Err(PrintError::Spawn { .. })
        ));
    }
}
