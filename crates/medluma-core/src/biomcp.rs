//! Locates the external `biomcp` helper executable and describes how the
//! biomedical research stage should launch it.
//!
//! The search is a plain existence check over an ordered candidate list: every
//! directory on `PATH` first, then well-known install locations. No caching,
//! no retry; a missing executable is fatal before the pipeline starts.

use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{BioMcpSettings, MedLumaError};

fn binary_name() -> &'static str {
    if cfg!(windows) { "biomcp.exe" } else { "biomcp" }
}

fn search_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|path| env::split_paths(&path).collect())
        .unwrap_or_default();

    if let Ok(home) = env::var("HOME") {
        dirs.push(Path::new(&home).join(".local").join("bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));

    // Last resort: an install dropped next to this binary.
    if let Ok(exe) = env::current_exe() {
        if let Some(parent) = exe.parent() {
            dirs.push(parent.to_path_buf());
        }
    }

    dirs
}

fn locate_in(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(name);
        if candidate.exists() {
            debug!(path = %candidate.display(), "biomcp candidate exists");
            return Some(candidate);
        }
    }
    None
}

/// Locate the `biomcp` executable, honouring an explicit configured path.
pub fn locate_biomcp(settings: &BioMcpSettings) -> Result<PathBuf, MedLumaError> {
    if let Some(path) = &settings.path {
        if path.exists() {
            info!(path = %path.display(), "using configured biomcp path");
            return Ok(path.clone());
        }
        return Err(MedLumaError::BioMcpNotFound(1));
    }

    let dirs = search_dirs();
    match locate_in(&dirs, binary_name()) {
        Some(path) => {
            info!(path = %path.display(), "located biomcp");
            Ok(path)
        }
        None => Err(MedLumaError::BioMcpNotFound(dirs.len())),
    }
}

/// Launch description for the biomcp MCP server, handed to the model client as
/// immutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BioMcpServerConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u64,
}

impl BioMcpServerConfig {
    pub fn new(command: PathBuf, settings: &BioMcpSettings) -> Self {
        Self {
            command,
            args: vec!["run".to_string()],
            env: vec![("MCP_LOG_LEVEL".to_string(), "debug".to_string())],
            timeout_secs: settings.timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn finds_first_existing_candidate() {
        let missing = TempDir::new().unwrap();
        let present = TempDir::new().unwrap();
        let path = present.path().join("biomcp");
        File::create(&path).unwrap();

        let dirs = vec![missing.path().to_path_buf(), present.path().to_path_buf()];
        assert_eq!(locate_in(&dirs, "biomcp"), Some(path));
    }

    #[test]
    fn reports_missing_executable() {
        let empty = TempDir::new().unwrap();
        let dirs = vec![empty.path().to_path_buf()];
        assert_eq!(locate_in(&dirs, "biomcp"), None);
    }

    #[test]
    fn configured_path_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("biomcp");
        File::create(&path).unwrap();

        let settings = BioMcpSettings {
            path: Some(path.clone()),
            timeout_secs: 120,
        };
        assert_eq!(locate_biomcp(&settings).unwrap(), path);
    }

    #[test]
    fn configured_path_must_exist() {
        let settings = BioMcpSettings {
            path: Some(PathBuf::from("/definitely/not/here/biomcp")),
            timeout_secs: 120,
        };
        assert!(matches!(
            locate_biomcp(&settings),
            Err(MedLumaError::BioMcpNotFound(_))
        ));
    }

    #[test]
    fn server_config_carries_launch_arguments() {
        let settings = BioMcpSettings::default();
        let config = BioMcpServerConfig::new(PathBuf::from("/usr/local/bin/biomcp"), &settings);
        assert_eq!(config.args, vec!["run"]);
        assert_eq!(config.timeout_secs, 120);
        assert_eq!(
            config.env,
            vec![("MCP_LOG_LEVEL".to_string(), "debug".to_string())]
        );
    }
}
