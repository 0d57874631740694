//! Compiler configuration
//!
//! Options that affect compilation: the target platform, the include
//! search path, and whether intermediate assembly is kept. A configuration
//! can be loaded from a TOML file (`--config cinder.toml`); command-line
//! flags are layered on top by the CLI.
//!
//! ```toml
//! target = "linux"
//! include_dirs = ["include", "/usr/local/include/cinder"]
//! keep_asm = true
//! ```

use crate::codegen::Target;
use crate::errors::CompileError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerConfig {
    /// Assembly flavor to emit; defaults to the host platform.
    pub target: Target,
    /// Directories searched for `#include` headers, in order. The
    /// including file's own directory is searched first for quoted
    /// includes.
    pub include_dirs: Vec<PathBuf>,
    /// Keep the intermediate `.s` file when driving the assembler.
    pub keep_asm: bool,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, CompileError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CompileError::io(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        toml::from_str(&text).map_err(|e| {
            CompileError::io(format!("invalid config '{}': {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_host_and_empty() {
        let config = CompilerConfig::new();
        assert!(config.include_dirs.is_empty());
        assert!(!config.keep_asm);
    }

    #[test]
    fn loads_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "target = \"darwin\"\ninclude_dirs = [\"include\"]\nkeep_asm = true"
        )
        .unwrap();
        let config = CompilerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.target, Target::Darwin);
        assert_eq!(config.include_dirs, vec![PathBuf::from("include")]);
        assert!(config.keep_asm);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_such_option = 1").unwrap();
        assert!(CompilerConfig::from_file(file.path()).is_err());
    }
}
