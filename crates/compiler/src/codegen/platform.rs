//! Target platform selection
//!
//! The emitter is identical on Linux and macOS apart from symbol
//! prefixing, local-label prefixes, PLT call suffixes, and read-only
//! data sections. Those differences are data here, not conditional
//! compilation, so either flavor can be produced (and tested) from any
//! host.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Linux,
    Darwin,
}

impl Target {
    /// The platform this compiler itself was built for.
    pub fn host() -> Target {
        if cfg!(target_os = "macos") {
            Target::Darwin
        } else {
            Target::Linux
        }
    }

    /// Prefix for assembler-local labels.
    pub fn label_prefix(self) -> &'static str {
        match self {
            Target::Linux => ".L",
            Target::Darwin => "L",
        }
    }

    /// Prefix applied to every C-visible symbol.
    pub fn symbol_prefix(self) -> &'static str {
        match self {
            Target::Linux => "",
            Target::Darwin => "_",
        }
    }

    pub fn is_elf(self) -> bool {
        self == Target::Linux
    }
}

impl Default for Target {
    fn default() -> Self {
        Target::host()
    }
}
