// config.rs — Generation options and target selection
//
// `Target` picks the strategy (architecture plus debug/trace overlays),
// `GenOptions` controls textual details that are independent of the target.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Target architecture of the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Sequential loops on the host.
    Cpu,
    /// Thread-parallel loops on the host.
    Openmp,
    /// Directive-based device kernels over present data.
    Openacc,
    /// Explicit device memory and kernel launches.
    Cuda,
}

impl Architecture {
    pub const ALL: [Architecture; 4] = [
        Architecture::Cpu,
        Architecture::Openmp,
        Architecture::Openacc,
        Architecture::Cuda,
    ];
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Cpu => write!(f, "cpu"),
            Architecture::Openmp => write!(f, "openmp"),
            Architecture::Openacc => write!(f, "openacc"),
            Architecture::Cuda => write!(f, "cuda"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub architecture: Architecture,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub trace: bool,
    /// Device code runs in an emulator; enables per-thread sanity output in debug mode.
    #[serde(default)]
    pub emulation: bool,
}

impl Target {
    pub fn new(architecture: Architecture) -> Self {
        Target {
            architecture,
            debug: false,
            trace: false,
            emulation: false,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.architecture)?;
        if self.debug {
            write!(f, "+debug")?;
        }
        if self.trace {
            write!(f, "+trace")?;
        }
        if self.emulation {
            write!(f, "+emulation")?;
        }
        Ok(())
    }
}

/// Flags that change the emitted runtime code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionFlags {
    /// Dump values of the symbols used in each kernel after it ran.
    pub debug_print: bool,
    /// Leave the device cache configuration alone before kernel launches.
    pub keep_gpu_cache_settings: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenOptions {
    /// Wrap every rendered region in `!<--- kind` / `!--->` comments.
    pub region_markers: bool,
    pub flags: OptionFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_display_lists_overlays() {
        let mut t = Target::new(Architecture::Openacc);
        assert_eq!(t.to_string(), "openacc");
        t.debug = true;
        t.trace = true;
        assert_eq!(t.to_string(), "openacc+debug+trace");
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let o: GenOptions = serde_json::from_str(r#"{"flags": {"debug_print": true}}"#).unwrap();
        assert!(!o.region_markers);
        assert!(o.flags.debug_print);
        assert!(!o.flags.keep_gpu_cache_settings);
    }
}
