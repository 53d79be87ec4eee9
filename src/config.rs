//! Configuration consumed by the core. Loading the file itself -- TOML/YAML
//! parsing, CLI wiring, plugin registration -- is out of scope; this module
//! only owns the struct and the one fatal validation rule, the same
//! separation drawn elsewhere between a plain config struct and whatever
//! builds one from the outside.

use std::path::PathBuf;

use serde_derive::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AnalysisConfig {
    pub output_directory: PathBuf,
    #[serde(default)]
    pub map_files: Vec<PathBuf>,
    #[serde(default)]
    pub map_directory: Option<PathBuf>,
    #[serde(default)]
    pub dump_call_tree: bool,
    #[serde(default = "default_include_memory_accesses_in_dump")]
    pub include_memory_accesses_in_dump: bool,
}

fn default_include_memory_accesses_in_dump() -> bool {
    true
}

impl AnalysisConfig {
    /// The one fatal configuration check: a missing `output-directory`.
    /// Everything else (map files, dump flags) is optional and defaults
    /// sanely.
    pub fn validate(&self) -> Result<()> {
        if self.output_directory.as_os_str().is_empty() {
            return Err(Error::Config {
                inner: "output-directory is required".to_string(),
            });
        }
        Ok(())
    }
}
