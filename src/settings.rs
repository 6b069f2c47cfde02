use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    /// Maximum direct children per placement parent. The company root is
    /// exempt: the frontline under the sentinel is unbounded.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Depth cap for subtree projections; deeper requests are clamped.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_root_id")]
    pub root_id: String,
    #[serde(default = "default_root_name")]
    pub root_name: String,
}

fn default_capacity() -> usize {
    6
}

fn default_max_depth() -> usize {
    5
}

fn default_root_id() -> String {
    "SAGENEX-GOLD".to_string()
}

fn default_root_name() -> String {
    "Sagenex Gold".to_string()
}

impl Default for Tree {
    fn default() -> Self {
        Tree {
            capacity: default_capacity(),
            max_depth: default_max_depth(),
            root_id: default_root_id(),
            root_name: default_root_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: Server,
    #[serde(default)]
    pub tree: Tree,
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .build()?;

        config.try_deserialize()
    }
}
