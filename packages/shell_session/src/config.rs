use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shell_pty::{RecorderConfig, ShellConfig};
use std::path::{Path, PathBuf};

// =============================================================================
// Layered config: struct defaults → config.toml → SHELL_SESSION_* env vars
// =============================================================================
//
//   config.toml:     [recorder]
//                    screen_buffer_size = 5000
//
//   env var:         SHELL_SESSION_RECORDER__SCREEN_BUFFER_SIZE=5000
//                    (double underscore = nesting)

pub const ENV_PREFIX: &str = "SHELL_SESSION_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

/// `~/.config/shell-session/config.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shell-session").join("config.toml"))
}

pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

pub fn resolve_config(config_path: Option<&Path>) -> Result<FileConfig> {
    load_config(config_path)
        .extract()
        .with_context(|| match config_path {
            Some(path) => format!("Invalid configuration in {}", path.display()),
            None => "Invalid configuration".to_string(),
        })
}
