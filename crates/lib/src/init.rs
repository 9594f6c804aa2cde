//! Initialize the data directory: create ~/.palaver, a default config, the chat and bot directories,
//! the state log, and the bundled bots.
//!
//! Layout mirrors `crates/lib/config/`: `config/bots/<name>/` → `~/.palaver/bots/<name>/`.

use anyhow::{Context, Result};
use include_dir::{include_dir, Dir};
use std::path::{Path, PathBuf};

use crate::config;
use crate::store::{AppLog, ChatLibrary};

static BUNDLED_BOTS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/config/bots");

/// Ensure the data directory has been initialized (chat directory exists).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<ChatLibrary> {
    let library = ChatLibrary::new(config::resolve_data_dir(config, config_path));
    if !library.chats_dir().exists() {
        anyhow::bail!(
            "data directory not initialized; run `palaver init` first (chat directory not found: {})",
            library.chats_dir().display()
        );
    }
    Ok(library)
}

/// Create the config and data directories and default files if they do not exist.
/// - Writes `config.json` with `{}` if missing.
/// - Creates `chats/` and `bots/` under the data directory.
/// - Writes an empty state log if missing.
/// - Extracts each bundled bot whose directory does not exist yet.
pub fn init_data_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let library = ChatLibrary::new(config::resolve_data_dir(&config, config_path));

    for dir in [library.chats_dir(), library.bots_dir()] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            log::info!("created {}", dir.display());
        }
    }

    let state = library.state_path();
    if !state.exists() {
        AppLog::default()
            .save(&state)
            .with_context(|| format!("writing state log {}", state.display()))?;
    }

    let bots_dir = library.bots_dir();
    for bot in BUNDLED_BOTS.dirs() {
        let target = bots_dir.join(bot.path());
        if target.exists() {
            log::debug!("bot {} already exists, skipping", target.display());
            continue;
        }
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating bot directory {}", target.display()))?;
        bot.extract(&bots_dir)
            .with_context(|| format!("extracting bundled bot to {}", target.display()))?;
        log::info!("installed bundled bot at {}", target.display());
    }

    Ok(library.root().to_path_buf())
}
