//! Bot presets: each bot is a directory holding `Bot Description.json` and an optional portrait image.
//! The description is sent verbatim as the system instruction.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::store::StoreError;

pub const DESCRIPTOR_FILE: &str = "Bot Description.json";
const DEFAULT_BOT_NAME: &str = "New Bot";
const PORTRAIT_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "bmp"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    /// Optional workflow file; empty when the bot has none.
    #[serde(rename = "WorkflowPath", default)]
    pub workflow_path: String,
}

impl Persona {
    /// The system instruction for chats using this bot.
    pub fn preset(&self) -> String {
        self.description.trim().to_string()
    }

    pub fn has_workflow(&self) -> bool {
        !self.workflow_path.trim().is_empty()
    }
}

/// Read `<dir>/Bot Description.json`.
pub fn load_persona(dir: &Path) -> Result<Persona, StoreError> {
    let path = dir.join(DESCRIPTOR_FILE);
    let s = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&s).map_err(|source| StoreError::Parse { path, source })
}

/// Portrait image in the bot directory (`portrait.<ext>`, any case), if present.
pub fn portrait_path(dir: &Path) -> Option<PathBuf> {
    let read_dir = std::fs::read_dir(dir).ok()?;
    let mut found: Vec<PathBuf> = read_dir
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            let stem_ok = p
                .file_stem()
                .map(|s| s.to_string_lossy().eq_ignore_ascii_case("portrait"))
                .unwrap_or(false);
            let ext_ok = p
                .extension()
                .map(|e| {
                    let e = e.to_string_lossy().to_ascii_lowercase();
                    PORTRAIT_EXTENSIONS.contains(&e.as_str())
                })
                .unwrap_or(false);
            stem_ok && ext_ok && p.is_file()
        })
        .collect();
    found.sort();
    found.into_iter().next()
}

/// Save a bot under `bots_dir`. A new bot (or one whose name changed) gets a fresh directory
/// (`name`, `name (1)`, ...); an existing bot keeps its directory. The portrait, when given, is
/// copied in as `portrait.<ext>`. Returns the bot directory.
pub fn save_persona(
    bots_dir: &Path,
    persona: &mut Persona,
    existing: Option<&Path>,
    portrait: Option<&Path>,
) -> Result<PathBuf, StoreError> {
    let name = persona.name.trim();
    persona.name = if name.is_empty() {
        DEFAULT_BOT_NAME.to_string()
    } else {
        name.to_string()
    };
    persona.description = persona.description.trim().to_string();
    persona.workflow_path = persona.workflow_path.trim().to_string();

    let same_dir = bots_dir.join(&persona.name);
    let dir = match existing {
        Some(e) if e == same_dir => same_dir,
        _ => unique_dir(bots_dir, &persona.name),
    };
    std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
        path: dir.clone(),
        source,
    })?;

    let path = dir.join(DESCRIPTOR_FILE);
    let s = serde_json::to_string_pretty(persona).map_err(|source| StoreError::Parse {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, s).map_err(|source| StoreError::Io {
        path: path.clone(),
        source,
    })?;

    if let Some(src) = portrait.filter(|p| p.is_file()) {
        let ext = src
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "png".to_string());
        let dest = dir.join(format!("portrait.{}", ext));
        std::fs::copy(src, &dest).map_err(|source| StoreError::Io {
            path: dest.clone(),
            source,
        })?;
    }
    log::info!("saved bot {} at {}", persona.name, dir.display());
    Ok(dir)
}

fn unique_dir(base: &Path, name: &str) -> PathBuf {
    let candidate = base.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|i| base.join(format!("{} ({})", name, i)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// All bots under `bots_dir` that have a readable descriptor, sorted by directory name.
pub fn list_personas(bots_dir: &Path) -> Vec<(PathBuf, Persona)> {
    let read_dir = match std::fs::read_dir(bots_dir) {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    let mut out: Vec<(PathBuf, Persona)> = read_dir
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|p| match load_persona(&p) {
            Ok(persona) => Some((p, persona)),
            Err(e) => {
                log::debug!("skipping bot dir {}: {}", p.display(), e);
                None
            }
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
