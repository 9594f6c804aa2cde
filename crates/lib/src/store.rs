//! Chat persistence: conversation files, the app-wide state log, and the chat directory.
//!
//! Each conversation is one pretty-printed JSON file under `<data>/chats/`. The state log
//! (`<data>/state.json`) remembers the last opened chat and the most-recently-used chat list; it is
//! rewritten in full on every change (last writer wins).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::session::{self, Message, WireMessage};

const CHATS_DIR: &str = "chats";
const BOTS_DIR: &str = "bots";
const STATE_FILE: &str = "state.json";
const DEFAULT_CHAT_NAME: &str = "New Chat";

/// Keys a file must carry to count as a chat when scanning the chat directory.
const SETTINGS_KEYS: [&str; 5] = ["Name", "Bot Path", "Temperature", "Model", "Chat"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid json in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn parse(path: &Path, source: serde_json::Error) -> Self {
        StoreError::Parse {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A saved conversation. Field names match the on-disk keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "Name")]
    pub name: String,
    /// Directory of the bot preset this chat uses.
    #[serde(rename = "Bot Path", default)]
    pub bot_path: Option<String>,
    #[serde(rename = "Temperature")]
    pub temperature: f64,
    #[serde(rename = "Model")]
    pub model: String,
    /// Display transcript.
    #[serde(rename = "Chat")]
    pub chat: Vec<Message>,
    /// What is sent to the model: preset first (if any), then the history.
    #[serde(rename = "Payload", default)]
    pub payload: Vec<WireMessage>,
}

impl Conversation {
    pub fn new(name: impl Into<String>, bot_path: Option<String>, model: impl Into<String>, temperature: f64) -> Self {
        Self {
            name: name.into(),
            bot_path,
            temperature,
            model: model.into(),
            chat: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Re-derive the payload from the transcript when it was lost. Returns true if it changed.
    pub fn recover_payload(&mut self) -> bool {
        if self.payload.is_empty() && !self.chat.is_empty() {
            self.payload = session::replay(&self.chat);
            return true;
        }
        false
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let s = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&s).map_err(|e| StoreError::parse(path, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let s = serde_json::to_string_pretty(value).map_err(|e| StoreError::parse(path, e))?;
    std::fs::write(path, s).map_err(|e| StoreError::io(path, e))
}

/// Write a conversation file.
pub fn save_conversation(path: &Path, conversation: &Conversation) -> Result<(), StoreError> {
    write_json(path, conversation)?;
    log::debug!("saved chat {}", path.display());
    Ok(())
}

/// Read a conversation file.
pub fn load_conversation(path: &Path) -> Result<Conversation, StoreError> {
    read_json(path)
}

/// App-wide state: last opened chat and the known chats, most recently used last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppLog {
    #[serde(rename = "LastChat", default)]
    pub last_chat: String,
    #[serde(rename = "ChatList", default)]
    pub chat_list: Vec<String>,
}

impl AppLog {
    /// Read the log. A missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json(path, self)
    }

    /// Move `chat_id` to the most-recent end of the list, adding it if absent.
    pub fn touch(&mut self, chat_id: &str) {
        self.chat_list.retain(|c| c != chat_id);
        self.chat_list.push(chat_id.to_string());
    }

    pub fn forget(&mut self, chat_id: &str) {
        self.chat_list.retain(|c| c != chat_id);
    }
}

/// Identifier of a chat file: its file stem.
pub fn chat_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The data directory layout: chat files, bot presets and the state log.
#[derive(Debug, Clone)]
pub struct ChatLibrary {
    root: PathBuf,
}

impl ChatLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chats_dir(&self) -> PathBuf {
        self.root.join(CHATS_DIR)
    }

    pub fn bots_dir(&self) -> PathBuf {
        self.root.join(BOTS_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// File for a chat identifier (no uniqueness check).
    pub fn chat_path(&self, id: &str) -> PathBuf {
        self.chats_dir().join(format!("{}.json", id))
    }

    /// A file name for `name` that is not taken yet: `name`, `name (1)`, `name (2)`, ...
    pub fn unique_chat_path(&self, name: &str) -> PathBuf {
        let candidate = self.chat_path(name);
        if !candidate.exists() {
            return candidate;
        }
        let mut i = 1;
        loop {
            let candidate = self.chat_path(&format!("{} ({})", name, i));
            if !candidate.exists() {
                return candidate;
            }
            i += 1;
        }
    }

    pub fn app_log(&self) -> Result<AppLog, StoreError> {
        AppLog::load(&self.state_path())
    }

    /// Read-modify-write the state log so `path` becomes the last chat and moves to the end of the list.
    pub fn record_open(&self, path: &Path) -> Result<AppLog, StoreError> {
        let state = self.state_path();
        let mut log = AppLog::load(&state)?;
        log.last_chat = path.to_string_lossy().into_owned();
        log.touch(&chat_id(path));
        log.save(&state)?;
        Ok(log)
    }

    /// Load a chat file and record it as the last opened chat.
    pub fn open(&self, path: &Path) -> Result<Conversation, StoreError> {
        let conversation = load_conversation(path)?;
        self.record_open(path)?;
        log::info!("opened chat {}", path.display());
        Ok(conversation)
    }

    /// Save a conversation under its current file and record it in the state log.
    pub fn save(&self, path: &Path, conversation: &Conversation) -> Result<(), StoreError> {
        save_conversation(path, conversation)?;
        self.record_open(path)?;
        Ok(())
    }

    /// Apply chat settings: write `conversation` under a file named after it. When the chat was
    /// renamed (its name no longer maps to `previous`), a fresh unique file is used and `previous`
    /// is deleted. Returns the file the chat now lives in.
    pub fn save_settings(
        &self,
        conversation: &mut Conversation,
        previous: Option<&Path>,
    ) -> Result<PathBuf, StoreError> {
        let name = conversation.name.trim();
        conversation.name = if name.is_empty() {
            DEFAULT_CHAT_NAME.to_string()
        } else {
            name.to_string()
        };

        let target = match previous {
            Some(prev) if id_matches_name(&chat_id(prev), &conversation.name) => prev.to_path_buf(),
            _ => self.unique_chat_path(&conversation.name),
        };
        save_conversation(&target, conversation)?;

        let state = self.state_path();
        let mut log = AppLog::load(&state)?;
        if let Some(prev) = previous.filter(|p| *p != target) {
            if prev.exists() {
                std::fs::remove_file(prev).map_err(|e| StoreError::io(prev, e))?;
                log::info!("renamed chat {} -> {}", prev.display(), target.display());
            }
            log.forget(&chat_id(prev));
        }
        log.last_chat = target.to_string_lossy().into_owned();
        log.touch(&chat_id(&target));
        log.save(&state)?;
        Ok(target)
    }

    /// Every `*.json` in the chat directory that looks like a saved chat, sorted by name.
    pub fn list_chats(&self) -> Vec<PathBuf> {
        let read_dir = match std::fs::read_dir(self.chats_dir()) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let mut paths: Vec<PathBuf> = read_dir
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .map(|e| e.eq_ignore_ascii_case("json"))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();
        paths.retain(|p| has_settings_keys(p));
        paths
    }

    /// First saved chat in name order.
    pub fn first_chat(&self) -> Option<PathBuf> {
        self.list_chats().into_iter().next()
    }

    /// The chat to open at startup: the logged last chat if it still exists, otherwise the first valid one.
    pub fn startup_chat(&self) -> Option<PathBuf> {
        match self.app_log() {
            Ok(log) if !log.last_chat.is_empty() => {
                let p = PathBuf::from(&log.last_chat);
                if p.exists() {
                    return Some(p);
                }
                log::debug!("last chat {} no longer exists", p.display());
            }
            Ok(_) => {}
            Err(e) => log::warn!("could not read state log: {}", e),
        }
        self.first_chat()
    }
}

/// True when `id` is `name` itself or one of its numbered variants (`name (3)`).
fn id_matches_name(id: &str, name: &str) -> bool {
    if id == name {
        return true;
    }
    id.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(" ("))
        .and_then(|rest| rest.strip_suffix(')'))
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

fn has_settings_keys(path: &Path) -> bool {
    let Ok(value) = read_json::<serde_json::Value>(path) else {
        return false;
    };
    value
        .as_object()
        .map(|o| SETTINGS_KEYS.iter().all(|k| o.contains_key(*k)))
        .unwrap_or(false)
}
