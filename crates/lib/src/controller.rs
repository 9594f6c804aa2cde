//! Conversation controller: turn-taking, streaming generation on a worker thread, and history edits.
//!
//! The front end owns the [`mpsc::Receiver`] returned by [`ChatController::new`] and drains
//! [`ChatEvent`]s on its own thread. Workers never touch front-end state; they only lock the shared
//! chat state, append completed replies, persist, and send events. Events of one generation arrive
//! in wire order, and `Done` always comes after the last `Token`.
//!
//! Starting a generation while one is in flight is rejected with [`ChatError::InvalidState`].
//! [`ChatController::abort`] releases the controller immediately; the stale worker stops at its next
//! line boundary and its output is discarded.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::context::{self, CompactionPolicy, RemoteSummarizer};
use crate::llm::{InferenceClient, LlmError, StreamOutcome};
use crate::persona::{self, Persona};
use crate::session::{self, Message, WireMessage};
use crate::store::{ChatLibrary, Conversation, StoreError};

/// Notification delivered to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// One streamed text fragment.
    Token(String),
    /// Generation finished; the reply is already in the transcript and saved.
    Done { text: String, response_time: f64 },
    /// A generation, save or model switch failed. The transcript is unchanged.
    Error(String),
    /// The server now serves this model.
    ModelChanged(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    SwitchingModel,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("no model selected")]
    NoModelSelected,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Settings that identify a chat on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub name: String,
    pub bot_path: Option<String>,
    pub model: String,
    pub temperature: f64,
}

struct ChatState {
    name: String,
    bot_path: Option<String>,
    bot_name: String,
    model: Option<String>,
    temperature: f64,
    preset: String,
    transcript: Vec<Message>,
    /// History sent to the model (without the preset).
    payload: Vec<WireMessage>,
    chat_path: Option<PathBuf>,
    phase: TurnPhase,
    generation: u64,
    abort: Arc<AtomicBool>,
    in_flight: String,
}

impl ChatState {
    fn new(temperature: f64) -> Self {
        Self {
            name: String::new(),
            bot_path: None,
            bot_name: String::new(),
            model: None,
            temperature,
            preset: String::new(),
            transcript: Vec::new(),
            payload: Vec::new(),
            chat_path: None,
            phase: TurnPhase::Idle,
            generation: 0,
            abort: Arc::new(AtomicBool::new(false)),
            in_flight: String::new(),
        }
    }

    fn to_conversation(&self) -> Conversation {
        Conversation {
            name: self.name.clone(),
            bot_path: self.bot_path.clone(),
            temperature: self.temperature,
            model: self.model.clone().unwrap_or_default(),
            chat: self.transcript.clone(),
            payload: context::export_payload(&self.preset, &self.payload),
        }
    }

    fn selected_model(&self) -> Result<String, ChatError> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .ok_or(ChatError::NoModelSelected)
    }

    fn ensure_idle(&self) -> Result<(), ChatError> {
        match self.phase {
            TurnPhase::Idle => Ok(()),
            TurnPhase::Streaming => Err(ChatError::InvalidState("a generation is already in flight")),
            TurnPhase::SwitchingModel => Err(ChatError::InvalidState("the model is being switched")),
        }
    }

    /// Raise the current generation's abort flag and return to idle. Returns true if one was running.
    fn abort_generation(&mut self) -> bool {
        if self.phase != TurnPhase::Streaming {
            return false;
        }
        self.abort.store(true, Ordering::SeqCst);
        self.phase = TurnPhase::Idle;
        self.in_flight.clear();
        true
    }

    /// Move to `Streaming` and capture everything the worker needs. Caller must have checked idleness.
    fn begin_generation(&mut self, model: String) -> GenerationJob {
        self.generation += 1;
        self.abort = Arc::new(AtomicBool::new(false));
        self.in_flight.clear();
        self.phase = TurnPhase::Streaming;
        GenerationJob {
            generation: self.generation,
            model,
            preset: self.preset.clone(),
            history: self.payload.clone(),
            temperature: self.temperature,
            abort: self.abort.clone(),
        }
    }
}

struct GenerationJob {
    generation: u64,
    model: String,
    preset: String,
    history: Vec<WireMessage>,
    temperature: f64,
    abort: Arc<AtomicBool>,
}

struct Inner {
    client: InferenceClient,
    library: ChatLibrary,
    policy: CompactionPolicy,
    events: mpsc::Sender<ChatEvent>,
    state: Mutex<ChatState>,
}

/// Shared handle to one conversation. Clones refer to the same state.
#[derive(Clone)]
pub struct ChatController {
    inner: Arc<Inner>,
}

/// Run a future to completion on a fresh single-threaded runtime (one per worker thread).
fn block_on<F: Future>(fut: F) -> std::io::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(rt.block_on(fut))
}

impl ChatController {
    pub fn new(
        client: InferenceClient,
        library: ChatLibrary,
        policy: CompactionPolicy,
        default_temperature: f64,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel();
        let inner = Inner {
            client,
            library,
            policy,
            events: tx,
            state: Mutex::new(ChatState::new(default_temperature)),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChatEvent) {
        if self.inner.events.send(event).is_err() {
            log::debug!("event receiver dropped");
        }
    }

    // --- accessors ---

    pub fn phase(&self) -> TurnPhase {
        self.state().phase
    }

    pub fn model(&self) -> Option<String> {
        self.state().model.clone()
    }

    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.state().model = if model.trim().is_empty() {
            None
        } else {
            Some(model.trim().to_string())
        };
    }

    pub fn temperature(&self) -> f64 {
        self.state().temperature
    }

    pub fn set_temperature(&self, temperature: f64) {
        self.state().temperature = temperature;
    }

    pub fn preset(&self) -> String {
        self.state().preset.clone()
    }

    /// Set the system instruction (trimmed). It is never compacted.
    pub fn set_preset(&self, text: &str) {
        self.state().preset = text.trim().to_string();
    }

    pub fn bot_name(&self) -> String {
        self.state().bot_name.clone()
    }

    pub fn chat_path(&self) -> Option<PathBuf> {
        self.state().chat_path.clone()
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.state().transcript.clone()
    }

    /// History the next request is built from (preset excluded).
    pub fn payload(&self) -> Vec<WireMessage> {
        self.state().payload.clone()
    }

    /// Text streamed so far by the running generation.
    pub fn in_flight_text(&self) -> String {
        self.state().in_flight.clone()
    }

    /// The current conversation as it would be saved.
    pub fn snapshot(&self) -> Conversation {
        self.state().to_conversation()
    }

    // --- chat files ---

    /// Load a chat and its bot. State is replaced only when everything loaded; on failure the
    /// current chat is left as it was. Rejected while the model is being switched.
    pub fn load_chat(&self, path: &Path) -> Result<(), ChatError> {
        self.ensure_not_switching()?;
        let mut conversation = self.inner.library.open(path)?;
        let persona = load_bot(conversation.bot_path.as_deref());
        let current_preset = persona.as_ref().map(Persona::preset).unwrap_or_default();
        let (preset, history) = context::import_payload(&current_preset, &conversation.payload);
        conversation.payload = history;
        if conversation.recover_payload() {
            log::info!("payload missing in {}, replaying transcript", path.display());
        }

        let mut st = self.state();
        if st.phase == TurnPhase::SwitchingModel {
            return Err(ChatError::InvalidState("the model is being switched"));
        }
        st.abort_generation();
        st.name = conversation.name;
        st.bot_path = conversation.bot_path;
        st.bot_name = persona.map(|p| p.name).unwrap_or_default();
        st.model = Some(conversation.model).filter(|m| !m.trim().is_empty());
        st.temperature = conversation.temperature;
        st.preset = preset;
        st.transcript = conversation.chat;
        st.payload = conversation.payload;
        st.chat_path = Some(path.to_path_buf());
        Ok(())
    }

    fn ensure_not_switching(&self) -> Result<(), ChatError> {
        if self.state().phase == TurnPhase::SwitchingModel {
            return Err(ChatError::InvalidState("the model is being switched"));
        }
        Ok(())
    }

    /// Open a chat by identifier (file stem in the chat directory).
    pub fn open_chat(&self, name: &str) -> Result<(), ChatError> {
        let path = self.inner.library.chat_path(name);
        self.load_chat(&path)
    }

    /// Save the current chat to its file. Without a file there is nothing to do.
    pub fn save(&self) -> Result<(), ChatError> {
        let (path, conversation) = {
            let st = self.state();
            (st.chat_path.clone(), st.to_conversation())
        };
        let Some(path) = path else {
            log::debug!("chat has no file yet, not saving");
            return Ok(());
        };
        self.inner.library.save(&path, &conversation)?;
        Ok(())
    }

    /// Save from a worker: failures are logged and reported, in-memory state is kept.
    fn save_or_report(&self) {
        if let Err(e) = self.save() {
            log::warn!("saving chat failed: {}", e);
            self.emit(ChatEvent::Error(format!("saving chat failed: {}", e)));
        }
    }

    /// Apply name/bot/model/temperature and write the chat, creating or renaming its file.
    /// The preset follows the bot; without a bot there is none.
    pub fn apply_settings(&self, settings: ChatSettings) -> Result<PathBuf, ChatError> {
        let persona = match settings.bot_path.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(dir) => Some(persona::load_persona(Path::new(dir))?),
            None => None,
        };
        let (mut conversation, previous) = {
            let st = self.state();
            let mut c = st.to_conversation();
            c.name = settings.name.clone();
            c.bot_path = settings.bot_path.clone();
            c.model = settings.model.clone();
            c.temperature = settings.temperature;
            let preset = persona.as_ref().map(Persona::preset).unwrap_or_default();
            c.payload = context::export_payload(&preset, &st.payload);
            (c, st.chat_path.clone())
        };
        let path = self
            .inner
            .library
            .save_settings(&mut conversation, previous.as_deref())?;

        let mut st = self.state();
        st.name = conversation.name;
        st.bot_path = conversation.bot_path;
        st.preset = persona.as_ref().map(Persona::preset).unwrap_or_default();
        st.bot_name = persona.map(|p| p.name).unwrap_or_default();
        st.model = Some(conversation.model).filter(|m| !m.trim().is_empty());
        st.temperature = conversation.temperature;
        st.chat_path = Some(path.clone());
        Ok(path)
    }

    // --- turns ---

    /// Append a user turn to the transcript and the payload. Blank input is ignored (returns false).
    pub fn add_user_message(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let text = session::normalize_newlines(text);
        let mut st = self.state();
        st.payload.push(WireMessage::user(text.clone()));
        st.transcript.push(Message::user(text));
        true
    }

    /// Start streaming a reply to the current payload on a worker thread.
    pub fn generate(&self) -> Result<(), ChatError> {
        let job = {
            let mut st = self.state();
            let model = st.selected_model()?;
            st.ensure_idle()?;
            st.begin_generation(model)
        };
        self.spawn_generation(job);
        Ok(())
    }

    /// Stop the running generation. Nothing is appended for it. Returns false when idle.
    pub fn abort(&self) -> bool {
        let aborted = self.state().abort_generation();
        if aborted {
            log::info!("generation aborted");
        }
        aborted
    }

    /// Replace the last user message, drop the reply after it, replay the payload from the
    /// transcript, and generate again.
    pub fn edit_last_user_message(&self, new_text: &str) -> Result<(), ChatError> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Err(ChatError::InvalidState("edited message is blank"));
        }
        let new_text = session::normalize_newlines(new_text);
        let job = {
            let mut st = self.state();
            st.ensure_idle()?;
            let model = st.selected_model()?;
            session::edit_last_user(&mut st.transcript, &new_text)
                .ok_or(ChatError::InvalidState("no user message to edit"))?;
            st.payload = session::replay(&st.transcript);
            st.begin_generation(model)
        };
        self.save_or_report();
        self.spawn_generation(job);
        Ok(())
    }

    /// Remove the last user message and its reply, replay the payload and save. A running generation
    /// is aborted first. Returns false when there was nothing to delete.
    pub fn delete_last_exchange(&self) -> bool {
        {
            let mut st = self.state();
            if session::last_user_index(&st.transcript).is_none() {
                return false;
            }
            st.abort_generation();
            session::delete_last_exchange(&mut st.transcript);
            st.payload = session::replay(&st.transcript);
        }
        self.save_or_report();
        true
    }

    /// Drop a trailing reply and generate again for the last user message (which is reused, not re-added).
    pub fn regenerate(&self) -> Result<(), ChatError> {
        let job = {
            let mut st = self.state();
            st.ensure_idle()?;
            let model = st.selected_model()?;
            session::prepare_regenerate(&mut st.transcript)
                .ok_or(ChatError::InvalidState("no user message to regenerate"))?;
            st.payload = session::replay(&st.transcript);
            st.begin_generation(model)
        };
        self.spawn_generation(job);
        Ok(())
    }

    fn spawn_generation(&self, job: GenerationJob) {
        let this = self.clone();
        std::thread::spawn(move || this.run_generation(job));
    }

    fn run_generation(&self, job: GenerationJob) {
        let started = Instant::now();
        let generation = job.generation;
        let result = block_on(async {
            let summarizer = RemoteSummarizer::new(
                &self.inner.client,
                &job.model,
                self.inner.policy.summary_max_tokens,
            );
            let messages =
                context::build_payload(&job.preset, &job.history, &self.inner.policy, &summarizer)
                    .await;
            log::debug!(
                "generation {}: sending {} messages to {}",
                generation,
                messages.len(),
                job.model
            );
            let mut on_chunk = |text: &str| self.on_token(generation, text);
            self.inner
                .client
                .chat_stream(
                    &job.model,
                    &messages,
                    job.temperature,
                    &job.abort,
                    &mut on_chunk,
                )
                .await
        });
        match result {
            Ok(Ok(StreamOutcome::Completed(text))) => {
                self.on_complete(generation, text, started.elapsed().as_secs_f64())
            }
            Ok(Ok(StreamOutcome::Aborted)) => self.on_aborted(generation),
            Ok(Err(e)) => self.on_failed(generation, e.to_string()),
            Err(e) => self.on_failed(generation, format!("worker runtime: {}", e)),
        }
    }

    fn is_current(st: &ChatState, generation: u64) -> bool {
        st.generation == generation && st.phase == TurnPhase::Streaming
    }

    fn on_token(&self, generation: u64, text: &str) {
        let mut st = self.state();
        if !Self::is_current(&st, generation) {
            return;
        }
        st.in_flight.push_str(text);
        self.emit(ChatEvent::Token(text.to_string()));
    }

    fn on_complete(&self, generation: u64, text: String, elapsed: f64) {
        let response_time = {
            let mut st = self.state();
            if !Self::is_current(&st, generation) {
                log::debug!("generation {} finished after abort, discarding", generation);
                return;
            }
            let reply = Message::assistant(text.clone(), elapsed);
            let response_time = reply.response_time.unwrap_or_default();
            st.transcript.push(reply);
            st.payload.push(WireMessage::assistant(text.clone()));
            st.phase = TurnPhase::Idle;
            st.in_flight.clear();
            response_time
        };
        self.save_or_report();
        self.emit(ChatEvent::Done {
            text,
            response_time,
        });
    }

    fn on_aborted(&self, generation: u64) {
        let mut st = self.state();
        if Self::is_current(&st, generation) {
            st.phase = TurnPhase::Idle;
            st.in_flight.clear();
        }
        log::debug!("generation {} stopped", generation);
    }

    fn on_failed(&self, generation: u64, message: String) {
        {
            let mut st = self.state();
            if !Self::is_current(&st, generation) {
                log::debug!("generation {} failed after abort: {}", generation, message);
                return;
            }
            st.phase = TurnPhase::Idle;
            st.in_flight.clear();
        }
        log::warn!("generation failed: {}", message);
        self.emit(ChatEvent::Error(message));
    }

    // --- models ---

    /// Abort any generation, ask the server to switch to `model` and wait (on a worker thread) until
    /// it answers again. Reports `ModelChanged` or `Error`.
    pub fn switch_model(&self, model: &str) -> Result<(), ChatError> {
        let model = model.trim().to_string();
        if model.is_empty() {
            return Err(ChatError::NoModelSelected);
        }
        self.begin_switch()?;
        let this = self.clone();
        std::thread::spawn(move || {
            let result = block_on(this.inner.client.switch_model(&model));
            this.finish_switch(model, result);
        });
        Ok(())
    }

    /// Compare the chat's model with the one the server serves and switch when they differ
    /// (on a worker thread). Reports `ModelChanged` only if a switch happened.
    pub fn sync_model_with_server(&self) -> Result<(), ChatError> {
        let wanted = self.state().selected_model()?;
        self.begin_switch()?;
        let this = self.clone();
        std::thread::spawn(move || {
            let result = block_on(async {
                let active = this.inner.client.active_model().await?;
                if active.as_deref() == Some(wanted.as_str()) {
                    log::debug!("server already serves {}", wanted);
                    return Ok(false);
                }
                log::info!(
                    "server serves {:?}, chat wants {}; switching",
                    active,
                    wanted
                );
                this.inner.client.switch_model(&wanted).await?;
                Ok::<bool, LlmError>(true)
            });
            match result {
                Ok(Ok(false)) => {
                    this.state().phase = TurnPhase::Idle;
                }
                Ok(Ok(true)) => this.finish_switch(wanted, Ok(Ok(()))),
                Ok(Err(e)) => this.finish_switch(wanted, Ok(Err(e))),
                Err(e) => this.finish_switch(wanted, Err(e)),
            }
        });
        Ok(())
    }

    fn begin_switch(&self) -> Result<(), ChatError> {
        let mut st = self.state();
        if st.phase == TurnPhase::SwitchingModel {
            return Err(ChatError::InvalidState("the model is being switched"));
        }
        st.abort_generation();
        st.phase = TurnPhase::SwitchingModel;
        Ok(())
    }

    fn finish_switch(&self, model: String, result: std::io::Result<Result<(), LlmError>>) {
        let outcome = match result {
            Ok(r) => r.map_err(ChatError::from),
            Err(e) => Err(ChatError::from(e)),
        };
        {
            let mut st = self.state();
            st.phase = TurnPhase::Idle;
            if outcome.is_ok() {
                st.model = Some(model.clone());
            }
        }
        match outcome {
            Ok(()) => {
                log::info!("server now serves {}", model);
                self.emit(ChatEvent::ModelChanged(model));
            }
            Err(e) => {
                log::warn!("switching to {} failed: {}", model, e);
                self.emit(ChatEvent::Error(format!("switching to {} failed: {}", model, e)));
            }
        }
    }
}

fn load_bot(bot_path: Option<&str>) -> Option<Persona> {
    let dir = bot_path.filter(|p| !p.trim().is_empty())?;
    match persona::load_persona(Path::new(dir)) {
        Ok(p) => Some(p),
        Err(e) => {
            log::warn!("could not load bot {}: {}", dir, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::session::Role;

    /// Controller pointed at a closed port; only for operations that stay off the network.
    fn offline(tag: &str) -> (ChatController, mpsc::Receiver<ChatEvent>) {
        let root = std::env::temp_dir().join(format!("palaver-ctl-{}-{}", tag, uuid::Uuid::new_v4()));
        let client = InferenceClient::new("http://127.0.0.1:9", "http://127.0.0.1:9", ServerConfig::default());
        ChatController::new(client, ChatLibrary::new(root), CompactionPolicy::default(), 0.7)
    }

    #[test]
    fn blank_user_message_is_ignored() {
        let (c, _rx) = offline("blank");
        assert!(!c.add_user_message("   \n "));
        assert!(c.transcript().is_empty());
    }

    #[test]
    fn user_message_goes_to_transcript_and_payload() {
        let (c, _rx) = offline("add");
        assert!(c.add_user_message("  line one\\nline two "));
        let t = c.transcript();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].role, Role::User);
        assert_eq!(t[0].content, "  line one\nline two ");
        assert!(t[0].ts.is_some());
        assert_eq!(c.payload(), vec![WireMessage::user("  line one\nline two ")]);
    }

    #[test]
    fn generate_without_model_fails() {
        let (c, _rx) = offline("nomodel");
        c.add_user_message("hi");
        assert!(matches!(c.generate(), Err(ChatError::NoModelSelected)));
        assert_eq!(c.phase(), TurnPhase::Idle);
    }

    #[test]
    fn history_edits_need_a_user_message() {
        let (c, _rx) = offline("edits");
        c.set_model("m");
        assert!(!c.delete_last_exchange());
        assert!(matches!(
            c.edit_last_user_message("x"),
            Err(ChatError::InvalidState(_))
        ));
        assert!(matches!(c.regenerate(), Err(ChatError::InvalidState(_))));
        c.add_user_message("q");
        assert!(matches!(
            c.edit_last_user_message("   "),
            Err(ChatError::InvalidState(_))
        ));
        assert_eq!(c.transcript()[0].content, "q");
    }

    #[test]
    fn delete_replays_payload() {
        let (c, _rx) = offline("delete");
        c.add_user_message("one");
        c.add_user_message("two");
        assert!(c.delete_last_exchange());
        assert_eq!(c.payload(), vec![WireMessage::user("one")]);
        assert!(c.delete_last_exchange());
        assert!(!c.delete_last_exchange());
        assert!(c.transcript().is_empty());
        assert!(c.payload().is_empty());
    }

    #[test]
    fn snapshot_puts_preset_first() {
        let (c, _rx) = offline("snapshot");
        c.set_preset("  Be brief. ");
        c.set_model("m");
        c.add_user_message("hi");
        let snap = c.snapshot();
        assert_eq!(snap.model, "m");
        assert_eq!(
            snap.payload,
            vec![WireMessage::system("Be brief."), WireMessage::user("hi")]
        );
    }

    #[test]
    fn failed_open_keeps_state() {
        let (c, _rx) = offline("open");
        c.add_user_message("keep me");
        let missing = std::env::temp_dir().join(format!("palaver-missing-{}.json", uuid::Uuid::new_v4()));
        assert!(matches!(c.load_chat(&missing), Err(ChatError::Store(_))));
        assert_eq!(c.transcript()[0].content, "keep me");
    }

    #[test]
    fn abort_when_idle_is_false() {
        let (c, _rx) = offline("abort");
        assert!(!c.abort());
    }
}
