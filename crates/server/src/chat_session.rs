//! Per-connection chat session state machine
//!
//! `ChatSession::apply(input) -> effects` is pure and synchronous: it never
//! spawns, sleeps or touches the socket. The connection loop executes the
//! returned effects and feeds turn results back in as inputs.

use std::path::{Path, PathBuf};

use promptdock_protocol::{new_id, ServerMessage, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Idle,
    Active,
    Responding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The worker exited 0; `reply` is its full captured output.
    Succeeded { reply: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    Chat(String),
    Close,
    TurnFinished {
        generation: u64,
        outcome: TurnOutcome,
    },
}

/// Everything a turn runner needs, snapshotted at the moment the turn began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub generation: u64,
    pub prompt: String,
    pub history: Vec<Turn>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(ServerMessage),
    RunTurn(TurnRequest),
}

#[derive(Debug)]
pub struct ChatSession {
    phase: ChatPhase,
    history: Vec<Turn>,
    working_dir: Option<PathBuf>,
    session_root: PathBuf,
    /// Bumped on every activation and close so results from an earlier
    /// activation can be recognised and dropped.
    generation: u64,
    /// Prompt of the in-flight turn, appended to history on success.
    pending_prompt: Option<String>,
}

impl ChatSession {
    pub fn new(session_root: impl Into<PathBuf>) -> Self {
        Self {
            phase: ChatPhase::Idle,
            history: Vec::new(),
            working_dir: None,
            session_root: session_root.into(),
            generation: 0,
            pending_prompt: None,
        }
    }

    pub fn phase(&self) -> ChatPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != ChatPhase::Idle
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether streamed events tagged with `generation` should still reach
    /// the client.
    pub fn routes(&self, generation: u64) -> bool {
        self.phase == ChatPhase::Responding && self.generation == generation
    }

    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Start => {
                if self.is_active() {
                    return vec![Effect::Emit(ServerMessage::SessionStarted(
                        "Chat session already active.".into(),
                    ))];
                }
                self.activate();
                vec![Effect::Emit(ServerMessage::SessionStarted(
                    "Chat session started.".into(),
                ))]
            }

            Input::Chat(prompt) => {
                let mut effects = Vec::new();
                match self.phase {
                    ChatPhase::Responding => {
                        return vec![Effect::Emit(ServerMessage::Error(
                            "Please wait for the current response to finish.".into(),
                        ))];
                    }
                    ChatPhase::Idle => {
                        self.activate();
                        effects.push(Effect::Emit(ServerMessage::SessionStarted(
                            "Chat session auto-started.".into(),
                        )));
                    }
                    ChatPhase::Active => {}
                }

                let Some(working_dir) = self.working_dir.clone() else {
                    return effects;
                };
                self.phase = ChatPhase::Responding;
                self.pending_prompt = Some(prompt.clone());
                effects.push(Effect::RunTurn(TurnRequest {
                    generation: self.generation,
                    prompt,
                    history: self.history.clone(),
                    working_dir,
                }));
                effects
            }

            Input::Close => {
                let cleared = self.history.len();
                self.deactivate();
                vec![Effect::Emit(ServerMessage::SessionClosed(format!(
                    "Chat session closed. {cleared} messages cleared."
                )))]
            }

            Input::TurnFinished {
                generation,
                outcome,
            } => {
                if !self.routes(generation) {
                    return Vec::new();
                }
                self.phase = ChatPhase::Active;
                let prompt = self.pending_prompt.take();
                match outcome {
                    TurnOutcome::Succeeded { reply } => {
                        if let Some(prompt) = prompt {
                            self.history.push(Turn::user(prompt));
                            self.history.push(Turn::assistant(reply.trim()));
                        }
                        Vec::new()
                    }
                    TurnOutcome::Failed { message } => {
                        vec![Effect::Emit(ServerMessage::Error(message))]
                    }
                }
            }
        }
    }

    fn activate(&mut self) {
        self.generation += 1;
        self.history.clear();
        self.pending_prompt = None;
        self.working_dir = Some(self.session_root.join(format!("chat-{}", new_id())));
        self.phase = ChatPhase::Active;
    }

    fn deactivate(&mut self) {
        self.generation += 1;
        self.history.clear();
        self.pending_prompt = None;
        self.working_dir = None;
        self.phase = ChatPhase::Idle;
    }
}
