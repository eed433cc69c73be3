//! Loaded deck structures.

use gambit_core::schema::Schema;
use gambit_core::types::{Guardrails, ModelParams};
use gambit_sandbox::PermissionSet;
use std::path::{Path, PathBuf};

/// Reference to a deck: a prompt file or a native-executor module. The
/// path is stored resolved relative to its owner.
#[derive(Clone, Debug, PartialEq)]
pub struct DeckRef {
    pub path: PathBuf,
    pub name: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub id: Option<String>,
}

impl DeckRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            label: None,
            description: None,
            id: None,
        }
    }
}

/// What an action dispatches to.
#[derive(Clone, Debug, PartialEq)]
pub enum ActionTarget {
    /// A nested prompt deck, path resolved against the owning deck.
    Deck(PathBuf),
    /// A native executor, looked up in the runtime's executor registry.
    Executor(String),
}

/// One action a deck exposes as a callable tool.
#[derive(Clone, Debug)]
pub struct LoadedAction {
    pub name: String,
    pub description: String,
    pub target: ActionTarget,
    pub label: Option<String>,
    pub id: Option<String>,
    /// Whether dispatches of this action may overlap with its siblings.
    pub parallel: bool,
    /// The owner's declared narrowing for this child (the reference
    /// layer), normalized against the owning deck's directory.
    pub permissions: Option<PermissionSet>,
    /// Schemas declared on the action itself, used by compute actions.
    pub context_schema: Option<Schema>,
    pub response_schema: Option<Schema>,
}

/// Handler deck reference with its firing cadence.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerRef {
    pub path: PathBuf,
    pub repeat_ms: Option<u64>,
}

/// Side-effect handlers a deck may declare.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Handlers {
    pub on_busy: Option<HandlerRef>,
    pub on_idle: Option<HandlerRef>,
    pub on_error: Option<HandlerRef>,
}

impl Handlers {
    pub fn is_empty(&self) -> bool {
        self.on_busy.is_none() && self.on_idle.is_none() && self.on_error.is_none()
    }
}

/// An embeddable card document.
#[derive(Clone, Debug)]
pub struct LoadedCard {
    pub path: PathBuf,
    pub body: String,
    pub respond: bool,
    pub allow_end: bool,
    pub action_refs: Vec<DeckRef>,
    pub test_refs: Vec<DeckRef>,
    pub grader_refs: Vec<DeckRef>,
    pub cards: Vec<LoadedCard>,
    pub context_fragment: Option<serde_json::Value>,
    pub response_fragment: Option<serde_json::Value>,
}

/// Reference to a native executor registered with the runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorRef {
    pub key: String,
    pub base_dir: PathBuf,
}

/// A fully resolved deck, ready to run.
#[derive(Clone, Debug)]
pub struct LoadedDeck {
    pub path: PathBuf,
    pub body: String,
    pub label: Option<String>,
    pub start_mode: Option<String>,
    pub model_params: Option<ModelParams>,
    pub guardrails: Option<Guardrails>,
    pub actions: Vec<LoadedAction>,
    pub scenario_decks: Vec<DeckRef>,
    pub grader_decks: Vec<DeckRef>,
    pub cards: Vec<LoadedCard>,
    pub context_schema: Option<Schema>,
    pub response_schema: Option<Schema>,
    pub executor: Option<ExecutorRef>,
    pub handlers: Handlers,
    pub respond: bool,
    pub allow_end: bool,
    pub permissions: Option<PermissionSet>,
}

impl LoadedDeck {
    /// The directory the deck's relative references resolve against.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Synthetic deck for a native-executor reference; the runtime binds
    /// the registered executor and its declared schemas at spawn.
    pub fn executor_deck(key: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let key = key.into();
        Self {
            path: base_dir.join(&key),
            body: String::new(),
            label: None,
            start_mode: None,
            model_params: None,
            guardrails: None,
            actions: Vec::new(),
            scenario_decks: Vec::new(),
            grader_decks: Vec::new(),
            cards: Vec::new(),
            context_schema: None,
            response_schema: None,
            executor: Some(ExecutorRef { key, base_dir }),
            handlers: Handlers::default(),
            respond: false,
            allow_end: false,
            permissions: None,
        }
    }

    pub fn find_action(&self, name: &str) -> Option<&LoadedAction> {
        self.actions.iter().find(|a| a.name == name)
    }
}
