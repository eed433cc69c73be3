//! Gambit Deck - deck resolution.
//!
//! Decks are markdown documents with TOML front matter between `+++`
//! fences, embedding cards and snippets through markdown image literals
//! and referencing nested action decks, schemas, and native executors.

pub mod assets;
pub mod front_matter;
pub mod loader;
pub mod types;
pub mod validate;

pub use front_matter::{parse_front_matter, DocumentKind, FrontMatter, SchemaSource};
pub use loader::{load_card, load_deck};
pub use types::{
    ActionTarget, DeckRef, ExecutorRef, HandlerRef, Handlers, LoadedAction, LoadedCard, LoadedDeck,
};
pub use validate::{validate_action_names, validate_tool_name};
