//! Deck and card resolution.
//!
//! `load_deck` turns a prompt file (or a `gambit://decks/...` virtual
//! path, or a native-executor reference) into a [`LoadedDeck`]: front
//! matter parsed, embeds expanded, card fragments merged into the deck
//! schemas, tool names validated, permissions normalized.

use crate::assets::{builtin_asset, is_virtual, END_TEXT, INIT_TEXT, RESPOND_TEXT};
use crate::front_matter::{parse_front_matter, DocumentKind, RawAction, RawHandler, RawRef, SchemaSource};
use crate::types::{
    ActionTarget, DeckRef, HandlerRef, Handlers, LoadedAction, LoadedCard, LoadedDeck,
};
use crate::validate::validate_action_names;
use gambit_core::schema::Schema;
use gambit_core::{Error, Result};
use gambit_sandbox::{canonicalize_lenient, PermissionSet};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

fn embed_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // A markdown image literal: ![alt](target)
    PATTERN.get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("static pattern"))
}

/// Load a deck from a filesystem path, a `gambit://decks/...` virtual
/// path, or a native-executor reference (any non-`.md` path).
pub fn load_deck(path: impl AsRef<Path>) -> Result<LoadedDeck> {
    let raw = path.as_ref();
    let uri = raw.to_string_lossy();

    if is_virtual(&uri) {
        let source = builtin_asset(&uri)
            .ok_or_else(|| Error::invalid_deck(uri.clone(), "unknown builtin deck"))?;
        let mut loader = Loader::default();
        loader.stack.push(raw.to_path_buf());
        return loader.parse_deck(raw, source);
    }

    if raw.extension().map_or(true, |ext| ext != "md") {
        // A native-executor module reference; the runtime binds the
        // registered executor at spawn.
        let base_dir = raw
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        return Ok(LoadedDeck::executor_deck(uri.into_owned(), base_dir));
    }

    let resolved = std::fs::canonicalize(raw)?;
    let source = std::fs::read_to_string(&resolved)?;
    let mut loader = Loader::default();
    loader.stack.push(resolved.clone());
    loader.parse_deck(&resolved, &source)
}

/// Load a single card document.
pub fn load_card(path: impl AsRef<Path>) -> Result<LoadedCard> {
    Loader::default().load_card_at(path.as_ref())
}

#[derive(Default)]
struct Loader {
    /// Documents currently being expanded, for cycle detection.
    stack: Vec<PathBuf>,
}

#[derive(Default)]
struct EmbedFlags {
    respond: bool,
    allow_end: bool,
}

impl Loader {
    fn parse_deck(&mut self, path: &Path, source: &str) -> Result<LoadedDeck> {
        let deck_display = path.display().to_string();
        let (fm, body, _warnings) = parse_front_matter(path, source, DocumentKind::Deck)?;

        if fm.mcp_servers_present {
            return Err(Error::UnsupportedFeature(format!(
                "{deck_display}: mcpServers blocks are not supported"
            )));
        }
        if fm.execute.is_some() {
            return Err(Error::invalid_deck(
                deck_display.as_str(),
                "top-level `execute` is not allowed; declare executors per action",
            ));
        }

        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let mut flags = EmbedFlags::default();
        let mut cards = Vec::new();
        let body = self.expand_body(&dir, &body, &mut flags, &mut cards)?;

        // Resolve declared schemas, then fold card fragments in.
        let mut context_value = fm
            .context_schema
            .as_ref()
            .map(|s| resolve_schema_value(s, &dir, &deck_display))
            .transpose()?;
        let mut response_value = fm
            .response_schema
            .as_ref()
            .map(|s| resolve_schema_value(s, &dir, &deck_display))
            .transpose()?;
        fold_fragments(&cards, &mut context_value, &mut response_value);

        let context_schema = context_value.map(Schema::from_value).transpose()?;
        let response_schema = response_value.map(Schema::from_value).transpose()?;

        let actions = fm
            .actions
            .iter()
            .map(|raw| self.resolve_action(raw, &dir, &deck_display))
            .collect::<Result<Vec<_>>>()?;
        validate_action_names(actions.iter().map(|a| a.name.as_str()))?;

        let permissions = fm
            .permissions
            .as_ref()
            .map(|decl| PermissionSet::from_decl(decl, &dir))
            .transpose()
            .map_err(|e| Error::invalid_deck(deck_display.as_str(), e.to_string()))?;

        let handlers = Handlers {
            on_busy: fm.handlers.on_busy.as_ref().map(|h| resolve_handler(h, &dir)),
            on_idle: fm.handlers.on_idle.as_ref().map(|h| resolve_handler(h, &dir)),
            on_error: fm.handlers.on_error.as_ref().map(|h| resolve_handler(h, &dir)),
        };

        debug!(
            deck = %deck_display,
            actions = actions.len(),
            cards = cards.len(),
            "deck loaded"
        );

        Ok(LoadedDeck {
            path: path.to_path_buf(),
            body,
            label: fm.label,
            start_mode: fm.start_mode,
            model_params: fm.model_params,
            guardrails: fm.guardrails,
            actions,
            scenario_decks: fm.scenarios.iter().map(|r| resolve_ref(r, &dir)).collect(),
            grader_decks: fm.graders.iter().map(|r| resolve_ref(r, &dir)).collect(),
            cards,
            context_schema,
            response_schema,
            executor: None,
            handlers,
            respond: flags.respond,
            allow_end: flags.allow_end,
            permissions,
        })
    }

    fn resolve_action(
        &self,
        raw: &RawAction,
        dir: &Path,
        deck_display: &str,
    ) -> Result<LoadedAction> {
        let name = raw.name.clone().ok_or_else(|| {
            Error::invalid_deck(deck_display, "action requires a `name`")
        })?;
        let description = raw.description.clone().ok_or_else(|| {
            Error::invalid_deck(
                deck_display,
                format!("action `{name}` requires a `description`"),
            )
        })?;

        let target = match (&raw.path, &raw.execute) {
            (Some(path), None) => ActionTarget::Deck(resolve_path(dir, path)),
            (None, Some(key)) => ActionTarget::Executor(key.clone()),
            _ => {
                return Err(Error::invalid_deck(
                    deck_display,
                    format!("action `{name}` must declare exactly one of `path` or `execute`"),
                ))
            }
        };

        let permissions = raw
            .permissions
            .as_ref()
            .map(|decl| PermissionSet::from_decl(decl, dir))
            .transpose()
            .map_err(|e| Error::invalid_deck(deck_display, e.to_string()))?;

        let context_schema = raw
            .context_schema
            .as_ref()
            .map(|s| resolve_schema_value(s, dir, deck_display).and_then(compile_schema))
            .transpose()?;
        let response_schema = raw
            .response_schema
            .as_ref()
            .map(|s| resolve_schema_value(s, dir, deck_display).and_then(compile_schema))
            .transpose()?;

        Ok(LoadedAction {
            name,
            description,
            target,
            label: raw.label.clone(),
            id: raw.id.clone(),
            parallel: raw.parallel,
            permissions,
            context_schema,
            response_schema,
        })
    }

    fn load_card_at(&mut self, path: &Path) -> Result<LoadedCard> {
        let resolved = std::fs::canonicalize(path)?;
        self.check_cycle(&resolved)?;
        self.stack.push(resolved.clone());
        let source = std::fs::read_to_string(&resolved)?;
        let card = self.parse_card(&resolved, &source);
        self.stack.pop();
        card
    }

    /// Load a builtin card or snippet from the asset table.
    fn load_builtin_card(&mut self, uri: &str, owner: &str) -> Result<LoadedCard> {
        let source = builtin_asset(uri).ok_or_else(|| {
            Error::invalid_deck(owner, format!("unknown builtin asset `{uri}`"))
        })?;
        let virtual_path = PathBuf::from(uri);
        self.check_cycle(&virtual_path)?;
        self.stack.push(virtual_path.clone());
        let card = self.parse_card(&virtual_path, source);
        self.stack.pop();
        card
    }

    fn check_cycle(&self, next: &Path) -> Result<()> {
        if let Some(start) = self.stack.iter().position(|p| p == next) {
            let mut chain: Vec<String> = self.stack[start..]
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            chain.push(next.display().to_string());
            return Err(Error::EmbedCycle {
                chain: chain.join(" -> "),
            });
        }
        Ok(())
    }

    fn parse_card(&mut self, path: &Path, source: &str) -> Result<LoadedCard> {
        let (fm, body, _warnings) = parse_front_matter(path, source, DocumentKind::Card)?;
        let display = path.display().to_string();
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();

        let mut flags = EmbedFlags::default();
        let mut cards = Vec::new();
        let body = self.expand_body(&dir, &body, &mut flags, &mut cards)?;

        let context_fragment = fm
            .context_fragment
            .as_ref()
            .map(|s| resolve_schema_value(s, &dir, &display))
            .transpose()?;
        let response_fragment = fm
            .response_fragment
            .as_ref()
            .map(|s| resolve_schema_value(s, &dir, &display))
            .transpose()?;

        Ok(LoadedCard {
            path: path.to_path_buf(),
            body,
            respond: flags.respond,
            allow_end: flags.allow_end,
            action_refs: fm.actions.iter().map(|a| action_ref(a, &dir)).collect(),
            test_refs: fm.scenarios.iter().map(|r| resolve_ref(r, &dir)).collect(),
            grader_refs: fm.graders.iter().map(|r| resolve_ref(r, &dir)).collect(),
            cards,
            context_fragment,
            response_fragment,
        })
    }

    /// Expand `![alt](target)` embeds, substituting builtin texts and card
    /// bodies in place.
    fn expand_body(
        &mut self,
        dir: &Path,
        body: &str,
        flags: &mut EmbedFlags,
        cards: &mut Vec<LoadedCard>,
    ) -> Result<String> {
        let owner = dir.display().to_string();
        let mut out = String::with_capacity(body.len());
        let mut last = 0;

        for caps in embed_pattern().captures_iter(body) {
            let whole = caps.get(0).expect("match");
            let target = caps.get(2).expect("target").as_str().trim();
            out.push_str(&body[last..whole.start()]);
            last = whole.end();

            match target {
                "gambit://respond" => {
                    out.push_str(RESPOND_TEXT);
                    flags.respond = true;
                }
                "gambit://init" => out.push_str(INIT_TEXT),
                "gambit://end" => {
                    out.push_str(END_TEXT);
                    flags.allow_end = true;
                }
                uri if uri.starts_with("gambit://cards/")
                    || uri.starts_with("gambit://snippets/") =>
                {
                    let card = self.load_builtin_card(uri, &owner)?;
                    out.push_str(card.body.trim_end());
                    flags.respond |= card.respond;
                    flags.allow_end |= card.allow_end;
                    cards.push(card);
                }
                uri if uri.starts_with("gambit://") => {
                    return Err(Error::invalid_deck(
                        owner.as_str(),
                        format!("`{uri}` cannot be embedded"),
                    ));
                }
                rel => {
                    let card = self.load_card_at(&resolve_path(dir, rel))?;
                    out.push_str(card.body.trim_end());
                    flags.respond |= card.respond;
                    flags.allow_end |= card.allow_end;
                    cards.push(card);
                }
            }
        }
        out.push_str(&body[last..]);
        Ok(out)
    }
}

fn resolve_path(dir: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        canonicalize_lenient(p)
    } else {
        canonicalize_lenient(&dir.join(p))
    }
}

fn resolve_ref(raw: &RawRef, dir: &Path) -> DeckRef {
    DeckRef {
        path: resolve_path(dir, &raw.path),
        name: raw.name.clone(),
        label: raw.label.clone(),
        description: raw.description.clone(),
        id: raw.id.clone(),
    }
}

fn action_ref(raw: &RawAction, dir: &Path) -> DeckRef {
    let path = match (&raw.path, &raw.execute) {
        (Some(p), _) => resolve_path(dir, p),
        (None, Some(key)) => dir.join(key),
        (None, None) => dir.to_path_buf(),
    };
    DeckRef {
        path,
        name: raw.name.clone(),
        label: raw.label.clone(),
        description: raw.description.clone(),
        id: raw.id.clone(),
    }
}

fn resolve_handler(raw: &RawHandler, dir: &Path) -> HandlerRef {
    HandlerRef {
        path: resolve_path(dir, &raw.path),
        repeat_ms: raw.repeat_ms,
    }
}

fn resolve_schema_value(
    source: &SchemaSource,
    dir: &Path,
    owner: &str,
) -> Result<serde_json::Value> {
    match source {
        SchemaSource::Inline(value) => {
            serde_json::to_value(value).map_err(Error::from)
        }
        SchemaSource::Path(p) if p.starts_with("gambit://") => {
            let content = builtin_asset(p).ok_or_else(|| {
                Error::invalid_deck(owner, format!("unknown builtin schema `{p}`"))
            })?;
            serde_json::from_str(content).map_err(Error::from)
        }
        SchemaSource::Path(p) => {
            let full = resolve_path(dir, p);
            let content = std::fs::read_to_string(&full)?;
            serde_json::from_str(&content).map_err(Error::from)
        }
    }
}

/// Depth-first fold of card fragments into the deck schema values; later
/// fragments win on key collision.
fn fold_fragments(
    cards: &[LoadedCard],
    context: &mut Option<serde_json::Value>,
    response: &mut Option<serde_json::Value>,
) {
    for card in cards {
        fold_fragments(&card.cards, context, response);
        if let Some(frag) = &card.context_fragment {
            let merged = merge_fragment(context.take(), frag);
            *context = Some(merged);
        }
        if let Some(frag) = &card.response_fragment {
            let merged = merge_fragment(response.take(), frag);
            *response = Some(merged);
        }
    }
}

fn merge_fragment(base: Option<serde_json::Value>, fragment: &serde_json::Value) -> serde_json::Value {
    match base {
        None => fragment.clone(),
        Some(base) => deep_union(base, fragment),
    }
}

fn deep_union(base: serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(key) {
                    Some(existing) => deep_union(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            serde_json::Value::Object(base)
        }
        (_, other) => other.clone(),
    }
}

fn compile_schema(value: serde_json::Value) -> Result<Schema> {
    Schema::from_value(value).map_err(Error::from)
}
