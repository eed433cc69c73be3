//! Front matter parsing and legacy-alias normalization.
//!
//! Front matter is TOML between `+++` fences at the top of the document.
//! An absent block yields an empty attribute map; an unterminated or
//! malformed block is a `FrontMatterParseError`. Deprecated aliases keep
//! working but warn exactly once per (deck path, key).

use gambit_core::types::{Guardrails, ModelParams};
use gambit_core::{Error, Result};
use gambit_sandbox::PermissionDecl;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::warn;

/// A schema as referenced in front matter: a path (filesystem or
/// `gambit://schemas/...`) or an inline document.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SchemaSource {
    Path(String),
    Inline(toml::Value),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAction {
    pub name: Option<String>,
    pub description: Option<String>,
    pub path: Option<String>,
    pub execute: Option<String>,
    pub label: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub parallel: bool,
    pub permissions: Option<PermissionDecl>,
    pub context_schema: Option<SchemaSource>,
    pub response_schema: Option<SchemaSource>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRef {
    pub path: String,
    pub name: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHandler {
    pub path: String,
    pub repeat_ms: Option<u64>,
    /// Legacy alias for `repeatMs`.
    pub interval_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawHandlers {
    pub on_busy: Option<RawHandler>,
    pub on_idle: Option<RawHandler>,
    pub on_error: Option<RawHandler>,
    /// Legacy alias for `onBusy`.
    pub on_interval: Option<RawHandler>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGuardrails {
    max_depth: Option<u32>,
    max_passes: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrontMatter {
    label: Option<String>,
    description: Option<String>,
    start_mode: Option<String>,
    model_params: Option<ModelParams>,
    guardrails: Option<RawGuardrails>,
    context_schema: Option<SchemaSource>,
    response_schema: Option<SchemaSource>,
    context_fragment: Option<SchemaSource>,
    response_fragment: Option<SchemaSource>,
    /// Legacy: `contextSchema` on decks, `contextFragment` on cards.
    input_schema: Option<SchemaSource>,
    /// Legacy: `responseSchema` on decks, `responseFragment` on cards.
    output_schema: Option<SchemaSource>,
    execute: Option<String>,
    actions: Option<Vec<RawAction>>,
    /// Legacy alias for `[[actions]]`.
    action_decks: Option<Vec<RawAction>>,
    scenarios: Option<Vec<RawRef>>,
    graders: Option<Vec<RawRef>>,
    /// Legacy alias for `[[scenarios]]`.
    test_decks: Option<Vec<RawRef>>,
    /// Legacy alias for `[[graders]]`.
    grader_decks: Option<Vec<RawRef>>,
    handlers: Option<RawHandlers>,
    permissions: Option<PermissionDecl>,
    mcp_servers: Option<toml::Value>,
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

/// Normalized attributes, aliases already folded in.
#[derive(Clone, Debug, Default)]
pub struct FrontMatter {
    pub label: Option<String>,
    pub description: Option<String>,
    pub start_mode: Option<String>,
    pub model_params: Option<ModelParams>,
    pub guardrails: Option<Guardrails>,
    pub context_schema: Option<SchemaSource>,
    pub response_schema: Option<SchemaSource>,
    pub context_fragment: Option<SchemaSource>,
    pub response_fragment: Option<SchemaSource>,
    pub execute: Option<String>,
    pub actions: Vec<RawAction>,
    pub scenarios: Vec<RawRef>,
    pub graders: Vec<RawRef>,
    pub handlers: RawHandlers,
    pub permissions: Option<PermissionDecl>,
    pub mcp_servers_present: bool,
}

/// Whether the document is a deck or an embeddable card; legacy schema
/// aliases fold differently for the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    Deck,
    Card,
}

static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn warn_once(path: &Path, key: &str, message: &str, out: &mut Vec<String>) {
    let token = format!("{}::{}", path.display(), key);
    let mut seen = WARNED.get_or_init(Default::default).lock().unwrap();
    if seen.insert(token) {
        warn!(path = %path.display(), key, "{}", message);
        out.push(message.to_string());
    }
}

/// Split the `+++` fences. Returns the TOML block (if present) and the
/// body after it.
fn split_fences(source: &str) -> std::result::Result<(Option<&str>, &str), String> {
    let source = source.strip_prefix('\u{feff}').unwrap_or(source);
    let first_line = source.split_inclusive('\n').next().unwrap_or(source);
    if first_line.trim_end_matches(['\r', '\n']) != "+++" {
        return Ok((None, source));
    }

    let rest = &source[first_line.len()..];
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "+++" {
            let block = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((Some(block), body));
        }
        offset += line.len();
    }
    Err("unterminated `+++` front matter fence".to_string())
}

/// Parse a document's front matter, folding legacy aliases. Returns the
/// normalized attributes, the body, and any freshly emitted warnings.
pub fn parse_front_matter(
    path: &Path,
    source: &str,
    kind: DocumentKind,
) -> Result<(FrontMatter, String, Vec<String>)> {
    let (block, body) =
        split_fences(source).map_err(|msg| Error::front_matter(path.display().to_string(), msg))?;

    let raw: RawFrontMatter = match block {
        None => RawFrontMatter::default(),
        Some(block) => toml::from_str(block)
            .map_err(|e| Error::front_matter(path.display().to_string(), e.to_string()))?,
    };

    let mut warnings = Vec::new();
    let mut fm = FrontMatter {
        label: raw.label,
        description: raw.description,
        start_mode: raw.start_mode,
        model_params: raw.model_params,
        guardrails: raw.guardrails.map(|g| Guardrails {
            max_depth: g.max_depth.unwrap_or(gambit_core::types::DEFAULT_MAX_DEPTH),
            max_passes: g.max_passes.unwrap_or(gambit_core::types::DEFAULT_MAX_PASSES),
            timeout_ms: g.timeout_ms.unwrap_or(gambit_core::types::DEFAULT_TIMEOUT_MS),
        }),
        context_schema: raw.context_schema,
        response_schema: raw.response_schema,
        context_fragment: raw.context_fragment,
        response_fragment: raw.response_fragment,
        execute: raw.execute,
        actions: raw.actions.unwrap_or_default(),
        scenarios: raw.scenarios.unwrap_or_default(),
        graders: raw.graders.unwrap_or_default(),
        handlers: raw.handlers.unwrap_or_default(),
        permissions: raw.permissions,
        mcp_servers_present: raw.mcp_servers.is_some(),
    };

    // Legacy schema aliases fold per document kind.
    if let Some(legacy) = raw.input_schema {
        match kind {
            DocumentKind::Deck => {
                warn_once(path, "inputSchema", "`inputSchema` is deprecated; use `contextSchema`", &mut warnings);
                fm.context_schema.get_or_insert(legacy);
            }
            DocumentKind::Card => {
                warn_once(path, "inputSchema", "`inputSchema` is deprecated; use `contextFragment`", &mut warnings);
                fm.context_fragment.get_or_insert(legacy);
            }
        }
    }
    if let Some(legacy) = raw.output_schema {
        match kind {
            DocumentKind::Deck => {
                warn_once(path, "outputSchema", "`outputSchema` is deprecated; use `responseSchema`", &mut warnings);
                fm.response_schema.get_or_insert(legacy);
            }
            DocumentKind::Card => {
                warn_once(path, "outputSchema", "`outputSchema` is deprecated; use `responseFragment`", &mut warnings);
                fm.response_fragment.get_or_insert(legacy);
            }
        }
    }

    if let Some(legacy) = raw.action_decks {
        warn_once(path, "actionDecks", "`actionDecks` is deprecated; use `[[actions]]`", &mut warnings);
        if fm.actions.is_empty() {
            fm.actions = legacy;
        }
    }
    if let Some(legacy) = raw.test_decks {
        warn_once(path, "testDecks", "`testDecks` is deprecated; use `[[scenarios]]`", &mut warnings);
        if fm.scenarios.is_empty() {
            fm.scenarios = legacy;
        }
    }
    if let Some(legacy) = raw.grader_decks {
        warn_once(path, "graderDecks", "`graderDecks` is deprecated; use `[[graders]]`", &mut warnings);
        if fm.graders.is_empty() {
            fm.graders = legacy;
        }
    }

    if let Some(legacy) = fm.handlers.on_interval.take() {
        warn_once(path, "handlers.onInterval", "`handlers.onInterval` is deprecated; use `handlers.onBusy`", &mut warnings);
        fm.handlers.on_busy.get_or_insert(legacy);
    }
    for handler in [
        fm.handlers.on_busy.as_mut(),
        fm.handlers.on_idle.as_mut(),
        fm.handlers.on_error.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(interval) = handler.interval_ms.take() {
            warn_once(path, "handlers.intervalMs", "`intervalMs` is deprecated; use `repeatMs`", &mut warnings);
            handler.repeat_ms.get_or_insert(interval);
        }
    }

    for key in raw.unknown.keys() {
        warn_once(
            path,
            key,
            &format!("unrecognized front matter key `{key}` ignored"),
            &mut warnings,
        );
    }

    Ok((fm, body.to_string(), warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unique_path(tag: &str) -> PathBuf {
        PathBuf::from(format!("/virtual/{}-{}/PROMPT.md", tag, uuid_like()))
    }

    fn uuid_like() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    }

    #[test]
    fn absent_front_matter_is_empty() {
        let (fm, body, warnings) =
            parse_front_matter(&unique_path("absent"), "Just a body.\n", DocumentKind::Deck)
                .unwrap();
        assert!(fm.label.is_none());
        assert_eq!(body, "Just a body.\n");
        assert!(warnings.is_empty());
    }

    #[test]
    fn fenced_block_parses_and_body_survives() {
        let source = "+++\nlabel = \"Demo\"\n\n[modelParams]\nmodel = \"fast\"\n+++\nThe body.\n";
        let (fm, body, _) =
            parse_front_matter(&unique_path("fenced"), source, DocumentKind::Deck).unwrap();
        assert_eq!(fm.label.as_deref(), Some("Demo"));
        assert_eq!(fm.model_params.unwrap().model.as_deref(), Some("fast"));
        assert_eq!(body, "The body.\n");
    }

    #[test]
    fn unterminated_fence_fails() {
        let err = parse_front_matter(
            &unique_path("untermed"),
            "+++\nlabel = \"x\"\n",
            DocumentKind::Deck,
        )
        .unwrap_err();
        assert_eq!(err.name(), "FrontMatterParseError");
    }

    #[test]
    fn malformed_toml_fails() {
        let err = parse_front_matter(
            &unique_path("badtoml"),
            "+++\nlabel = = \"x\"\n+++\nbody",
            DocumentKind::Deck,
        )
        .unwrap_err();
        assert_eq!(err.name(), "FrontMatterParseError");
    }

    #[test]
    fn legacy_schema_alias_warns_once_per_path() {
        let path = unique_path("legacy");
        let source = "+++\ninputSchema = \"./ctx.json\"\noutputSchema = \"./out.json\"\n+++\nbody";

        let (fm, _, warnings) = parse_front_matter(&path, source, DocumentKind::Deck).unwrap();
        assert!(fm.context_schema.is_some());
        assert!(fm.response_schema.is_some());
        assert_eq!(warnings.len(), 2);

        // Second parse of the same path stays quiet.
        let (_, _, warnings) = parse_front_matter(&path, source, DocumentKind::Deck).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn legacy_aliases_fold_to_fragments_on_cards() {
        let source = "+++\ninputSchema = \"./frag.json\"\n+++\nbody";
        let (fm, _, _) =
            parse_front_matter(&unique_path("cardfrag"), source, DocumentKind::Card).unwrap();
        assert!(fm.context_fragment.is_some());
        assert!(fm.context_schema.is_none());
    }

    #[test]
    fn handler_interval_aliases_fold() {
        let source = "+++\n[handlers.onInterval]\npath = \"./busy/PROMPT.md\"\nintervalMs = 2500\n+++\nbody";
        let (fm, _, warnings) =
            parse_front_matter(&unique_path("handlers"), source, DocumentKind::Deck).unwrap();
        let busy = fm.handlers.on_busy.unwrap();
        assert_eq!(busy.repeat_ms, Some(2500));
        assert_eq!(warnings.len(), 2); // onInterval + intervalMs
    }

    #[test]
    fn partial_guardrails_fill_defaults() {
        let source = "+++\n[guardrails]\nmaxPasses = 4\n+++\nbody";
        let (fm, _, _) =
            parse_front_matter(&unique_path("guardrails"), source, DocumentKind::Deck).unwrap();
        let g = fm.guardrails.unwrap();
        assert_eq!(g.max_passes, 4);
        assert_eq!(g.max_depth, 3);
        assert_eq!(g.timeout_ms, 120_000);
    }
}
