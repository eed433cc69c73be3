//! Bundled virtual assets behind the `gambit://` scheme.
//!
//! The table is populated at build time; resolution is a single lookup,
//! never filesystem or network access.

/// Inlined when a body embeds `gambit://respond`.
pub const RESPOND_TEXT: &str = "\
When your work is complete, call the `gambit_respond` tool exactly once \
with a `payload` matching the deck's response schema. Do not describe the \
payload in prose; the tool call is the response.";

/// Inlined when a body embeds `gambit://init`.
pub const INIT_TEXT: &str = "\
Begin by reading the provided context carefully. State assumptions only \
when the context leaves a required detail open, and prefer the narrowest \
reading that satisfies the request.";

/// Inlined when a body embeds `gambit://end`.
pub const END_TEXT: &str = "\
If the conversation has reached a natural conclusion and no further work \
is possible, call the `gambit_end` tool with a short closing message. \
Ending is terminal; do not call it while work remains.";

/// The build-time asset table. Keys are full `gambit://` URIs.
static ASSETS: &[(&str, &str)] = &[
    (
        "gambit://cards/concise.card.md",
        "+++\n+++\nKeep replies short. Lead with the answer; add detail only when asked.\n",
    ),
    (
        "gambit://cards/cautious.card.md",
        "+++\n+++\nWhen a request is ambiguous or destructive, ask before acting. Never \
guess at credentials, paths, or identifiers.\n",
    ),
    (
        "gambit://snippets/tool-use.md",
        "Call tools with complete argument objects. Wait for each tool result \
before deciding the next step.\n",
    ),
    (
        "gambit://schemas/empty-object.json",
        r#"{"type": "object", "additionalProperties": false}"#,
    ),
    (
        "gambit://schemas/text-payload.json",
        r#"{"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}"#,
    ),
    (
        "gambit://decks/echo/PROMPT.md",
        "+++\nlabel = \"Echo\"\n+++\nRepeat the user's message back verbatim.\n",
    ),
];

/// Look a bundled asset up by its full URI.
pub fn builtin_asset(uri: &str) -> Option<&'static str> {
    ASSETS.iter().find(|(k, _)| *k == uri).map(|(_, v)| *v)
}

pub fn is_virtual(path: &str) -> bool {
    path.starts_with("gambit://")
}
