//! Scope algebra and declaration normalization.

use crate::checks::canonicalize_lenient;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("invalid permission declaration: {0}")]
    InvalidDeclaration(String),
}

fn path_contains(outer: &str, inner: &str) -> bool {
    inner == outer || Path::new(inner).starts_with(Path::new(outer))
}

/// Grant for a single resource kind. Path kinds hold canonical absolute
/// paths; `net`, `env`, and `run.commands` hold opaque tokens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    All,
    None,
    Set(BTreeSet<String>),
}

impl Scope {
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None) || matches!(self, Self::Set(s) if s.is_empty())
    }

    /// Token meet: `all ∩ x = x`; `none ∩ x = none`;
    /// `set(A) ∩ set(B) = set(A ∩ B)` by exact membership.
    pub fn intersect(&self, other: &Scope) -> Scope {
        match (self, other) {
            (Scope::All, x) | (x, Scope::All) => x.clone(),
            (Scope::None, _) | (_, Scope::None) => Scope::None,
            (Scope::Set(a), Scope::Set(b)) => {
                let common: BTreeSet<String> = a.intersection(b).cloned().collect();
                if common.is_empty() {
                    Scope::None
                } else {
                    Scope::Set(common)
                }
            }
        }
    }

    /// Path meet. A grant names a directory subtree, so the intersection
    /// of two grant sets is the set of subtrees contained by both sides:
    /// `{/w/a} ∩ {/w/a/b} = {/w/a/b}`.
    pub fn intersect_paths(&self, other: &Scope) -> Scope {
        match (self, other) {
            (Scope::All, x) | (x, Scope::All) => x.clone(),
            (Scope::None, _) | (_, Scope::None) => Scope::None,
            (Scope::Set(a), Scope::Set(b)) => {
                let mut common = BTreeSet::new();
                for pa in a {
                    for pb in b {
                        if path_contains(pb, pa) {
                            common.insert(pa.clone());
                        } else if path_contains(pa, pb) {
                            common.insert(pb.clone());
                        }
                    }
                }
                if common.is_empty() {
                    Scope::None
                } else {
                    Scope::Set(common)
                }
            }
        }
    }

    /// Exact token membership, for `commands`/`net`/`env` kinds.
    pub fn allows_token(&self, token: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::None => false,
            Scope::Set(tokens) => tokens.contains(token),
        }
    }

    /// The granted entries, when finite.
    pub fn entries(&self) -> Option<Vec<String>> {
        match self {
            Scope::Set(s) => Some(s.iter().cloned().collect()),
            Scope::None => Some(Vec::new()),
            Scope::All => None,
        }
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scope::All => serializer.serialize_str("all"),
            Scope::None => serializer.serialize_str("none"),
            Scope::Set(items) => items.serialize(serializer),
        }
    }
}

/// The two-axis `run` scope: executable paths and command tokens
/// intersect independently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunScope {
    pub paths: Scope,
    pub commands: Scope,
}

impl RunScope {
    pub fn all() -> Self {
        Self {
            paths: Scope::All,
            commands: Scope::All,
        }
    }

    pub fn none() -> Self {
        Self {
            paths: Scope::None,
            commands: Scope::None,
        }
    }

    pub fn intersect(&self, other: &RunScope) -> RunScope {
        RunScope {
            paths: self.paths.intersect_paths(&other.paths),
            commands: self.commands.intersect(&other.commands),
        }
    }
}

impl Serialize for RunScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.paths.is_all() && self.commands.is_all() {
            return serializer.serialize_str("all");
        }
        if self.paths == Scope::None && self.commands == Scope::None {
            return serializer.serialize_str("none");
        }
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("paths", &self.paths)?;
        map.serialize_entry("commands", &self.commands)?;
        map.end()
    }
}

// ---------------------------------------------------------------------------
// Declarations — the authored form
// ---------------------------------------------------------------------------

/// A scope as written in front matter: `true`, `false`, or a list.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ScopeDecl {
    Bool(bool),
    List(Vec<String>),
}

/// The `run` kind additionally accepts an object with independent
/// `paths`/`commands` lists.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum RunDecl {
    Bool(bool),
    /// Bare list shorthand: a command allow-list.
    List(Vec<String>),
    Object {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        paths: Option<ScopeDecl>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commands: Option<ScopeDecl>,
    },
}

/// A permission declaration as authored in a deck or supplied by a caller
/// layer. `base_dir` is supplied by the owner, not the document.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PermissionDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ScopeDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<ScopeDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<ScopeDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<ScopeDecl>,
}

impl PermissionDecl {
    pub fn is_empty(&self) -> bool {
        self.read.is_none()
            && self.write.is_none()
            && self.run.is_none()
            && self.net.is_none()
            && self.env.is_none()
    }
}

// ---------------------------------------------------------------------------
// Normalized sets
// ---------------------------------------------------------------------------

/// One layer's normalized permission set. Path scopes hold canonical
/// absolute paths resolved against this layer's `base_dir`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PermissionSet {
    pub base_dir: PathBuf,
    pub read: Scope,
    pub write: Scope,
    pub net: Scope,
    pub env: Scope,
    pub run: RunScope,
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        return dirs::home_dir().unwrap_or_default().join(rest);
    }
    PathBuf::from(raw)
}

fn normalize_path_scope(decl: &ScopeDecl, base_dir: &Path) -> Scope {
    match decl {
        ScopeDecl::Bool(true) => Scope::All,
        ScopeDecl::Bool(false) => Scope::None,
        ScopeDecl::List(items) => Scope::Set(
            items
                .iter()
                .map(|raw| {
                    let p = expand_home(raw);
                    let joined = if p.is_absolute() { p } else { base_dir.join(p) };
                    canonicalize_lenient(&joined).to_string_lossy().into_owned()
                })
                .collect(),
        ),
    }
}

fn normalize_token_scope(decl: &ScopeDecl) -> Scope {
    match decl {
        ScopeDecl::Bool(true) => Scope::All,
        ScopeDecl::Bool(false) => Scope::None,
        ScopeDecl::List(items) => Scope::set(items.iter().cloned()),
    }
}

impl PermissionSet {
    /// The identity layer: everything granted. This is the implicit host
    /// layer at the top of a root resolution.
    pub fn unrestricted(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            read: Scope::All,
            write: Scope::All,
            net: Scope::All,
            env: Scope::All,
            run: RunScope::all(),
        }
    }

    /// Normalize a declaration against its owner's directory.
    ///
    /// When any kind is specified, unspecified kinds default to `none`;
    /// a fully empty declaration is the identity layer.
    pub fn from_decl(
        decl: &PermissionDecl,
        base_dir: impl Into<PathBuf>,
    ) -> Result<Self, PermissionError> {
        let base_dir = base_dir.into();
        if decl.is_empty() {
            return Ok(Self::unrestricted(base_dir));
        }

        let path_kind = |d: &Option<ScopeDecl>| match d {
            Some(s) => normalize_path_scope(s, &base_dir),
            None => Scope::None,
        };
        let token_kind = |d: &Option<ScopeDecl>| match d {
            Some(s) => normalize_token_scope(s),
            None => Scope::None,
        };

        let run = match &decl.run {
            None => RunScope::none(),
            Some(RunDecl::Bool(true)) => RunScope::all(),
            Some(RunDecl::Bool(false)) => RunScope::none(),
            Some(RunDecl::List(commands)) => RunScope {
                paths: Scope::None,
                commands: Scope::set(commands.iter().cloned()),
            },
            Some(RunDecl::Object { paths, commands }) => {
                if matches!(paths, Some(ScopeDecl::Bool(_)))
                    || matches!(commands, Some(ScopeDecl::Bool(_)))
                {
                    return Err(PermissionError::InvalidDeclaration(
                        "object-form `run` requires path/command lists; use `run = true` to grant everything".to_string(),
                    ));
                }
                RunScope {
                    paths: match paths {
                        Some(s) => normalize_path_scope(s, &base_dir),
                        None => Scope::None,
                    },
                    commands: match commands {
                        Some(s) => normalize_token_scope(s),
                        None => Scope::None,
                    },
                }
            }
        };

        Ok(Self {
            read: path_kind(&decl.read),
            write: path_kind(&decl.write),
            net: token_kind(&decl.net),
            env: token_kind(&decl.env),
            run,
            base_dir,
        })
    }

    /// Pointwise intersection. The result keeps `inner`'s base dir —
    /// relative check inputs always resolve against the innermost layer.
    pub fn intersect(&self, inner: &PermissionSet) -> PermissionSet {
        PermissionSet {
            base_dir: inner.base_dir.clone(),
            read: self.read.intersect_paths(&inner.read),
            write: self.write.intersect_paths(&inner.write),
            net: self.net.intersect(&inner.net),
            env: self.env.intersect(&inner.env),
            run: self.run.intersect(&inner.run),
        }
    }

    /// Pointwise subset test, the monotonicity relation. Path kinds use
    /// subtree containment, token kinds exact membership.
    pub fn is_subset_of(&self, outer: &PermissionSet) -> bool {
        fn token_subset(inner: &Scope, outer: &Scope) -> bool {
            match (inner, outer) {
                (_, Scope::All) => true,
                (Scope::None, _) => true,
                (Scope::Set(a), Scope::Set(b)) => a.is_subset(b),
                (Scope::All, _) => false,
                (Scope::Set(a), Scope::None) => a.is_empty(),
            }
        }
        fn path_subset(inner: &Scope, outer: &Scope) -> bool {
            match (inner, outer) {
                (_, Scope::All) => true,
                (Scope::None, _) => true,
                (Scope::Set(a), Scope::Set(b)) => {
                    a.iter().all(|p| b.iter().any(|g| path_contains(g, p)))
                }
                (Scope::All, _) => false,
                (Scope::Set(a), Scope::None) => a.is_empty(),
            }
        }
        path_subset(&self.read, &outer.read)
            && path_subset(&self.write, &outer.write)
            && token_subset(&self.net, &outer.net)
            && token_subset(&self.env, &outer.env)
            && path_subset(&self.run.paths, &outer.run.paths)
            && token_subset(&self.run.commands, &outer.run.commands)
    }
}

// ---------------------------------------------------------------------------
// Sandbox projection
// ---------------------------------------------------------------------------

/// Allow-lists a worker sandbox is created with. `None` means the kind is
/// unrestricted (the scope resolved to `all`).
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    pub read_paths: Option<Vec<String>>,
    pub write_paths: Option<Vec<String>>,
    pub run_paths: Option<Vec<String>>,
    pub run_commands: Option<Vec<String>>,
    pub net_hosts: Option<Vec<String>>,
    pub env_names: Option<Vec<String>>,
}

impl SandboxSpec {
    pub fn from_effective(effective: &PermissionSet) -> Self {
        Self {
            read_paths: effective.read.entries(),
            write_paths: effective.write.entries(),
            run_paths: effective.run.paths.entries(),
            run_commands: effective.run.commands.entries(),
            net_hosts: effective.net.entries(),
            env_names: effective.env.entries(),
        }
    }
}
