//! Layered resolution — left-fold intersection with an audit trace.
//!
//! Roots fold `host, workspace, declaration, session`; children fold
//! `parent, declaration, reference`. The host layer is implicit: the fold
//! starts from the unrestricted set, so each subsequent layer can only
//! tighten.

use crate::scope::{PermissionDecl, PermissionError, PermissionSet, RunScope, Scope};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// One contributor to effective permissions. A layer without a
/// declaration contributes the identity.
#[derive(Clone, Debug)]
pub struct PermissionLayer {
    pub name: String,
    pub base_dir: PathBuf,
    pub decl: Option<PermissionDecl>,
}

impl PermissionLayer {
    pub fn new(
        name: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        decl: Option<PermissionDecl>,
    ) -> Self {
        Self {
            name: name.into(),
            base_dir: base_dir.into(),
            decl,
        }
    }
}

/// Audit record for one resolved layer.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerTrace {
    pub name: String,
    pub base_dir: PathBuf,
    pub read: Scope,
    pub write: Scope,
    pub net: Scope,
    pub env: Scope,
    pub run: RunScope,
}

impl LayerTrace {
    pub fn new(name: &str, set: &PermissionSet) -> Self {
        Self::from_set(name, set)
    }

    fn from_set(name: &str, set: &PermissionSet) -> Self {
        Self {
            name: name.to_string(),
            base_dir: set.base_dir.clone(),
            read: set.read.clone(),
            write: set.write.clone(),
            net: set.net.clone(),
            env: set.env.clone(),
            run: set.run.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResolvedPermissions {
    pub effective: PermissionSet,
    pub trace: Vec<LayerTrace>,
}

/// Fold the layers in order, tightening at each step. The effective set's
/// base dir is the last layer's, so relative check inputs resolve against
/// the innermost owner.
pub fn resolve_effective_permissions(
    layers: &[PermissionLayer],
) -> Result<ResolvedPermissions, PermissionError> {
    let mut effective = PermissionSet::unrestricted(
        layers
            .first()
            .map(|l| l.base_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/")),
    );
    let mut trace = Vec::with_capacity(layers.len());

    for layer in layers {
        let normalized = match &layer.decl {
            Some(decl) => PermissionSet::from_decl(decl, &layer.base_dir)?,
            None => PermissionSet::unrestricted(&layer.base_dir),
        };
        trace.push(LayerTrace::from_set(&layer.name, &normalized));
        effective = effective.intersect(&normalized);
        debug!(layer = %layer.name, base_dir = %layer.base_dir.display(), "permission layer folded");
    }

    Ok(ResolvedPermissions { effective, trace })
}

/// Resolve a root's effective set from the standard four layers. Absent
/// declarations contribute the identity.
pub fn resolve_root(
    workspace: PermissionLayer,
    declaration: PermissionLayer,
    session: Option<PermissionLayer>,
) -> Result<ResolvedPermissions, PermissionError> {
    let host = PermissionLayer::new("host", workspace.base_dir.clone(), None);
    let mut layers = vec![host, workspace, declaration];
    if let Some(session) = session {
        layers.push(session);
    }
    resolve_effective_permissions(&layers)
}

/// Resolve a child's effective set: the parent's effective set, the
/// child's own declaration, then the parent's declared narrowing for this
/// reference.
pub fn resolve_child(
    parent_effective: &PermissionSet,
    declaration: PermissionLayer,
    reference: Option<PermissionLayer>,
) -> Result<ResolvedPermissions, PermissionError> {
    let mut trace = vec![LayerTrace::from_set("parent", parent_effective)];
    let mut effective = parent_effective.clone();

    let decl_set = match &declaration.decl {
        Some(decl) => PermissionSet::from_decl(decl, &declaration.base_dir)?,
        None => PermissionSet::unrestricted(&declaration.base_dir),
    };
    trace.push(LayerTrace::from_set(&declaration.name, &decl_set));
    effective = effective.intersect(&decl_set);

    if let Some(reference) = reference {
        let ref_set = match &reference.decl {
            Some(decl) => PermissionSet::from_decl(decl, &reference.base_dir)?,
            None => PermissionSet::unrestricted(&reference.base_dir),
        };
        trace.push(LayerTrace::from_set(&reference.name, &ref_set));
        effective = effective.intersect(&ref_set);
    }

    Ok(ResolvedPermissions { effective, trace })
}
