//! Gambit Sandbox - the permission lattice.
//!
//! A monotone intersection algebra over five resource kinds
//! (read / write / run / net / env), resolved across ordered layers and
//! enforced through canonical-path containment checks that are robust to
//! symlink escape.

pub mod checks;
pub mod resolve;
pub mod scope;

pub use checks::canonicalize_lenient;
pub use resolve::{
    resolve_child, resolve_effective_permissions, resolve_root, LayerTrace, PermissionLayer,
    ResolvedPermissions,
};
pub use scope::{
    PermissionDecl, PermissionError, PermissionSet, RunDecl, RunScope, SandboxSpec, Scope,
    ScopeDecl,
};
