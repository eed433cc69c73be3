//! Tool-name validation.

use gambit_core::types::{BUILTIN_TOOL_NAMES, RESERVED_TOOL_PREFIX};
use gambit_core::{Error, Result};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

const MAX_TOOL_NAME_LEN: usize = 64;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"))
}

/// Validate a single action name: shape, length, and the reserved
/// `gambit_` prefix.
pub fn validate_tool_name(name: &str) -> Result<()> {
    if name.len() > MAX_TOOL_NAME_LEN {
        return Err(Error::ToolNameInvalid {
            name: name.to_string(),
            reason: format!("longer than {MAX_TOOL_NAME_LEN} characters"),
        });
    }
    if !name_pattern().is_match(name) {
        return Err(Error::ToolNameInvalid {
            name: name.to_string(),
            reason: "must match ^[A-Za-z_][A-Za-z0-9_]*$".to_string(),
        });
    }
    if name.starts_with(RESERVED_TOOL_PREFIX) && !BUILTIN_TOOL_NAMES.contains(&name) {
        return Err(Error::ToolNameReserved {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Validate a deck's full action name set: each well-formed, all unique.
pub fn validate_action_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        validate_tool_name(name)?;
        if !seen.insert(name) {
            return Err(Error::ToolNameCollision {
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        validate_tool_name("child").unwrap();
        validate_tool_name("_private").unwrap();
        validate_tool_name("fetch_page2").unwrap();
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(validate_tool_name("9lives").is_err());
        assert!(validate_tool_name("has space").is_err());
        assert!(validate_tool_name("dash-ed").is_err());
        assert!(validate_tool_name("").is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(65);
        assert!(validate_tool_name(&name).is_err());
        let name = "a".repeat(64);
        validate_tool_name(&name).unwrap();
    }

    #[test]
    fn reserved_prefix_denied_except_builtins() {
        assert!(matches!(
            validate_tool_name("gambit_custom"),
            Err(Error::ToolNameReserved { .. })
        ));
        validate_tool_name("gambit_respond").unwrap();
        validate_tool_name("gambit_end").unwrap();
    }

    #[test]
    fn duplicate_names_collide() {
        let err = validate_action_names(["a", "b", "a"]).unwrap_err();
        assert!(matches!(err, Error::ToolNameCollision { .. }));
    }
}
