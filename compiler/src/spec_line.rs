// spec_line.rs — Splitting and purging of declaration statements
//
// A declaration `real(8), intent(in), dimension(nx) :: a, b` is split into
// its directive part (type spec plus attributes) and its entity list. The
// directive part can be re-emitted with selected attributes removed, which is
// how device copies of a declaration are produced.
//
// Preconditions: input parses as a type declaration (see `parser`).
// Postconditions: attribute keywords are matched case-insensitively.
// Failure modes: unparsable declaration → usage error naming the line.
// Side effects: none.

use crate::diag::{codes, GenError, GenResult};
use crate::parser::{self, Declaration};

/// A declaration split into re-emittable pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSpecification {
    /// Directives with the purged attributes removed.
    pub purged_directives: String,
    /// Directives exactly as declared (type spec and every attribute).
    pub all_directives: String,
    /// Entity list after `::`.
    pub entity_text: String,
}

/// Split `line` and drop every attribute whose keyword appears in `purge`.
pub fn split_and_purge_specification(line: &str, purge: &[&str]) -> GenResult<SplitSpecification> {
    let decl = parser::parse_declaration(line)?;
    Ok(SplitSpecification {
        purged_directives: join_directives(&decl, purge),
        all_directives: join_directives(&decl, &[]),
        entity_text: decl.entity_text.clone(),
    })
}

/// Purge attributes from a bare directive string (`real(8), intent(in)`).
pub fn purge_directives(directives: &str, purge: &[&str]) -> GenResult<String> {
    let probe = format!("{} :: hf_probe", directives.trim());
    let decl = parser::parse_declaration(&probe).map_err(|_| {
        GenError::usage(
            codes::MALFORMED_SPECIFICATION,
            format!("invalid declaration directives '{}'", directives.trim()),
        )
    })?;
    Ok(join_directives(&decl, purge))
}

/// True if `directives` carries an attribute with keyword `name`.
pub fn has_attribute(directives: &str, name: &str) -> bool {
    let probe = format!("{} :: hf_probe", directives.trim());
    match parser::parse_declaration(&probe) {
        Ok(decl) => decl.attribute(&name.to_ascii_lowercase()).is_some(),
        Err(_) => false,
    }
}

fn join_directives(decl: &Declaration, purge: &[&str]) -> String {
    let mut parts = vec![decl.type_spec.clone()];
    for attr in &decl.attributes {
        if purge.iter().any(|p| p.eq_ignore_ascii_case(&attr.name)) {
            continue;
        }
        parts.push(attr.text.clone());
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_intent_and_dimension() {
        let s = split_and_purge_specification(
            "real(8), intent(in), dimension(nx), target :: a",
            &["intent", "dimension"],
        )
        .unwrap();
        assert_eq!(s.purged_directives, "real(8), target");
        assert_eq!(s.all_directives, "real(8), intent(in), dimension(nx), target");
        assert_eq!(s.entity_text, "a");
    }

    #[test]
    fn purge_is_case_insensitive() {
        let s = split_and_purge_specification("REAL(8), INTENT(INOUT), SAVE :: x, y", &["intent", "save"]).unwrap();
        assert_eq!(s.purged_directives, "REAL(8)");
        assert_eq!(s.entity_text, "x, y");
    }

    #[test]
    fn purge_bare_directives() {
        assert_eq!(
            purge_directives("integer(4), parameter, public", &["parameter"]).unwrap(),
            "integer(4), public"
        );
        assert!(has_attribute("real(8), Allocatable", "allocatable"));
        assert!(!has_attribute("real(8)", "pointer"));
    }

    #[test]
    fn non_declaration_is_usage_error() {
        let e = split_and_purge_specification("call foo(a)", &[]).unwrap_err();
        assert!(e.is_usage());
    }
}
