// symbol.rs — Symbol state model
//
// A symbol is one variable as seen from one routine: its shape, intent,
// declaration category and the residency flags the strategies mutate while a
// routine is rendered. Strategies never create or destroy symbols; they only
// flip flags and ask for textual representations.
//
// Preconditions: `domains` lists every dimension of an array in declared order.
// Postconditions: representations honour `is_using_device_postfix`.
// Failure modes: allocation of arrays with unknown sizes, unparsable
//   declaration lines (usage errors).
// Side effects: none.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, GenError, GenResult};
use crate::parser;
use crate::spec_line;

/// Suffix of device copies of host arrays.
pub const DEVICE_POSTFIX: &str = "_d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    In,
    Out,
    InOut,
    Local,
    #[default]
    #[serde(rename = "none")]
    Unspecified,
}

impl Intent {
    pub fn parse(text: &str) -> Intent {
        match text.trim().to_ascii_lowercase().replace(' ', "").as_str() {
            "in" => Intent::In,
            "out" => Intent::Out,
            "inout" => Intent::InOut,
            "local" => Intent::Local,
            _ => Intent::Unspecified,
        }
    }

    /// No intent or explicitly local: the symbol is not an argument value.
    pub fn is_local_like(self) -> bool {
        matches!(self, Intent::Local | Intent::Unspecified)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Intent::Out | Intent::InOut)
    }

    pub fn is_input(self) -> bool {
        matches!(self, Intent::In | Intent::InOut)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::In => write!(f, "in"),
            Intent::Out => write!(f, "out"),
            Intent::InOut => write!(f, "inout"),
            Intent::Local => write!(f, "local"),
            Intent::Unspecified => Ok(()),
        }
    }
}

/// Declaration category. Variant order is the sort order of generated lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationType {
    LocalArray,
    LocalScalar,
    ModuleArray,
    ModuleArrayPassedInAsArgument,
    LocalModuleScalar,
    ForeignModuleScalar,
    FrameworkArray,
    OtherArray,
    #[default]
    OtherScalar,
}

impl DeclarationType {
    /// Stable number used in generated comments.
    pub fn code(self) -> u8 {
        self as u8 + 1
    }

    pub fn is_module_symbol(self) -> bool {
        matches!(
            self,
            DeclarationType::LocalModuleScalar
                | DeclarationType::ModuleArray
                | DeclarationType::ModuleArrayPassedInAsArgument
        )
    }
}

/// One dimension of an array: domain name and size expression.
/// A size of `:` means the extent is unknown at this point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub size: String,
}

impl Domain {
    pub fn new(name: &str, size: &str) -> Self {
        Domain {
            name: name.to_string(),
            size: size.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Symbol {
    pub name: String,
    /// Type used when no declaration line has been loaded.
    pub type_spec: String,
    pub domains: Vec<Domain>,
    pub intent: Intent,
    pub declaration_type: DeclarationType,

    // ── Residency ──
    pub is_on_device: bool,
    pub is_present: bool,
    pub is_to_be_transfered: bool,
    pub is_host_symbol: bool,
    pub is_using_device_postfix: bool,
    pub is_compacted: bool,

    pub is_type_parameter: bool,
    pub is_argument: bool,
    /// Declared with `:` extents (allocatable or assumed shape).
    pub deferred_shape: bool,
    pub is_allocatable: bool,
    pub is_pointer: bool,
    pub source_module: Option<String>,
    /// Name inside `source_module` when imported under another name.
    pub source_name: Option<String>,
    /// Directive part of the loaded declaration, e.g. `real(8), intent(in)`.
    pub declaration_prefix: Option<String>,
}

impl Symbol {
    pub fn new(name: &str, type_spec: &str) -> Self {
        Symbol {
            name: name.to_string(),
            type_spec: type_spec.to_string(),
            ..Symbol::default()
        }
    }

    pub fn array(name: &str, type_spec: &str, domains: &[(&str, &str)]) -> Self {
        Symbol {
            domains: domains.iter().map(|(n, s)| Domain::new(n, s)).collect(),
            declaration_type: DeclarationType::LocalArray,
            ..Symbol::new(name, type_spec)
        }
    }

    pub fn is_array(&self) -> bool {
        !self.domains.is_empty()
    }

    /// Name as it appears in generated code.
    pub fn name_in_scope(&self, use_device_version: bool) -> String {
        if use_device_version && self.is_using_device_postfix {
            format!("{}{}", self.name, DEVICE_POSTFIX)
        } else {
            self.name.clone()
        }
    }

    pub fn host_name(&self) -> String {
        self.name_in_scope(false)
    }

    /// Name inside the source module, with the device postfix when requested.
    pub fn source_name_in_scope(&self, use_device_version: bool) -> String {
        let base = self.source_name.as_deref().unwrap_or(&self.name);
        if use_device_version && self.is_using_device_postfix {
            format!("{}{}", base, DEVICE_POSTFIX)
        } else {
            base.to_string()
        }
    }

    /// Device copies made by the generator are allocatable, so their extents
    /// are only decided at allocation time.
    pub fn has_undecided_domain_sizes(&self) -> bool {
        self.deferred_shape || (self.is_array() && self.is_using_device_postfix && !self.is_present)
    }

    pub fn dimension_sizes(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.size.as_str()).collect()
    }

    pub fn has_unknown_size(&self) -> bool {
        self.domains.iter().any(|d| d.size.trim() == ":")
    }

    pub fn declaration_directives(&self) -> &str {
        self.declaration_prefix.as_deref().unwrap_or(&self.type_spec)
    }

    fn shape(&self, deferred: bool) -> String {
        if !self.is_array() {
            return String::new();
        }
        let dims: Vec<&str> = self
            .domains
            .iter()
            .map(|d| if deferred { ":" } else { d.size.as_str() })
            .collect();
        format!("({})", dims.join(","))
    }

    /// `a_d(:,:)` for device copies, `a(nx,ny)` for fixed shapes.
    pub fn domain_representation(&self) -> String {
        format!(
            "{}{}",
            self.name_in_scope(true),
            self.shape(self.has_undecided_domain_sizes())
        )
    }

    /// Host entity as declared by the programmer.
    pub fn host_domain_representation(&self) -> String {
        format!("{}{}", self.host_name(), self.shape(self.deferred_shape))
    }

    /// Whole-array section, e.g. `a_d(:,:)`.
    pub fn select_all_representation(&self) -> String {
        if !self.is_array() {
            return self.name_in_scope(true);
        }
        let colons = vec![":"; self.domains.len()];
        format!("{}({})", self.name_in_scope(true), colons.join(","))
    }

    /// Argument of an `allocate` statement.
    pub fn allocation_representation(&self) -> GenResult<String> {
        if self.has_unknown_size() {
            return Err(GenError::internal(
                codes::INVALID_ACCESS,
                format!(
                    "cannot allocate {}: extents {:?} are not known here",
                    self.name,
                    self.dimension_sizes()
                ),
            ));
        }
        Ok(format!(
            "{}({})",
            self.name_in_scope(true),
            self.dimension_sizes().join(",")
        ))
    }

    /// Declaration statement for this symbol alone, with `purge` attributes removed.
    pub fn declaration_line(&self, purge: &[&str]) -> GenResult<String> {
        let directives = spec_line::purge_directives(self.declaration_directives(), purge)?;
        Ok(format!("{} :: {}", directives, self.host_domain_representation()))
    }

    /// Load directives, intent and allocation attributes from a declaration
    /// line that declares this symbol.
    pub fn load_declaration(&mut self, line: &str) -> GenResult<()> {
        let decl = parser::parse_declaration(line)?;
        let entity = decl
            .entities
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(&self.name))
            .ok_or_else(|| {
                GenError::internal(
                    codes::UNMATCHED_SPECIFICATION,
                    format!("symbol {} is not declared in '{}'", self.name, line.trim()),
                )
            })?;
        let mut directives = vec![decl.type_spec.clone()];
        directives.extend(decl.attributes.iter().map(|a| a.text.clone()));
        self.declaration_prefix = Some(directives.join(", "));
        self.type_spec = decl.type_spec.clone();

        if let Some(intent) = decl.attribute("intent") {
            self.intent = Intent::parse(intent.args.as_deref().unwrap_or(""));
            self.is_argument = true;
        }
        self.is_allocatable |= decl.attribute("allocatable").is_some();
        self.is_pointer |= decl.attribute("pointer").is_some();

        let shape = entity
            .dims
            .as_deref()
            .or_else(|| decl.attribute("dimension").and_then(|a| a.args.as_deref()));
        if let Some(shape) = shape {
            let extents: Vec<&str> = shape.split(',').map(str::trim).collect();
            if extents.iter().all(|e| *e == ":") {
                self.deferred_shape = true;
            }
        }
        Ok(())
    }

    /// Absorb information known by another view of the same symbol.
    pub fn merge(&mut self, other: &Symbol) {
        if self.domains.is_empty() {
            self.domains = other.domains.clone();
        }
        if self.source_module.is_none() {
            self.source_module = other.source_module.clone();
        }
        if self.source_name.is_none() {
            self.source_name = other.source_name.clone();
        }
        if self.declaration_prefix.is_none() {
            self.declaration_prefix = other.declaration_prefix.clone();
        }
        if self.intent == Intent::Unspecified {
            self.intent = other.intent;
        }
        self.is_present |= other.is_present;
        self.is_to_be_transfered |= other.is_to_be_transfered;
        self.is_host_symbol |= other.is_host_symbol;
        self.deferred_shape |= other.deferred_shape;
    }

    /// Order of generated lists: declaration category, then name.
    pub fn cmp_declaration_order(&self, other: &Symbol) -> Ordering {
        self.declaration_type
            .cmp(&other.declaration_type)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Sort symbols into generated-list order.
pub fn sort_symbols(symbols: &mut [Symbol]) {
    symbols.sort_by(|a, b| a.cmp_declaration_order(b));
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_array() -> Symbol {
        let mut a = Symbol::array("a", "real(8)", &[("x", "nx"), ("y", "ny")]);
        a.is_using_device_postfix = true;
        a.is_on_device = true;
        a
    }

    #[test]
    fn device_postfix_only_when_requested() {
        let a = device_array();
        assert_eq!(a.name_in_scope(true), "a_d");
        assert_eq!(a.name_in_scope(false), "a");
    }

    #[test]
    fn device_copy_is_deferred_shape() {
        let a = device_array();
        assert!(a.has_undecided_domain_sizes());
        assert_eq!(a.domain_representation(), "a_d(:,:)");
        assert_eq!(a.host_domain_representation(), "a(nx,ny)");
        assert_eq!(a.select_all_representation(), "a_d(:,:)");
        assert_eq!(a.allocation_representation().unwrap(), "a_d(nx,ny)");
    }

    #[test]
    fn present_array_keeps_fixed_shape() {
        let mut a = Symbol::array("a", "real(8)", &[("x", "nx")]);
        a.is_present = true;
        a.is_on_device = true;
        assert!(!a.has_undecided_domain_sizes());
        assert_eq!(a.domain_representation(), "a(nx)");
    }

    #[test]
    fn allocation_with_unknown_extent_fails() {
        let mut a = device_array();
        a.domains[1].size = ":".to_string();
        assert!(a.allocation_representation().is_err());
    }

    #[test]
    fn load_declaration_reads_intent_and_shape() {
        let mut a = Symbol::array("a", "real", &[("x", "nx")]);
        a.load_declaration("real(8), intent(inout), allocatable :: a(:), b").unwrap();
        assert_eq!(a.intent, Intent::InOut);
        assert!(a.is_argument);
        assert!(a.is_allocatable);
        assert!(a.deferred_shape);
        assert_eq!(a.declaration_directives(), "real(8), intent(inout), allocatable");
        assert_eq!(
            a.declaration_line(&["intent"]).unwrap(),
            "real(8), allocatable :: a(:)"
        );
    }

    #[test]
    fn load_declaration_of_missing_entity_is_internal_error() {
        let mut c = Symbol::new("c", "real(8)");
        let e = c.load_declaration("real(8) :: a, b").unwrap_err();
        assert_eq!(e.code, codes::UNMATCHED_SPECIFICATION);
    }

    #[test]
    fn declaration_order_sorts_by_category_then_name() {
        let mut list = vec![
            Symbol::new("z", "real(8)"),
            Symbol::array("b", "real(8)", &[("x", "nx")]),
            Symbol::array("a", "real(8)", &[("x", "nx")]),
        ];
        sort_symbols(&mut list);
        let names: Vec<&str> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "z"]);
    }

    #[test]
    fn intent_parsing() {
        assert_eq!(Intent::parse("IN OUT"), Intent::InOut);
        assert_eq!(Intent::parse("out"), Intent::Out);
        assert!(Intent::parse("").is_local_like());
    }
}
