// template.rs — Parallel loop templates
//
// A template describes the loop nest of one parallel region: its dimensions
// (iterator name, size expression, optional bounds), reduction clauses and
// the targets it applies to.

use serde::{Deserialize, Serialize};

/// Preprocessor names of the per-dimension block sizes.
pub const VECTOR_SIZE_PP_NAMES: [&str; 3] = ["CUDA_BLOCKSIZE_X", "CUDA_BLOCKSIZE_Y", "CUDA_BLOCKSIZE_Z"];

/// One parallel dimension, e.g. `i` over `nx`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopDomain {
    pub name: String,
    pub size: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl LoopDomain {
    pub fn new(name: &str, size: &str) -> Self {
        LoopDomain {
            name: name.to_string(),
            size: size.to_string(),
            start: None,
            end: None,
        }
    }

    pub fn with_bounds(name: &str, start: &str, end: &str) -> Self {
        LoopDomain {
            name: name.to_string(),
            size: format!("{}:{}", start, end),
            start: Some(start.to_string()),
            end: Some(end.to_string()),
        }
    }

    pub fn starts_at(&self) -> &str {
        self.start.as_deref().unwrap_or("1")
    }

    pub fn ends_at(&self) -> &str {
        self.end.as_deref().unwrap_or(&self.size)
    }

    /// Number of iterations as an expression. `lo:hi` sizes become `hi - lo + 1`.
    pub fn extent(&self) -> String {
        let parts: Vec<&str> = self.size.split(':').collect();
        match parts.as_slice() {
            [lo, hi] => format!("{} - {} + 1", hi.trim(), lo.trim()),
            _ => self.size.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction {
    pub operator: String,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelTemplate {
    pub id: String,
    /// Target tags (`CPU`, `GPU`). Empty applies everywhere.
    #[serde(default)]
    pub applies_to: Vec<String>,
    pub domains: Vec<LoopDomain>,
    #[serde(default)]
    pub reductions: Vec<Reduction>,
}

impl ParallelTemplate {
    pub fn new(id: &str, domains: Vec<LoopDomain>) -> Self {
        ParallelTemplate {
            id: id.to_string(),
            applies_to: Vec::new(),
            domains,
            reductions: Vec::new(),
        }
    }

    /// True if the template is active for any of `targets`.
    pub fn applies_to_any(&self, targets: &[&str]) -> bool {
        if self.applies_to.is_empty() {
            return true;
        }
        self.applies_to
            .iter()
            .any(|tag| targets.iter().any(|t| t.eq_ignore_ascii_case(tag)))
    }

    pub fn domain_names(&self) -> Vec<&str> {
        self.domains.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.domains.iter().any(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// `reduction(+: a, b) reduction(max: c)`; empty without reductions.
    pub fn reduction_clause(&self) -> String {
        self.reductions
            .iter()
            .map(|r| format!("reduction({}: {})", r.operator, r.symbols.join(", ")))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Iterator declarations for the templates that apply to `targets`.
///
/// Each iterator is declared once even when several templates share it.
pub fn iterator_declaration(templates: &[ParallelTemplate], targets: &[&str]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for template in templates.iter().filter(|t| t.applies_to_any(targets)) {
        for domain in &template.domains {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&domain.name)) {
                names.push(&domain.name);
            }
        }
    }
    if names.is_empty() {
        return String::new();
    }
    format!("integer(4) :: {}\n", names.join(", "))
}
