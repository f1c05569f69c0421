// region.rs — Region tree of one subroutine body
//
// Regions live in a per-routine arena and refer to their parent through
// `RegionId`, never through pointers. A parallel region owns an ordered list
// of sub-regions; construction appends lines to the sub-region that is
// currently active.
//
// Preconditions: ids passed in were allocated by the same arena.
// Postconditions: cloned subtrees are re-parented inside the target arena.
// Failure modes: unknown ids (internal error I0009).
// Side effects: none.

use std::collections::BTreeMap;

use crate::diag::{codes, GenError, GenResult};
use crate::id::{IdAllocator, RegionId};
use crate::lexer;
use crate::symbol::Symbol;
use crate::template::ParallelTemplate;

// ── Region data ─────────────────────────────────────────────────────────────

/// One source line and the names of the symbols it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub symbols: Vec<String>,
}

/// Import recorded from a `use` statement: whole module when `name_in_scope` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub module: String,
    pub name_in_scope: Option<String>,
    pub source_name: Option<String>,
}

/// Written call: callee name and the argument expressions at the call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    pub callee: String,
    pub arguments: Vec<String>,
    /// Caller symbols passed in front of the written arguments.
    pub forwarded: Vec<String>,
}

impl CallSite {
    pub fn new(callee: &str, arguments: &[&str]) -> Self {
        CallSite {
            callee: callee.to_string(),
            arguments: arguments.iter().map(|a| a.to_string()).collect(),
            forwarded: Vec::new(),
        }
    }
}

/// Bookkeeping a specification region needs before it can render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecificationContext {
    /// Imports and declarations forwarded to each callee kernel.
    pub additional_parameters_by_kernel: Option<BTreeMap<String, (Vec<Symbol>, Vec<Symbol>)>>,
    /// Symbols declared by the generator for this routine.
    pub symbols_to_add: Option<Vec<Symbol>>,
    /// Declaration directives of the compaction array per callee.
    pub compaction_prefix_by_callee: Option<BTreeMap<String, String>>,
    /// Parameters this routine receives packed in its compaction array.
    pub compacted_parameters: Option<Vec<Symbol>>,
    pub all_imports: Option<Vec<ImportEntry>>,
    pub type_parameters: Vec<Symbol>,
    /// Lines passed through after the declarations (`data` statements).
    pub data_specification_lines: Vec<String>,
}

impl SpecificationContext {
    pub fn is_loaded(&self) -> bool {
        self.additional_parameters_by_kernel.is_some()
            && self.symbols_to_add.is_some()
            && self.compaction_prefix_by_callee.is_some()
            && self.compacted_parameters.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    Plain,
    Parallel {
        sub_regions: Vec<RegionId>,
        current: RegionId,
        template: Option<ParallelTemplate>,
    },
    Call {
        call: Option<CallSite>,
        /// Names of the caller's symbols visible at the call site.
        passed_in: Vec<String>,
    },
    Specification(Box<SpecificationContext>),
    EarlyExit,
}

impl RegionKind {
    pub fn label(&self) -> &'static str {
        match self {
            RegionKind::Plain => "Region",
            RegionKind::Parallel { .. } => "ParallelRegion",
            RegionKind::Call { .. } => "CallRegion",
            RegionKind::Specification(_) => "RoutineSpecificationRegion",
            RegionKind::EarlyExit => "RoutineEarlyExitRegion",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub parent: Option<RegionId>,
    pub lines: Vec<Line>,
    pub kind: RegionKind,
}

// ── Arena ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RegionArena {
    regions: Vec<Region>,
    ids: IdAllocator,
}

impl RegionArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn push(&mut self, kind: RegionKind, parent: Option<RegionId>) -> RegionId {
        let id = self.ids.alloc_region();
        debug_assert_eq!(id.index(), self.regions.len());
        self.regions.push(Region {
            parent,
            lines: Vec::new(),
            kind,
        });
        id
    }

    pub fn alloc(&mut self, kind: RegionKind) -> RegionId {
        self.push(kind, None)
    }

    /// A parallel region together with its first, active sub-region.
    pub fn alloc_parallel(&mut self) -> RegionId {
        let placeholder = RegionId(u32::MAX);
        let id = self.push(
            RegionKind::Parallel {
                sub_regions: Vec::new(),
                current: placeholder,
                template: None,
            },
            None,
        );
        let first = self.push(RegionKind::Plain, Some(id));
        if let RegionKind::Parallel {
            sub_regions, current, ..
        } = &mut self.regions[id.index()].kind
        {
            sub_regions.push(first);
            *current = first;
        }
        id
    }

    pub fn alloc_call(&mut self, call: Option<CallSite>, passed_in: Vec<String>) -> RegionId {
        self.alloc(RegionKind::Call { call, passed_in })
    }

    pub fn get(&self, id: RegionId) -> GenResult<&Region> {
        self.regions.get(id.index()).ok_or_else(|| dangling(id))
    }

    pub fn get_mut(&mut self, id: RegionId) -> GenResult<&mut Region> {
        self.regions.get_mut(id.index()).ok_or_else(|| dangling(id))
    }

    /// Append a line. Parallel regions forward to their active sub-region.
    /// Blank lines are dropped.
    pub fn load_line(&mut self, id: RegionId, text: &str, symbols: &[&str]) -> GenResult<()> {
        let stripped = text.trim();
        if stripped.is_empty() {
            return Ok(());
        }
        let target = match &self.get(id)?.kind {
            RegionKind::Parallel { current, .. } => *current,
            _ => id,
        };
        self.get_mut(target)?.lines.push(Line {
            text: stripped.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        });
        Ok(())
    }

    /// Make `region` the active sub-region of `parallel`.
    pub fn switch_to_region(&mut self, parallel: RegionId, region: RegionId) -> GenResult<()> {
        self.get_mut(region)?.parent = Some(parallel);
        match &mut self.get_mut(parallel)?.kind {
            RegionKind::Parallel {
                sub_regions, current, ..
            } => {
                sub_regions.push(region);
                *current = region;
                Ok(())
            }
            other => Err(GenError::internal(
                codes::DANGLING_REGION,
                format!("cannot switch sub-region of a {}", other.label()),
            )),
        }
    }

    pub fn load_template(&mut self, parallel: RegionId, new_template: ParallelTemplate) -> GenResult<()> {
        match &mut self.get_mut(parallel)?.kind {
            RegionKind::Parallel { template, .. } => {
                *template = Some(new_template);
                Ok(())
            }
            other => Err(GenError::internal(
                codes::MISSING_TEMPLATE,
                format!("cannot load a template into a {}", other.label()),
            )),
        }
    }

    pub fn load_call(&mut self, id: RegionId, site: CallSite) -> GenResult<()> {
        match &mut self.get_mut(id)?.kind {
            RegionKind::Call { call, .. } => {
                *call = Some(site);
                Ok(())
            }
            other => Err(GenError::internal(
                codes::MISSING_CALLEE,
                format!("cannot attach a callee to a {}", other.label()),
            )),
        }
    }

    pub fn specification_context_mut(&mut self, id: RegionId) -> GenResult<&mut SpecificationContext> {
        match &mut self.get_mut(id)?.kind {
            RegionKind::Specification(ctx) => Ok(ctx),
            other => Err(GenError::internal(
                codes::MISSING_CONTEXT,
                format!("{} has no specification context", other.label()),
            )),
        }
    }

    /// Template of the parallel region enclosing `id`, if any.
    pub fn enclosing_template(&self, id: RegionId) -> GenResult<Option<&ParallelTemplate>> {
        let parent = match self.get(id)?.parent {
            Some(p) => p,
            None => return Ok(None),
        };
        match &self.get(parent)?.kind {
            RegionKind::Parallel { template, .. } => Ok(template.as_ref()),
            _ => Ok(None),
        }
    }

    /// Symbol names referenced in `id` and everything below it, in order of appearance.
    pub fn used_symbol_names(&self, id: RegionId) -> GenResult<Vec<String>> {
        let region = self.get(id)?;
        let mut names: Vec<String> = region
            .lines
            .iter()
            .flat_map(|l| l.symbols.iter().cloned())
            .collect();
        match &region.kind {
            RegionKind::Parallel { sub_regions, .. } => {
                for sub in sub_regions {
                    names.extend(self.used_symbol_names(*sub)?);
                }
            }
            RegionKind::Call { call: Some(site), .. } => {
                for argument in &site.arguments {
                    if let Some(name) = lexer::leading_identifier(argument) {
                        names.push(name.to_string());
                    }
                }
                names.extend(site.forwarded.iter().cloned());
            }
            _ => {}
        }
        Ok(names)
    }

    /// Deep-copy the subtree at `id` into `target`, re-parenting every copied
    /// region. The copy's root gets `parent`.
    pub fn clone_subtree(&self, id: RegionId, target: &mut RegionArena, parent: Option<RegionId>) -> GenResult<RegionId> {
        let region = self.get(id)?;
        let kind = match &region.kind {
            RegionKind::Parallel { .. } => RegionKind::Parallel {
                sub_regions: Vec::new(),
                current: RegionId(u32::MAX),
                template: None,
            },
            other => other.clone(),
        };
        let copy = target.push(kind, parent);
        target.get_mut(copy)?.lines = region.lines.clone();

        if let RegionKind::Parallel {
            sub_regions,
            template,
            ..
        } = &region.kind
        {
            let mut copied = Vec::with_capacity(sub_regions.len());
            for sub in sub_regions {
                copied.push(self.clone_subtree(*sub, target, Some(copy))?);
            }
            if let RegionKind::Parallel {
                sub_regions: new_subs,
                current,
                template: new_template,
            } = &mut target.get_mut(copy)?.kind
            {
                *current = copied.first().copied().unwrap_or(RegionId(u32::MAX));
                *new_subs = copied;
                *new_template = template.clone();
            }
        }
        Ok(copy)
    }
}

fn dangling(id: RegionId) -> GenError {
    GenError::internal(
        codes::DANGLING_REGION,
        format!("region {} does not exist in this routine", id.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::LoopDomain;

    #[test]
    fn parallel_region_starts_with_one_sub_region() {
        let mut arena = RegionArena::new();
        let p = arena.alloc_parallel();
        arena.load_line(p, "  a = b  ", &["a", "b"]).unwrap();
        arena.load_line(p, "   ", &[]).unwrap();
        match &arena.get(p).unwrap().kind {
            RegionKind::Parallel { sub_regions, current, .. } => {
                assert_eq!(sub_regions.len(), 1);
                let sub = arena.get(*current).unwrap();
                assert_eq!(sub.lines.len(), 1);
                assert_eq!(sub.lines[0].text, "a = b");
                assert_eq!(sub.parent, Some(p));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn switching_sub_regions_keeps_order() {
        let mut arena = RegionArena::new();
        let p = arena.alloc_parallel();
        arena.load_line(p, "a = 1", &["a"]).unwrap();
        let call = arena.alloc_call(None, vec![]);
        arena.switch_to_region(p, call).unwrap();
        let next = arena.alloc(RegionKind::Plain);
        arena.switch_to_region(p, next).unwrap();
        arena.load_line(p, "c = 2", &["c"]).unwrap();
        assert_eq!(arena.used_symbol_names(p).unwrap(), vec!["a", "c"]);
        assert_eq!(arena.get(call).unwrap().parent, Some(p));
    }

    #[test]
    fn call_arguments_count_as_used() {
        let mut arena = RegionArena::new();
        let c = arena.alloc_call(None, vec![]);
        arena
            .load_call(c, CallSite::new("f", &["a(1, k)", "n"]))
            .unwrap();
        assert_eq!(arena.used_symbol_names(c).unwrap(), vec!["a", "n"]);
    }

    #[test]
    fn clone_subtree_reparents_into_target() {
        let mut arena = RegionArena::new();
        let _spec = arena.alloc(RegionKind::Plain);
        let p = arena.alloc_parallel();
        arena
            .load_template(p, ParallelTemplate::new("t", vec![LoopDomain::new("i", "n")]))
            .unwrap();
        arena.load_line(p, "a = 1", &["a"]).unwrap();

        let mut target = RegionArena::new();
        let copy = arena.clone_subtree(p, &mut target, None).unwrap();
        assert_eq!(target.len(), 2);
        match &target.get(copy).unwrap().kind {
            RegionKind::Parallel {
                sub_regions, template, ..
            } => {
                assert_eq!(sub_regions.len(), 1);
                assert_eq!(target.get(sub_regions[0]).unwrap().parent, Some(copy));
                assert!(template.is_some());
                assert!(target.enclosing_template(sub_regions[0]).unwrap().is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        // the source is untouched
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn unknown_region_is_internal_error() {
        let arena = RegionArena::new();
        let e = arena.get(RegionId(7)).unwrap_err();
        assert_eq!(e.code, codes::DANGLING_REGION);
    }

    #[test]
    fn template_only_on_parallel_regions() {
        let mut arena = RegionArena::new();
        let r = arena.alloc(RegionKind::Plain);
        let e = arena
            .load_template(r, ParallelTemplate::new("t", vec![]))
            .unwrap_err();
        assert_eq!(e.code, codes::MISSING_TEMPLATE);
    }
}
