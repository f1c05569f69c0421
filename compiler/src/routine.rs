// routine.rs — Subroutine descriptors
//
// A `Routine` owns its region arena, its symbol table and the bookkeeping the
// strategies fill in (additional arguments, imports, adjusted callee names).
// Callers never hold references into other routines: calls are resolved by
// name through a `CalleeIndex` of read-only `Callee` snapshots.
//
// Preconditions: region ids stored in `regions` belong to `arena`.
// Postconditions: `clone_with_name` and `create_clone_with_metadata` return
//   independent routines; nothing is shared except the strategy handle.
// Failure modes: invalid `parallelRegionPosition` attribute (usage error).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, GenError, GenResult};
use crate::id::RegionId;
use crate::parser::{self, SpecStatement};
use crate::region::{CallSite, RegionArena, RegionKind, SpecificationContext};
use crate::strategy::commons;
use crate::strategy::Implementation;
use crate::symbol::Symbol;
use crate::template::ParallelTemplate;

// ── Attributed node ─────────────────────────────────────────────────────────

/// Where a routine sits relative to the parallel construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RegionPosition {
    /// Not involved in any parallel construct.
    #[default]
    None,
    /// Calls a routine that contains a parallel region.
    Inside,
    /// Called from inside a parallel region.
    Outside,
    /// Contains the parallel loop itself.
    Within,
}

impl RegionPosition {
    pub fn parse(text: Option<&str>) -> GenResult<RegionPosition> {
        match text.map(str::trim) {
            None | Some("") => Ok(RegionPosition::None),
            Some("inside") => Ok(RegionPosition::Inside),
            Some("outside") => Ok(RegionPosition::Outside),
            Some("within") => Ok(RegionPosition::Within),
            Some(other) => Err(GenError::usage(
                codes::INVALID_ATTRIBUTE,
                format!("invalid parallel region position '{}'", other),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionPosition::None => "",
            RegionPosition::Inside => "inside",
            RegionPosition::Outside => "outside",
            RegionPosition::Within => "within",
        }
    }

    /// Code of the routine runs on the device side of a kernel launch.
    pub fn is_device_side(self) -> bool {
        matches!(self, RegionPosition::Outside | RegionPosition::Within)
    }
}

impl fmt::Display for RegionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named string attributes of one routine, as produced by the front end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineNode {
    pub attributes: BTreeMap<String, String>,
}

impl RoutineNode {
    pub fn new(name: &str, module: &str) -> Self {
        let mut node = RoutineNode::default();
        node.set_attribute("name", name);
        node.set_attribute("module", module);
        node
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }

    pub fn name(&self) -> &str {
        self.get_attribute("name").unwrap_or("")
    }

    pub fn module(&self) -> &str {
        self.get_attribute("module").unwrap_or("")
    }

    /// Position attribute; unparsable values read as `None` here and are
    /// rejected by `checked_position`.
    pub fn position(&self) -> RegionPosition {
        self.checked_position().unwrap_or_default()
    }

    pub fn checked_position(&self) -> GenResult<RegionPosition> {
        RegionPosition::parse(self.get_attribute("parallelRegionPosition"))
    }

    pub fn set_position(&mut self, position: RegionPosition) {
        self.set_attribute("parallelRegionPosition", position.as_str());
    }

    pub fn is_kernel_caller(&self) -> bool {
        self.get_attribute("isKernelCaller") == Some("yes")
    }
}

// ── Routine ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Routine {
    pub name: String,
    /// Name callers write in their call statements.
    pub written_name: String,
    pub node: RoutineNode,
    pub module: String,
    pub programmer_arguments: Vec<String>,
    pub symbols: BTreeMap<String, Symbol>,
    pub arena: RegionArena,
    /// Top-level regions in source order.
    pub regions: Vec<RegionId>,
    pub parallel_templates: Vec<ParallelTemplate>,
    pub additional_imports: Vec<Symbol>,
    /// Parameters passed in front of the programmer's arguments.
    pub additional_argument_symbols: Vec<Symbol>,
    pub adjusted_callee_names: BTreeMap<String, String>,
    /// Scalars packed into the framework array of each callee.
    pub packed_symbols_by_callee: BTreeMap<String, Vec<Symbol>>,
    /// Names used inside the kernels this routine launches.
    pub names_used_in_called_kernels: BTreeSet<String>,
    pub implementation: Rc<dyn Implementation>,
}

impl Routine {
    pub fn new(name: &str, module: &str, implementation: Rc<dyn Implementation>) -> Self {
        Routine {
            name: name.to_string(),
            written_name: name.to_string(),
            node: RoutineNode::new(name, module),
            module: module.to_string(),
            programmer_arguments: Vec::new(),
            symbols: BTreeMap::new(),
            arena: RegionArena::new(),
            regions: Vec::new(),
            parallel_templates: Vec::new(),
            additional_imports: Vec::new(),
            additional_argument_symbols: Vec::new(),
            adjusted_callee_names: BTreeMap::new(),
            packed_symbols_by_callee: BTreeMap::new(),
            names_used_in_called_kernels: BTreeSet::new(),
            implementation,
        }
    }

    pub fn add_symbol(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.name.clone(), symbol);
    }

    // ── Regions ──

    pub fn add_region(&mut self, kind: RegionKind) -> RegionId {
        let id = self.arena.alloc(kind);
        self.regions.push(id);
        id
    }

    pub fn add_parallel_region(&mut self) -> RegionId {
        let id = self.arena.alloc_parallel();
        self.regions.push(id);
        id
    }

    /// The declaration block, if the routine has one. It is always the first region.
    pub fn specification_region(&self) -> Option<RegionId> {
        let first = *self.regions.first()?;
        match self.arena.get(first).ok()?.kind {
            RegionKind::Specification(_) => Some(first),
            _ => None,
        }
    }

    pub fn specification_context(&self) -> Option<&SpecificationContext> {
        let id = self.specification_region()?;
        match &self.arena.get(id).ok()?.kind {
            RegionKind::Specification(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn specification_context_mut(&mut self) -> GenResult<&mut SpecificationContext> {
        let id = self.specification_region().ok_or_else(|| {
            GenError::internal(
                codes::MISSING_CONTEXT,
                format!("routine {} has no specification region", self.name),
            )
        })?;
        self.arena.specification_context_mut(id)
    }

    pub fn parallel_region_ids(&self) -> Vec<RegionId> {
        self.regions
            .iter()
            .copied()
            .filter(|id| {
                matches!(
                    self.arena.get(*id).map(|r| &r.kind),
                    Ok(RegionKind::Parallel { .. })
                )
            })
            .collect()
    }

    pub fn call_region_ids(&self) -> Vec<RegionId> {
        let mut ids = Vec::new();
        for id in &self.regions {
            match self.arena.get(*id).map(|r| &r.kind) {
                Ok(RegionKind::Call { .. }) => ids.push(*id),
                Ok(RegionKind::Parallel { sub_regions, .. }) => {
                    for sub in sub_regions {
                        if let Ok(RegionKind::Call { .. }) = self.arena.get(*sub).map(|r| &r.kind) {
                            ids.push(*sub);
                        }
                    }
                }
                _ => {}
            }
        }
        ids
    }

    /// Names of called routines in call order, without duplicates.
    pub fn callee_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for id in self.call_region_ids() {
            if let Ok(RegionKind::Call { call: Some(site), .. }) = self.arena.get(id).map(|r| &r.kind) {
                if !names.contains(&site.callee) {
                    names.push(site.callee.clone());
                }
            }
        }
        names
    }

    // ── Usage ──

    /// Every symbol name referenced by the body. Declarations do not count.
    pub fn used_symbol_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for id in &self.regions {
            let region = match self.arena.get(*id) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if let RegionKind::Specification(ctx) = &region.kind {
                let compacted = ctx.compacted_parameters.as_deref().unwrap_or(&[]);
                if !compacted.is_empty() {
                    names.insert(commons::framework_array_name(&self.name));
                }
                continue;
            }
            if let Ok(used) = self.arena.used_symbol_names(*id) {
                names.extend(used);
            }
        }
        names
    }

    pub fn used_symbol_names_in_kernels(&self) -> BTreeSet<String> {
        let mut names = self.names_used_in_called_kernels.clone();
        for id in self.parallel_region_ids() {
            if let Ok(used) = self.arena.used_symbol_names(id) {
                names.extend(used);
            }
        }
        names
    }

    pub fn is_calling_kernel(&self) -> bool {
        self.node.is_kernel_caller()
    }

    pub fn position(&self) -> RegionPosition {
        self.node.position()
    }

    /// A symbol visible in this routine, including generated imports.
    pub fn symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols
            .get(name)
            .or_else(|| self.additional_imports.iter().find(|s| s.name == name))
    }

    /// Load declaration attributes of every annotated symbol from the
    /// specification lines.
    pub fn load_declarations(&mut self) -> GenResult<()> {
        let id = match self.specification_region() {
            Some(id) => id,
            None => return Ok(()),
        };
        let lines = self.arena.get(id)?.lines.clone();
        for line in lines.iter().filter(|l| !l.symbols.is_empty()) {
            let decl = match parser::parse_statement(&line.text)? {
                SpecStatement::Declaration(decl) => decl,
                SpecStatement::Use(_) => continue,
            };
            for name in &line.symbols {
                if !decl.declares(name) {
                    continue;
                }
                if let Some(symbol) = self.symbols.get_mut(name) {
                    symbol.load_declaration(&line.text)?;
                }
            }
        }
        Ok(())
    }

    // ── Cloning ──

    pub fn rename(&mut self, name: &str) {
        self.name = name.to_string();
        self.node.set_attribute("name", name);
    }

    /// Deep copy including the region arena, under a new name.
    pub fn clone_with_name(&self, name: &str) -> Routine {
        let mut clone = self.clone();
        clone.written_name = name.to_string();
        clone.rename(name);
        clone
    }

    /// Copy of everything except the regions.
    pub fn create_clone_with_metadata(&self, name: &str) -> Routine {
        let mut clone = self.clone_with_name(name);
        clone.arena = RegionArena::new();
        clone.regions.clear();
        clone
    }

    /// Append a deep copy of `region` from `source` as a new top-level region.
    pub fn import_region(&mut self, source: &Routine, region: RegionId) -> GenResult<RegionId> {
        let copy = source.arena.clone_subtree(region, &mut self.arena, None)?;
        self.regions.push(copy);
        Ok(copy)
    }

    /// Replace all regions by a copy of `region` from `source`.
    pub fn reset_regions(&mut self, source: &Routine, region: RegionId) -> GenResult<RegionId> {
        self.arena = RegionArena::new();
        self.regions.clear();
        self.import_region(source, region)
    }

    /// New call region invoking `callee` with its own dummy arguments. The
    /// region is allocated but not placed; the caller decides where it goes.
    pub fn load_call(&mut self, callee: &Routine) -> RegionId {
        let passed_in = self.symbols.keys().cloned().collect();
        let arguments: Vec<&str> = callee.programmer_arguments.iter().map(String::as_str).collect();
        self.arena
            .alloc_call(Some(CallSite::new(&callee.name, &arguments)), passed_in)
    }

    /// `symbols` minus the ones this routine already declares or imports.
    pub fn filter_out_symbols_already_alive(&self, symbols: &[Symbol]) -> Vec<Symbol> {
        symbols
            .iter()
            .filter(|s| self.symbol(&s.host_name()).is_none())
            .cloned()
            .collect()
    }
}

// ── Callee lookup ───────────────────────────────────────────────────────────

/// Read-only view of a routine as seen from its call sites.
#[derive(Debug, Clone)]
pub struct Callee {
    pub name: String,
    pub node: RoutineNode,
    pub module: String,
    pub programmer_arguments: Vec<String>,
    pub parallel_templates: Vec<ParallelTemplate>,
    pub used_symbol_names: BTreeSet<String>,
    pub used_symbol_names_in_kernels: BTreeSet<String>,
    pub additional_argument_symbols: Vec<Symbol>,
    pub symbols: BTreeMap<String, Symbol>,
    /// `None` for routines outside the annotated sources.
    pub implementation: Option<Rc<dyn Implementation>>,
}

impl Callee {
    pub fn from_routine(routine: &Routine) -> Self {
        Callee {
            name: routine.name.clone(),
            node: routine.node.clone(),
            module: routine.module.clone(),
            programmer_arguments: routine.programmer_arguments.clone(),
            parallel_templates: routine.parallel_templates.clone(),
            used_symbol_names: routine.used_symbol_names(),
            used_symbol_names_in_kernels: routine.used_symbol_names_in_kernels(),
            additional_argument_symbols: routine.additional_argument_symbols.clone(),
            symbols: routine.symbols.clone(),
            implementation: Some(Rc::clone(&routine.implementation)),
        }
    }

    pub fn external(name: &str) -> Self {
        Callee {
            name: name.to_string(),
            node: RoutineNode::new(name, ""),
            module: String::new(),
            programmer_arguments: Vec::new(),
            parallel_templates: Vec::new(),
            used_symbol_names: BTreeSet::new(),
            used_symbol_names_in_kernels: BTreeSet::new(),
            additional_argument_symbols: Vec::new(),
            symbols: BTreeMap::new(),
            implementation: None,
        }
    }

    pub fn is_analyzable(&self) -> bool {
        self.implementation.is_some()
    }

    pub fn position(&self) -> RegionPosition {
        self.node.position()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CalleeIndex {
    by_name: BTreeMap<String, Callee>,
}

impl CalleeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, callee: Callee) {
        self.by_name.insert(key.to_string(), callee);
    }

    pub fn get(&self, name: &str) -> Option<&Callee> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

// ── Modules ─────────────────────────────────────────────────────────────────

/// Module-scope annotated symbols and the raw module specification lines.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub name: String,
    pub symbols: BTreeMap<String, Symbol>,
    pub specification_lines: Vec<String>,
}

pub type ModuleIndex = BTreeMap<String, ModuleInfo>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptionFlags;
    use crate::strategy::host::{HostFlavor, HostImplementation};
    use crate::template::LoopDomain;

    fn host() -> Rc<dyn Implementation> {
        Rc::new(HostImplementation::new(HostFlavor::Sequential, OptionFlags::default()))
    }

    fn routine_with_kernel() -> Routine {
        let mut r = Routine::new("diffuse", "m", host());
        r.programmer_arguments = vec!["a".to_string(), "n".to_string()];
        r.add_symbol(Symbol::array("a", "real(8)", &[("i", "n")]));
        r.add_symbol(Symbol::new("n", "integer(4)"));
        r.add_symbol(Symbol::new("unused", "integer(4)"));
        let spec = r.add_region(RegionKind::Specification(Box::default()));
        r.arena
            .load_line(spec, "real(8), intent(inout) :: a(n)", &["a"])
            .unwrap();
        r.arena.load_line(spec, "integer(4), intent(in) :: n", &["n"]).unwrap();
        r.arena.load_line(spec, "integer(4) :: unused", &["unused"]).unwrap();
        let p = r.add_parallel_region();
        r.arena
            .load_template(p, ParallelTemplate::new("t", vec![LoopDomain::new("i", "n")]))
            .unwrap();
        r.arena.load_line(p, "a = a + 1", &["a"]).unwrap();
        let plain = r.add_region(RegionKind::Plain);
        r.arena.load_line(plain, "n = 0", &["n"]).unwrap();
        r
    }

    #[test]
    fn position_attribute_parsing() {
        assert_eq!(RegionPosition::parse(None).unwrap(), RegionPosition::None);
        assert_eq!(RegionPosition::parse(Some("")).unwrap(), RegionPosition::None);
        assert_eq!(
            RegionPosition::parse(Some("within")).unwrap(),
            RegionPosition::Within
        );
        let e = RegionPosition::parse(Some("around")).unwrap_err();
        assert_eq!(e.code, codes::INVALID_ATTRIBUTE);
    }

    #[test]
    fn used_names_skip_declarations() {
        let r = routine_with_kernel();
        let used = r.used_symbol_names();
        assert!(used.contains("a"));
        assert!(used.contains("n"));
        assert!(!used.contains("unused"));
        let in_kernels = r.used_symbol_names_in_kernels();
        assert!(in_kernels.contains("a"));
        assert!(!in_kernels.contains("n"));
    }

    #[test]
    fn declarations_are_loaded_from_specification() {
        let mut r = routine_with_kernel();
        r.load_declarations().unwrap();
        assert_eq!(r.symbols["a"].intent, crate::symbol::Intent::InOut);
        assert!(r.symbols["n"].is_argument);
        assert!(!r.symbols["unused"].is_argument);
    }

    #[test]
    fn clone_and_rename_are_separate() {
        let r = routine_with_kernel();
        let mut c = r.clone();
        assert_eq!(c.name, "diffuse");
        c.rename("diffuse_hfdev");
        assert_eq!(c.node.name(), "diffuse_hfdev");
        assert_eq!(c.regions.len(), r.regions.len());

        let named = r.clone_with_name("other");
        assert_eq!(named.written_name, "other");
        assert_eq!(named.arena.len(), r.arena.len());
    }

    #[test]
    fn metadata_clone_has_no_regions() {
        let r = routine_with_kernel();
        let mut k = r.create_clone_with_metadata("diffuse_hfk0");
        assert!(k.regions.is_empty());
        assert!(k.specification_region().is_none());
        let spec = r.specification_region().unwrap();
        k.reset_regions(&r, spec).unwrap();
        let p = r.parallel_region_ids()[0];
        k.import_region(&r, p).unwrap();
        assert_eq!(k.regions.len(), 2);
        assert_eq!(k.parallel_region_ids().len(), 1);
        assert!(k.used_symbol_names().contains("a"));
    }

    #[test]
    fn load_call_uses_callee_arguments() {
        let callee = routine_with_kernel();
        let mut caller = Routine::new("step", "m", host());
        caller.add_symbol(Symbol::array("a", "real(8)", &[("i", "n")]));
        let id = caller.load_call(&callee);
        caller.regions.push(id);
        assert_eq!(caller.callee_names(), vec!["diffuse"]);
        assert!(caller.used_symbol_names().contains("n"));
    }

    #[test]
    fn already_alive_symbols_are_filtered() {
        let r = routine_with_kernel();
        let candidates = vec![Symbol::new("n", "integer(4)"), Symbol::new("dt", "real(8)")];
        let left = r.filter_out_symbols_already_alive(&candidates);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "dt");
    }
}
