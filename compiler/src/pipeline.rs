// pipeline.rs — Generation of one compilation unit
//
// Runs the phases in a fixed order:
//   1. strategy selection from the target,
//   2. module index and routine construction from the unit model,
//   3. routine specialization (`generate_routines`),
//   4. callee naming, initial residency and context defaults per routine,
//   5. kernel parameter bookkeeping between callers and kernels,
//   6. rendering of every module.
//
// Preconditions: the unit passed `UnitModel::validate`.
// Postconditions: one module text per input module, in input order.
// Failure modes: the first usage or internal error of any phase aborts the
//   unit; the error names the subroutine it was raised in.
// Side effects: tracing output only.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{debug, info, info_span};

use crate::config::{GenOptions, Target};
use crate::diag::{GenError, GenResult};
use crate::id::RegionId;
use crate::model::{LineModel, ModuleModel, RegionModel, RoutineModel, UnitModel};
use crate::parser::{self, SpecStatement};
use crate::region::{CallSite, ImportEntry, Line, RegionKind};
use crate::render::{render_module_specification, RenderContext};
use crate::routine::{Callee, CalleeIndex, ModuleIndex, ModuleInfo, Routine};
use crate::spec_line;
use crate::strategy::{self, commons, Implementation, KernelParameters, MemoryModel, RegionType};
use crate::symbol::{sort_symbols, DeclarationType, Domain, Symbol};

/// Attributes dropped from the declaration of a compaction array.
const COMPACTION_PURGE: [&str; 6] = ["intent", "parameter", "save", "value", "public", "allocatable"];

/// Generate the target text of `unit`.
pub fn generate(unit: &UnitModel, target: &Target, options: GenOptions) -> GenResult<String> {
    let _span = info_span!("generate", file = %unit.filename, target = %target).entered();
    let implementation = strategy::build_strategy(target, options.flags)?;
    info!(strategy = %implementation.label(), "strategy selected");

    let modules = module_index(unit)?;
    let mut routines = Vec::new();
    for module in &unit.modules {
        for model in &module.routines {
            let routine = build_routine(model, &module.name, &implementation, &modules)
                .map_err(|e| e.with_context(format!("In subroutine {}", model.name)))?;
            routines.push(routine);
        }
    }

    let originals: BTreeMap<String, Callee> = routines
        .iter()
        .map(|r| (r.name.clone(), Callee::from_routine(r)))
        .collect();
    let mut emitted = Vec::with_capacity(routines.len());
    for routine in routines {
        let name = routine.name.clone();
        let split = Rc::clone(&routine.implementation)
            .generate_routines(routine)
            .map_err(|e| e.with_context(format!("In subroutine {}", name)))?;
        debug!(routine = %name, emitted = split.len(), "routine specialized");
        emitted.extend(split);
    }

    for routine in &mut emitted {
        adjust_callee_names(routine, &originals);
        load_initial_device_state(routine);
        load_context_defaults(routine)?;
    }
    link_kernels(&mut emitted, &modules)?;
    render_unit(unit, implementation.as_ref(), &modules, &mut emitted, options)
}

// ── Construction ────────────────────────────────────────────────────────────

fn to_line(line: &LineModel) -> Line {
    Line {
        text: line.text.trim().to_string(),
        symbols: line.symbols.clone(),
    }
}

/// Module-scope symbols with their declarations loaded.
fn module_index(unit: &UnitModel) -> GenResult<ModuleIndex> {
    let mut modules = ModuleIndex::new();
    for module in &unit.modules {
        modules.insert(
            module.name.clone(),
            module_info(module).map_err(|e| e.with_context(format!("In module {}", module.name)))?,
        );
    }
    Ok(modules)
}

fn module_info(module: &ModuleModel) -> GenResult<ModuleInfo> {
    let mut symbols: BTreeMap<String, Symbol> = BTreeMap::new();
    for symbol in &module.symbols {
        let mut symbol = symbol.clone();
        symbol.source_module.get_or_insert_with(|| module.name.clone());
        symbols.insert(symbol.name.clone(), symbol);
    }
    for line in module.specification.iter().filter(|l| !l.symbols.is_empty()) {
        let decl = match parser::parse_statement(&line.text)? {
            SpecStatement::Declaration(decl) => decl,
            SpecStatement::Use(_) => continue,
        };
        for name in line.symbols.iter().filter(|n| decl.declares(n)) {
            if let Some(symbol) = symbols.get_mut(name) {
                symbol.load_declaration(&line.text)?;
                if decl.attribute("parameter").is_some() && !symbol.is_array() {
                    symbol.is_type_parameter = true;
                }
            }
        }
    }
    Ok(ModuleInfo {
        name: module.name.clone(),
        symbols,
        specification_lines: module.specification.iter().map(|l| l.text.clone()).collect(),
    })
}

fn build_routine(
    model: &RoutineModel,
    module: &str,
    implementation: &Rc<dyn Implementation>,
    modules: &ModuleIndex,
) -> GenResult<Routine> {
    let mut routine = Routine::new(&model.name, module, Rc::clone(implementation));
    for (key, value) in &model.attributes {
        routine.node.set_attribute(key, value);
    }
    routine.node.checked_position()?;
    routine.programmer_arguments = model.arguments.clone();
    for symbol in &model.symbols {
        let mut symbol = symbol.clone();
        if model.arguments.iter().any(|a| a.eq_ignore_ascii_case(&symbol.name)) {
            symbol.is_argument = true;
        }
        routine.add_symbol(symbol);
    }

    let mut body = model.body.iter().peekable();
    let specification = routine.add_region(RegionKind::Specification(Box::default()));
    let mut data_lines = Vec::new();
    if let Some(RegionModel::Specification { lines, data_lines: data }) = body.peek() {
        for line in lines {
            routine.arena.load_line(specification, &line.text, &line.symbol_refs())?;
        }
        data_lines = data.clone();
        body.next();
    }
    for region in body {
        load_region(&mut routine, region)?;
    }

    routine.load_declarations()?;
    let imports = load_imports(&mut routine, modules)?;
    let type_parameters: Vec<Symbol> = routine
        .symbols
        .values()
        .filter(|s| s.is_type_parameter && s.source_module.as_deref().map_or(false, |m| m != module))
        .cloned()
        .collect();

    let ctx = routine.specification_context_mut()?;
    ctx.all_imports = Some(imports);
    ctx.type_parameters = type_parameters;
    ctx.data_specification_lines = data_lines;
    Ok(routine)
}

fn load_region(routine: &mut Routine, region: &RegionModel) -> GenResult<()> {
    match region {
        RegionModel::Specification { .. } => Err(GenError::usage(
            crate::diag::codes::MALFORMED_UNIT,
            "the specification block must be the first region of a subroutine",
        )),
        RegionModel::Plain { lines } => {
            let id = routine.add_region(RegionKind::Plain);
            load_lines(routine, id, lines)
        }
        RegionModel::EarlyExit { lines } => {
            let id = routine.add_region(RegionKind::EarlyExit);
            load_lines(routine, id, lines)
        }
        RegionModel::Call { callee, arguments } => {
            let site = call_site(callee, arguments);
            let passed_in = routine.symbols.keys().cloned().collect();
            routine.add_region(RegionKind::Call {
                call: Some(site),
                passed_in,
            });
            Ok(())
        }
        RegionModel::Parallel { template, sub_regions } => {
            let id = routine.add_parallel_region();
            if let Some(template) = template {
                routine.arena.load_template(id, template.clone())?;
                routine.parallel_templates.push(template.clone());
            }
            // the first sub-region is allocated with the parallel region
            let mut first_is_fresh = true;
            for sub in sub_regions {
                match sub {
                    RegionModel::Plain { lines } if first_is_fresh => load_lines(routine, id, lines)?,
                    RegionModel::Plain { lines } => {
                        let plain = routine.arena.alloc(RegionKind::Plain);
                        routine.arena.switch_to_region(id, plain)?;
                        load_lines(routine, plain, lines)?;
                    }
                    RegionModel::Call { callee, arguments } => {
                        let passed_in = routine.symbols.keys().cloned().collect();
                        let call = routine.arena.alloc_call(Some(call_site(callee, arguments)), passed_in);
                        routine.arena.switch_to_region(id, call)?;
                    }
                    other => {
                        return Err(GenError::usage(
                            crate::diag::codes::MALFORMED_UNIT,
                            format!("a {} region cannot be nested in a parallel region", other.kind_name()),
                        ))
                    }
                }
                first_is_fresh = false;
            }
            Ok(())
        }
    }
}

fn call_site(callee: &str, arguments: &[String]) -> CallSite {
    let arguments: Vec<&str> = arguments.iter().map(String::as_str).collect();
    CallSite::new(callee, &arguments)
}

fn load_lines(routine: &mut Routine, id: RegionId, lines: &[LineModel]) -> GenResult<()> {
    for line in lines {
        routine.arena.load_line(id, &line.text, &line.symbol_refs())?;
    }
    Ok(())
}

/// Import entries of the specification block. Imported symbols learn their
/// source module and whatever the module scope knows about them.
fn load_imports(routine: &mut Routine, modules: &ModuleIndex) -> GenResult<Vec<ImportEntry>> {
    let lines = match routine.specification_region() {
        Some(id) => routine.arena.get(id)?.lines.clone(),
        None => return Ok(Vec::new()),
    };
    let mut entries = Vec::new();
    for line in &lines {
        let statement = match parser::parse_use(&line.text) {
            Some(statement) => statement,
            None => continue,
        };
        let module = modules.get(&statement.module);
        match &statement.only {
            None => {
                entries.push(ImportEntry {
                    module: statement.module.clone(),
                    name_in_scope: None,
                    source_name: None,
                });
                if let Some(module) = module {
                    for (name, known) in &module.symbols {
                        if let Some(symbol) = routine.symbols.get_mut(name) {
                            adopt_module_symbol(symbol, known, &statement.module, None);
                        }
                    }
                }
            }
            Some(renames) => {
                for rename in renames {
                    let source_name = (rename.source != rename.local).then(|| rename.source.clone());
                    entries.push(ImportEntry {
                        module: statement.module.clone(),
                        name_in_scope: Some(rename.local.clone()),
                        source_name: source_name.clone(),
                    });
                    if let Some(symbol) = routine.symbols.get_mut(&rename.local) {
                        let known = module.and_then(|m| m.symbols.get(&rename.source));
                        match known {
                            Some(known) => adopt_module_symbol(symbol, known, &statement.module, source_name),
                            None => {
                                symbol.source_module = Some(statement.module.clone());
                                symbol.source_name = source_name;
                            }
                        }
                    }
                }
            }
        }
    }

    // host association with the enclosing module
    if let Some(own) = modules.get(&routine.module) {
        let declared_locally = declared_names(routine)?;
        for (name, known) in &own.symbols {
            if declared_locally.contains(name) {
                continue;
            }
            if let Some(symbol) = routine.symbols.get_mut(name) {
                if symbol.source_module.is_none() {
                    adopt_module_symbol(symbol, known, &own.name, None);
                }
            }
        }
    }
    Ok(entries)
}

fn adopt_module_symbol(symbol: &mut Symbol, known: &Symbol, module: &str, source_name: Option<String>) {
    symbol.source_module = Some(module.to_string());
    symbol.source_name = source_name;
    if symbol.declaration_type == DeclarationType::default() {
        symbol.declaration_type = known.declaration_type;
    }
    symbol.is_type_parameter |= known.is_type_parameter;
    symbol.merge(known);
}

fn declared_names(routine: &Routine) -> GenResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let id = match routine.specification_region() {
        Some(id) => id,
        None => return Ok(names),
    };
    for line in routine.arena.get(id)?.lines.iter().filter(|l| !l.symbols.is_empty()) {
        if let SpecStatement::Declaration(decl) = parser::parse_statement(&line.text)? {
            names.extend(line.symbols.iter().filter(|n| decl.declares(n)).cloned());
        }
    }
    Ok(names)
}

// ── Per-routine preparation ─────────────────────────────────────────────────

/// Names the routine's call sites use, decided by each callee's strategy
/// from the callee as written.
fn adjust_callee_names(routine: &mut Routine, originals: &BTreeMap<String, Callee>) {
    for name in routine.callee_names() {
        let callee = match originals.get(&name) {
            Some(c) => c,
            None => continue,
        };
        let implementation = match &callee.implementation {
            Some(i) => i,
            None => continue,
        };
        let adjusted = implementation.adjust_callee_name(
            &name,
            callee.position(),
            routine.implementation.caps(),
            routine.position(),
            callee.node.is_kernel_caller(),
        );
        if adjusted != name {
            debug!(caller = %routine.name, callee = %name, adjusted = %adjusted, "callee renamed");
            routine.adjusted_callee_names.insert(name, adjusted);
        }
    }
}

fn load_initial_device_state(routine: &mut Routine) {
    let implementation = Rc::clone(&routine.implementation);
    let used_in_kernels = routine.used_symbol_names_in_kernels();
    let region_type = if routine.is_calling_kernel() {
        RegionType::KernelCallerDeclaration
    } else {
        RegionType::Other
    };
    let position = routine.position();
    for symbol in routine.symbols.values_mut() {
        implementation.update_symbol_device_state(symbol, Some(&used_in_kernels), region_type, position, false);
    }
}

fn load_context_defaults(routine: &mut Routine) -> GenResult<()> {
    let ctx = routine.specification_context_mut()?;
    ctx.additional_parameters_by_kernel.get_or_insert_with(BTreeMap::new);
    ctx.symbols_to_add.get_or_insert_with(Vec::new);
    ctx.compaction_prefix_by_callee.get_or_insert_with(BTreeMap::new);
    ctx.compacted_parameters.get_or_insert_with(Vec::new);
    ctx.all_imports.get_or_insert_with(Vec::new);
    Ok(())
}

// ── Kernel parameter bookkeeping ────────────────────────────────────────────

/// One call site whose callee needs parameters beyond the written arguments.
struct KernelLink {
    caller: usize,
    region: RegionId,
    callee: usize,
    parameters: KernelParameters,
}

fn link_kernels(routines: &mut [Routine], modules: &ModuleIndex) -> GenResult<()> {
    let mut index = CalleeIndex::new();
    let mut positions: BTreeMap<String, usize> = BTreeMap::new();
    for (n, routine) in routines.iter().enumerate() {
        index.insert(&routine.name, Callee::from_routine(routine));
        positions.insert(routine.name.clone(), n);
    }

    let mut links = Vec::new();
    for (n, caller) in routines.iter().enumerate() {
        for region in caller.call_region_ids() {
            let site = match &caller.arena.get(region)?.kind {
                RegionKind::Call { call: Some(site), .. } => site,
                _ => continue,
            };
            let name = caller.adjusted_callee_names.get(&site.callee).unwrap_or(&site.callee);
            let (callee, callee_index) = match (index.get(name), positions.get(name)) {
                (Some(c), Some(&i)) => (c, i),
                _ => continue,
            };
            let implementation = match &callee.implementation {
                Some(i) => i,
                None => continue,
            };
            let parameters = implementation
                .additional_kernel_parameters(caller, callee, &site.arguments, modules)
                .map_err(|e| e.with_context(format!("In call to {} from {}", name, caller.name)))?;
            if parameters.imports.is_empty() && parameters.declarations.is_empty() && parameters.dummies.is_empty() {
                continue;
            }
            links.push(KernelLink {
                caller: n,
                region,
                callee: callee_index,
                parameters,
            });
        }
    }

    let mut linked_callees = BTreeSet::new();
    for link in links {
        apply_link(routines, link, &mut linked_callees)?;
    }
    Ok(())
}

fn is_compactable(symbol: &Symbol) -> bool {
    !symbol.is_array()
        && !symbol.intent.is_output()
        && !symbol.is_type_parameter
        && symbol.declaration_directives().trim_start().to_ascii_lowercase().starts_with("real")
}

fn apply_link(routines: &mut [Routine], link: KernelLink, linked_callees: &mut BTreeSet<usize>) -> GenResult<()> {
    let KernelParameters {
        imports,
        declarations,
        dummies,
    } = link.parameters;
    let callee_name = routines[link.callee].name.clone();
    let callee_used = routines[link.callee].used_symbol_names();
    let callee_kernel_names = routines[link.callee].used_symbol_names_in_kernels();
    let compacts = routines[link.callee].implementation.caps().memory_model == MemoryModel::ExplicitMemory;

    // scalars sharing the type of the first candidate travel in one array
    let mut packed: Vec<Symbol> = Vec::new();
    let mut passed: Vec<Symbol> = Vec::new();
    let mut compaction_prefix: Option<String> = None;
    for symbol in &dummies {
        if !compacts || !is_compactable(symbol) || !callee_used.contains(&symbol.name) {
            passed.push(symbol.clone());
            continue;
        }
        let prefix = spec_line::purge_directives(symbol.declaration_directives(), &COMPACTION_PURGE)?;
        match &compaction_prefix {
            Some(first) if *first != prefix => passed.push(symbol.clone()),
            _ => {
                compaction_prefix = Some(prefix);
                packed.push(symbol.clone());
            }
        }
    }
    sort_symbols(&mut packed);

    let mut arguments: BTreeMap<String, Symbol> = BTreeMap::new();
    for symbol in imports.iter().chain(declarations.iter()).chain(passed.iter()) {
        arguments.entry(symbol.name.clone()).or_insert_with(|| symbol.clone());
    }
    let framework_array = compaction_prefix.as_ref().map(|prefix| Symbol {
        declaration_type: DeclarationType::FrameworkArray,
        declaration_prefix: Some(prefix.clone()),
        domains: vec![Domain::new("hfauto", &packed.len().to_string())],
        is_present: true,
        is_on_device: true,
        ..Symbol::new(&commons::framework_array_name(&callee_name), prefix)
    });
    if let Some(array) = &framework_array {
        arguments.insert(array.name.clone(), array.clone());
    }
    let mut arguments: Vec<Symbol> = arguments.into_values().collect();
    sort_symbols(&mut arguments);

    let mut forwarded: Vec<String> = arguments
        .iter()
        .filter(|s| callee_used.contains(&s.name) || s.declaration_type == DeclarationType::FrameworkArray)
        .map(Symbol::host_name)
        .collect();
    forwarded.extend(packed.iter().map(Symbol::host_name));
    debug!(callee = %callee_name, forwarded = ?forwarded, packed = packed.len(), "kernel parameters linked");

    // caller side
    {
        let caller = &mut routines[link.caller];
        let alive = caller.filter_out_symbols_already_alive(&imports);
        for symbol in alive {
            if !caller.additional_imports.iter().any(|s| s.name == symbol.name) {
                caller.additional_imports.push(symbol);
            }
        }
        caller.names_used_in_called_kernels.extend(callee_kernel_names);
        if let RegionKind::Call { call: Some(site), .. } = &mut caller.arena.get_mut(link.region)?.kind {
            site.forwarded = forwarded;
        }
        if let Some(array) = &framework_array {
            let caller_versions: Vec<Symbol> = packed
                .iter()
                .map(|s| caller.symbol(&s.host_name()).cloned().unwrap_or_else(|| s.clone()))
                .collect();
            caller.packed_symbols_by_callee.insert(callee_name.clone(), caller_versions);
            caller.add_symbol(array.clone());
        }
        let mut declared = declarations.clone();
        declared.extend(dummies.iter().cloned());
        let ctx = caller.specification_context_mut()?;
        ctx.additional_parameters_by_kernel
            .get_or_insert_with(BTreeMap::new)
            .insert(callee_name.clone(), (imports.clone(), declared));
        if let Some(prefix) = &compaction_prefix {
            ctx.compaction_prefix_by_callee
                .get_or_insert_with(BTreeMap::new)
                .insert(callee_name.clone(), prefix.clone());
        }
    }

    // callee side, once per kernel
    if !linked_callees.insert(link.callee) {
        return Ok(());
    }
    let callee = &mut routines[link.callee];
    let implementation = Rc::clone(&callee.implementation);
    let position = callee.position();
    for symbol in &mut arguments {
        implementation.update_symbol_device_state(symbol, None, RegionType::Other, position, false);
        callee.symbols.entry(symbol.name.clone()).or_insert_with(|| symbol.clone());
    }
    let compacted: Vec<Symbol> = packed
        .iter()
        .map(|s| Symbol {
            is_compacted: true,
            ..s.clone()
        })
        .collect();
    for symbol in &compacted {
        callee
            .symbols
            .entry(symbol.name.clone())
            .and_modify(|s| s.is_compacted = true)
            .or_insert_with(|| symbol.clone());
    }
    callee.additional_argument_symbols = arguments.clone();

    let ctx = callee.specification_context_mut()?;
    let to_add = ctx.symbols_to_add.get_or_insert_with(Vec::new);
    to_add.extend(arguments);
    to_add.extend(compacted.iter().cloned());
    ctx.compacted_parameters.get_or_insert_with(Vec::new).extend(compacted);
    Ok(())
}

// ── Rendering ───────────────────────────────────────────────────────────────

fn render_unit(
    unit: &UnitModel,
    implementation: &dyn Implementation,
    modules: &ModuleIndex,
    routines: &mut [Routine],
    options: GenOptions,
) -> GenResult<String> {
    let mut callees = CalleeIndex::new();
    for routine in routines.iter() {
        callees.insert(&routine.name, Callee::from_routine(routine));
    }
    let mut ctx = RenderContext::new(&callees, options);

    let mut text = implementation.file_preparation(&unit.filename);
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    for module in &unit.modules {
        text.push_str(&format!("module {}\n", module.name));
        let mut symbols = modules.get(&module.name).map(|m| m.symbols.clone()).unwrap_or_default();
        let lines: Vec<Line> = module.specification.iter().map(to_line).collect();
        text.push_str(
            &render_module_specification(implementation, &lines, &mut symbols)
                .map_err(|e| e.with_context(format!("In module {}", module.name)))?,
        );
        text.push_str("contains\n");
        for routine in routines.iter_mut().filter(|r| r.module == module.name) {
            text.push_str(&ctx.render_routine(routine)?);
        }
        text.push_str(&format!("end module {}\n", module.name));
    }
    info!(routines = routines.len(), bytes = text.len(), "unit generated");
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Architecture;
    use crate::diag::codes;

    fn unit(json: &str) -> UnitModel {
        UnitModel::from_json(json).unwrap()
    }

    const ROUTINE_WITH_LOOP: &str = r#"{
      "filename": "diffusion.h90",
      "modules": [{
        "name": "diffusion",
        "specification": [{"text": "implicit none"}],
        "routines": [{
          "name": "step",
          "attributes": {"parallelRegionPosition": "within"},
          "arguments": ["a", "n"],
          "symbols": [
            {"name": "a", "type_spec": "real(8)", "domains": [{"name": "i", "size": "n"}],
             "declaration_type": "local_array"},
            {"name": "n", "type_spec": "integer(4)", "declaration_type": "local_scalar"}
          ],
          "body": [
            {"kind": "specification", "lines": [
              {"text": "real(8), intent(inout) :: a(n)", "symbols": ["a"]},
              {"text": "integer(4), intent(in) :: n", "symbols": ["n"]}
            ]},
            {"kind": "parallel", "template": {"id": "t", "domains": [{"name": "i", "size": "n"}]},
             "sub_regions": [{"kind": "plain", "lines": [{"text": "a = a * 2", "symbols": ["a"]}]}]}
          ]
        }]
      }]
    }"#;

    #[test]
    fn cpu_unit_renders_loop_in_place() {
        let text = generate(&unit(ROUTINE_WITH_LOOP), &Target::new(Architecture::Cpu), GenOptions::default()).unwrap();
        assert!(text.starts_with("#include \"storage_order.F90\"\nmodule diffusion\nimplicit none\ncontains\n"));
        assert!(text.contains("subroutine step(a, n)\n"));
        assert!(text.contains("do i=1,n\na(i) = a(i) * 2\nend do\n"));
        assert!(text.ends_with("end subroutine step\nend module diffusion\n"));
    }

    #[test]
    fn cuda_unit_splits_into_wrapper_host_and_kernel() {
        let text = generate(&unit(ROUTINE_WITH_LOOP), &Target::new(Architecture::Cuda), GenOptions::default()).unwrap();
        let wrapper = text.find("subroutine step_hfdev(a, n)").unwrap();
        let host = text.find("subroutine step(a, n)").unwrap();
        let kernel = text.find("attributes(global) subroutine step_hfk0(").unwrap();
        assert!(wrapper < host && host < kernel);
        assert!(text.contains("call step_hfk0 <<< cugrid, cublock >>>("));
    }

    #[test]
    fn cuda_trace_is_rejected_before_any_work() {
        let mut target = Target::new(Architecture::Cuda);
        target.trace = true;
        let e = generate(&unit(ROUTINE_WITH_LOOP), &target, GenOptions::default()).unwrap_err();
        assert_eq!(e.code, codes::UNSUPPORTED_TARGET);
    }

    #[test]
    fn invalid_position_names_the_subroutine() {
        let json = ROUTINE_WITH_LOOP.replace("\"within\"", "\"beside\"");
        let e = generate(&unit(&json), &Target::new(Architecture::Cpu), GenOptions::default()).unwrap_err();
        assert_eq!(e.code, codes::INVALID_ATTRIBUTE);
        assert!(e.message.ends_with("In subroutine step"));
    }

    #[test]
    fn imported_symbols_learn_their_module() {
        let json = r#"{
          "filename": "x.h90",
          "modules": [
            {"name": "kinds",
             "specification": [{"text": "integer, parameter :: rk = 8", "symbols": ["rk"]}],
             "symbols": [{"name": "rk", "type_spec": "integer", "declaration_type": "foreign_module_scalar"}]},
            {"name": "m", "routines": [{
              "name": "r",
              "symbols": [{"name": "rk"}],
              "body": [{"kind": "specification", "lines": [
                {"text": "use kinds, only: rk", "symbols": ["rk"]}
              ]}]
            }]}
          ]
        }"#;
        let u = unit(json);
        let implementation = strategy::build_strategy(&Target::new(Architecture::Cpu), Default::default()).unwrap();
        let modules = module_index(&u).unwrap();
        let r = build_routine(&u.modules[1].routines[0], "m", &implementation, &modules).unwrap();
        let rk = &r.symbols["rk"];
        assert_eq!(rk.source_module.as_deref(), Some("kinds"));
        assert!(rk.is_type_parameter);
        let ctx = r.specification_context().unwrap();
        assert_eq!(ctx.type_parameters.len(), 1);
        assert_eq!(ctx.all_imports.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn compactable_scalars_are_real_inputs() {
        let mut dt = Symbol::new("dt", "real(8)");
        assert!(is_compactable(&dt));
        dt.intent = crate::symbol::Intent::InOut;
        assert!(!is_compactable(&dt));
        assert!(!is_compactable(&Symbol::new("n", "integer(4)")));
        assert!(!is_compactable(&Symbol::array("a", "real(8)", &[("i", "n")])));
    }
}
