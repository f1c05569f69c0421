// render.rs — Region tree rendering
//
// Walks the top-level regions of one routine in source order and asks the
// routine's strategy for every architecture-specific fragment. The render
// session lives in the context and is exclusively borrowed by the routine in
// flight: `render_routine` begins it and the closing exit point resets it.
//
// Preconditions: specification contexts are loaded (see `pipeline`); callees
//   are indexed under their emitted names.
// Postconditions: no session is in flight after `render_routine` returns,
//   whether it succeeded or not.
// Failure modes: call regions without callee, parallel regions without a
//   template in a routine that contains the loop, symbols missing from the
//   routine (internal errors); anything the strategy reports.
// Side effects: residency flags of the routine's symbols are updated in place.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::access::{implement_line, AccessContext};
use crate::config::GenOptions;
use crate::diag::{codes, GenError, GenResult};
use crate::id::RegionId;
use crate::lexer;
use crate::parser::{self, SpecStatement};
use crate::region::{Line, RegionKind, SpecificationContext};
use crate::routine::{Callee, CalleeIndex, RegionPosition, Routine};
use crate::strategy::{commons, ImportSource, Implementation, RegionType, RenderSession};
use crate::symbol::{sort_symbols, DeclarationType, Domain, Symbol};
use crate::template::ParallelTemplate;

/// Attributes dropped from declarations the generator adds on its own.
const ADDED_SYMBOL_PURGE: [&str; 5] = ["intent", "public", "parameter", "allocatable", "save"];
const ADDED_ARGUMENT_PURGE: [&str; 4] = ["public", "parameter", "allocatable", "save"];

pub struct RenderContext<'a> {
    callees: &'a CalleeIndex,
    options: GenOptions,
    pub session: RenderSession,
}

impl<'a> RenderContext<'a> {
    pub fn new(callees: &'a CalleeIndex, options: GenOptions) -> Self {
        RenderContext {
            callees,
            options,
            session: RenderSession::new(),
        }
    }

    /// Full text of one subroutine, from header to `end subroutine`.
    pub fn render_routine(&mut self, routine: &mut Routine) -> GenResult<String> {
        let result = self.routine_text(routine);
        if result.is_err() || self.session.is_in_flight() {
            self.session.end_subroutine();
        }
        result.map_err(|e| e.with_context(format!("In subroutine {}", routine.name)))
    }

    fn routine_text(&mut self, routine: &mut Routine) -> GenResult<String> {
        let implementation = Rc::clone(&routine.implementation);
        self.session.begin(&routine.node, &routine.module)?;
        debug!(routine = %routine.name, strategy = %implementation.label(), "rendering subroutine");

        let prefix = implementation.subroutine_prefix(&routine.node)?;
        let mut parameters: Vec<String> = routine
            .additional_argument_symbols
            .iter()
            .map(|s| s.name_in_scope(true))
            .collect();
        parameters.extend(routine.programmer_arguments.iter().cloned());

        let mut text = String::new();
        if !prefix.is_empty() {
            text.push_str(&prefix);
            text.push(' ');
        }
        text.push_str(&format!("subroutine {}({})\n", routine.name, parameters.join(", ")));
        text.push_str(&implementation.additional_includes());
        for id in routine.regions.clone() {
            text.push_str(&self.render_region(routine, id)?);
        }
        text.push_str(&self.exit_point(routine, true)?);
        text.push_str(&format!("end subroutine {}\n", routine.name));
        Ok(text)
    }

    /// Text of one region and everything below it.
    pub fn render_region(&mut self, routine: &mut Routine, id: RegionId) -> GenResult<String> {
        let label = routine.arena.get(id)?.kind.label();
        match &routine.arena.get(id)?.kind {
            RegionKind::Plain => self.render_plain(routine, id, false),
            RegionKind::Parallel { .. } => self.render_parallel(routine, id),
            RegionKind::Call { .. } => self.render_call(routine, id),
            RegionKind::Specification(_) => self.render_specification(routine, id),
            RegionKind::EarlyExit => self.render_early_exit(routine, id),
        }
        .map_err(|e| e.with_context(format!("In {} of {}", label, routine.name)))
    }

    fn sanitize(&self, text: &str, label: &str, skip_markers: bool) -> String {
        if !self.options.region_markers || skip_markers {
            return format!("{}\n", text.trim());
        }
        format!("!<--- {}\n{}\n!--->\n", label, text.trim())
    }

    fn marker(&self, text: &mut String, title: &str) {
        if self.options.region_markers {
            text.push_str(&format!("!<----- {} --\n", title));
        }
    }

    // ── Plain statements ──

    fn render_plain(&mut self, routine: &Routine, id: RegionId, skip_markers: bool) -> GenResult<String> {
        let text = implemented_lines(routine, id)?;
        if text.is_empty() {
            return Ok(String::new());
        }
        let label = routine.arena.get(id)?.kind.label();
        Ok(self.sanitize(&text, label, skip_markers))
    }

    // ── Parallel regions ──

    fn render_parallel(&mut self, routine: &mut Routine, id: RegionId) -> GenResult<String> {
        let (sub_regions, template) = match &routine.arena.get(id)?.kind {
            RegionKind::Parallel {
                sub_regions, template, ..
            } => (sub_regions.clone(), template.clone()),
            other => {
                return Err(GenError::internal(
                    codes::DANGLING_REGION,
                    format!("expected a parallel region, found {}", other.label()),
                ))
            }
        };
        let contains_loop = routine.position() == RegionPosition::Within;
        let template = match template {
            Some(t) => Some(t),
            None if contains_loop => {
                return Err(GenError::internal(
                    codes::MISSING_TEMPLATE,
                    "cannot implement parallel region without a template loaded",
                ))
            }
            None => None,
        };
        let implementation = Rc::clone(&routine.implementation);

        let mut text = String::new();
        if let (true, Some(template)) = (contains_loop, &template) {
            let used: BTreeSet<String> = routine.arena.used_symbol_names(id)?.into_iter().collect();
            let symbols: Vec<&Symbol> = routine.symbols.values().filter(|s| used.contains(&s.name)).collect();
            let begin = implementation.begin_parallel_region(&mut self.session, &symbols, template)?;
            text.push_str(begin.trim());
            text.push('\n');
        }
        let mut parts = Vec::with_capacity(sub_regions.len());
        for sub in sub_regions {
            parts.push(self.render_region(routine, sub)?);
        }
        text.push_str(&parts.join("\n"));
        if let (true, Some(template)) = (contains_loop, &template) {
            let end = implementation.end_parallel_region(&mut self.session, template, routine)?;
            text.push_str(end.trim());
            text.push('\n');
        }
        Ok(self.sanitize(&text, "ParallelRegion", false))
    }

    // ── Call sites ──

    fn render_call(&mut self, routine: &mut Routine, id: RegionId) -> GenResult<String> {
        let (site, passed_in) = match &routine.arena.get(id)?.kind {
            RegionKind::Call { call: Some(site), passed_in } => (site.clone(), passed_in.clone()),
            RegionKind::Call { call: None, .. } => {
                return Err(GenError::internal(
                    codes::MISSING_CALLEE,
                    format!("call not loaded for call region in {}", routine.name),
                ))
            }
            other => {
                return Err(GenError::internal(
                    codes::DANGLING_REGION,
                    format!("expected a call region, found {}", other.label()),
                ))
            }
        };
        let callee_name = routine
            .adjusted_callee_names
            .get(&site.callee)
            .cloned()
            .unwrap_or_else(|| site.callee.clone());
        let callee = self
            .callees
            .get(&callee_name)
            .cloned()
            .unwrap_or_else(|| Callee::external(&callee_name));
        let template = routine.arena.enclosing_template(id)?.cloned();

        if !callee.is_analyzable() && template.is_some() {
            let message = routine
                .implementation
                .warning_on_unrecognized_call(&routine.name, &callee_name);
            if !message.is_empty() {
                warn!("{}", message.trim_end());
            }
        }

        let mut text = compaction_assignments(routine, &callee);

        let foreign = callee.is_analyzable() && callee.module != routine.module;
        match &callee.implementation {
            Some(callee_impl) if callee.position() == RegionPosition::Within && !foreign => {
                let launch_template = callee.parallel_templates.first().ok_or_else(|| {
                    GenError::internal(
                        codes::MISSING_TEMPLATE,
                        format!("no parallel region templates found for subroutine {}", callee.name),
                    )
                })?;
                let preparation =
                    callee_impl.kernel_call_preparation(&mut self.session, launch_template, Some(&callee.node))?;
                text.push_str(&preparation);
                text.push_str(&format!("call {}", callee_name));
                let config = callee_impl.kernel_call_config();
                if !config.is_empty() {
                    text.push(' ');
                    text.push_str(&config);
                }
            }
            _ => text.push_str(&format!("call {}", callee_name)),
        }

        text.push('(');
        if callee.is_analyzable() {
            let required: Vec<&Symbol> = callee
                .additional_argument_symbols
                .iter()
                .filter(|s| callee.used_symbol_names.contains(&s.name))
                .collect();
            if !required.is_empty() {
                text.push_str(" &\n");
            }
            for (n, symbol) in required.iter().enumerate() {
                let in_caller = routine.symbol(&symbol.host_name()).ok_or_else(|| {
                    GenError::internal(
                        codes::SYMBOL_NOT_IN_SCOPE,
                        format!("{} not found in context of {}", symbol.name, routine.name),
                    )
                })?;
                text.push_str(&in_caller.name_in_scope(true));
                if n + 1 < required.len() || !site.arguments.is_empty() {
                    text.push_str(", &\n&");
                }
            }
        }
        text.push_str(&self.call_arguments(routine, &callee, &site.arguments, template.as_ref())?);
        text.push_str(")\n");

        if let Some(callee_impl) = &callee.implementation {
            if !callee_impl.caps().allows_mixed_host_and_device_code && !foreign {
                let mut active: BTreeMap<String, Symbol> = BTreeMap::new();
                for symbol in &callee.additional_argument_symbols {
                    active.insert(symbol.name.clone(), symbol.clone());
                }
                for name in &passed_in {
                    if let Some(symbol) = routine.symbol(name) {
                        active.insert(name.clone(), symbol.clone());
                    }
                }
                let symbols: Vec<&Symbol> = active
                    .values()
                    .filter(|s| callee.used_symbol_names_in_kernels.contains(&s.name))
                    .collect();
                text.push_str(&callee_impl.kernel_call_post(&mut self.session, &symbols, &callee.node));
            }
        }
        Ok(self.sanitize(&text, "CallRegion", false))
    }

    /// Written arguments rewritten for the callee's iteration space.
    fn call_arguments(
        &self,
        routine: &Routine,
        callee: &Callee,
        arguments: &[String],
        template: Option<&ParallelTemplate>,
    ) -> GenResult<String> {
        let callee_impl = match &callee.implementation {
            Some(i) => i,
            None => return Ok(arguments.join(", ")),
        };
        let iterators = template.map(|t| callee_impl.iterators(t)).unwrap_or_default();
        let ctx = AccessContext {
            iterators: &iterators,
            use_device: routine.implementation.caps().on_device,
            in_kernel: routine.position() == RegionPosition::Within && !iterators.is_empty(),
        };
        let symbols: Vec<&Symbol> = routine.symbols.values().collect();
        let mut adjusted = Vec::with_capacity(arguments.len());
        for argument in arguments {
            adjusted.push(
                implement_line(argument, &symbols, &ctx, true)
                    .map_err(|e| e.with_context(format!("In argument: {}", argument)))?,
            );
        }
        Ok(adjusted.join(", "))
    }

    // ── Declaration block ──

    fn render_specification(&mut self, routine: &mut Routine, id: RegionId) -> GenResult<String> {
        let (lines, ctx) = {
            let region = routine.arena.get(id)?;
            match &region.kind {
                RegionKind::Specification(ctx) => (region.lines.clone(), (**ctx).clone()),
                other => {
                    return Err(GenError::internal(
                        codes::MISSING_CONTEXT,
                        format!("{} has no specification context", other.label()),
                    ))
                }
            }
        };
        if !ctx.is_loaded() {
            return Err(GenError::internal(
                codes::MISSING_CONTEXT,
                format!(
                    "additional context not properly loaded for routine specification region in {}",
                    routine.name
                ),
            ));
        }
        let implementation = Rc::clone(&routine.implementation);
        let region_type = if routine.is_calling_kernel() {
            RegionType::KernelCallerDeclaration
        } else {
            RegionType::Other
        };
        let position = routine.position();
        let used = routine.used_symbol_names();
        let used_in_kernels = routine.used_symbol_names_in_kernels();

        let buckets = classify_specification_lines(routine, &lines, &ctx)?;
        let mut text = String::new();

        // imports
        let all_imports = ctx.all_imports.clone().unwrap_or_default();
        let whole_modules: BTreeSet<&str> = all_imports
            .iter()
            .filter(|e| e.name_in_scope.is_none())
            .map(|e| e.module.as_str())
            .collect();
        if !ctx.type_parameters.is_empty() {
            self.marker(&mut text, "type parameters");
        }
        for parameter in &ctx.type_parameters {
            if parameter
                .source_module
                .as_deref()
                .map_or(false, |m| whole_modules.contains(m))
            {
                continue;
            }
            let mut parameter = parameter.clone();
            text.push_str(&implementation.import_specification(
                ImportSource::Symbols(&mut [&mut parameter]),
                region_type,
                position,
            )?);
        }
        if !all_imports.is_empty() {
            self.marker(&mut text, "synthesized imports");
        }
        for entry in &all_imports {
            let local = match &entry.name_in_scope {
                None => {
                    text.push_str(&implementation.import_specification(
                        ImportSource::Module(&entry.module),
                        region_type,
                        position,
                    )?);
                    continue;
                }
                Some(local) => local,
            };
            if whole_modules.contains(entry.module.as_str())
                || ctx.type_parameters.iter().any(|p| p.name.eq_ignore_ascii_case(local))
            {
                continue;
            }
            match routine.symbols.get_mut(local) {
                Some(symbol) if symbol.source_module.as_deref() == Some(routine.module.as_str()) => {}
                Some(symbol) => {
                    text.push_str(&implementation.import_specification(
                        ImportSource::Symbols(&mut [symbol]),
                        region_type,
                        position,
                    )?);
                }
                None => {
                    let source = entry.source_name.as_deref().unwrap_or(local);
                    let adjusted_source = routine.adjusted_callee_names.get(source).map_or(source, String::as_str);
                    let adjusted_local = routine.adjusted_callee_names.get(local).map_or(local.as_str(), String::as_str);
                    if adjusted_local == adjusted_source {
                        text.push_str(&format!("use {}, only: {}", entry.module, adjusted_local));
                    } else {
                        text.push_str(&format!(
                            "use {}, only: {} => {}",
                            entry.module, adjusted_local, adjusted_source
                        ));
                    }
                    if self.options.region_markers {
                        text.push_str(" ! resynthesizing user input - no associated HF aware symbol found");
                    }
                    text.push('\n');
                }
            }
        }
        for symbol in routine.additional_imports.iter_mut().filter(|s| used.contains(&s.name)) {
            text.push_str(&implementation.import_specification(
                ImportSource::Symbols(&mut [symbol]),
                region_type,
                position,
            )?);
        }

        if !buckets.keywords.is_empty() {
            self.marker(&mut text, "other imports and specs:");
        }
        text.push_str(&buckets.keywords);
        if !buckets.before.is_empty() {
            self.marker(&mut text, "before declarations:");
        }
        text.push_str(&buckets.before);

        // declarations of the symbols this routine actually uses
        let declared: Vec<String> = buckets.declared.into_iter().filter(|n| used.contains(n)).collect();
        if !declared.is_empty() {
            self.marker(&mut text, "declarations:");
            let mut adjusted = Vec::with_capacity(declared.len());
            for name in &declared {
                let symbol = routine.symbols.get_mut(name).ok_or_else(|| not_in_scope(name, &routine.name))?;
                let line = symbol.declaration_line(&[])?;
                let rendered = implementation
                    .adjust_declaration_for_device(&line, &mut [symbol], Some(&used_in_kernels), region_type, position)
                    .map_err(|e| e.with_context(format!("In declaration of {}", name)))?;
                adjusted.push(rendered.trim().to_string());
            }
            text.push_str(adjusted.join("\n").trim());
            text.push('\n');
        }
        if !ctx.data_specification_lines.is_empty() {
            self.marker(&mut text, "data specifications:");
            text.push_str(&ctx.data_specification_lines.join("\n"));
            text.push('\n');
        }
        if !buckets.after.is_empty() {
            self.marker(&mut text, "after declarations:");
        }
        text.push_str(&buckets.after);

        let declared: BTreeSet<String> = declared.into_iter().collect();
        text.push_str(&self.added_declarations(routine, &ctx, &declared, region_type)?);

        // strategy specific trailer
        let decl_end = {
            let mut symbols: Vec<&mut Symbol> = routine
                .symbols
                .values_mut()
                .chain(routine.additional_imports.iter_mut())
                .filter(|s| used.contains(&s.name))
                .collect();
            implementation.declaration_end(
                &mut self.session,
                &mut symbols,
                routine.node.is_kernel_caller(),
                &routine.node,
                &routine.parallel_templates,
            )?
        };
        if !decl_end.is_empty() {
            text.push_str("!<----- impl. specific decl end : --\n");
            text.push_str(&decl_end);
        }

        let mut compacted: Vec<Symbol> = ctx
            .compacted_parameters
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| used.contains(&s.name))
            .collect();
        sort_symbols(&mut compacted);
        let framework_array = commons::framework_array_name(&routine.name);
        for (idx, symbol) in compacted.iter().enumerate() {
            text.push_str(&format!(
                "{} = {}({}) ! additional type {} symbol compaction\n",
                symbol.name_in_scope(true),
                framework_array,
                idx + 1,
                symbol.declaration_type.code()
            ));
        }
        Ok(self.sanitize(&text, "RoutineSpecificationRegion", false))
    }

    /// Declarations the generator adds: symbols of this routine, locals of
    /// launched kernels and compaction arrays.
    fn added_declarations(
        &self,
        routine: &Routine,
        ctx: &SpecificationContext,
        declared: &BTreeSet<String>,
        region_type: RegionType,
    ) -> GenResult<String> {
        let implementation = Rc::clone(&routine.implementation);
        let position = routine.position();
        let used = routine.used_symbol_names();
        let used_in_kernels = routine.used_symbol_names_in_kernels();
        let symbols_to_add = ctx.symbols_to_add.clone().unwrap_or_default();
        let parameters_by_kernel = ctx.additional_parameters_by_kernel.clone().unwrap_or_default();
        let compaction_prefixes = ctx.compaction_prefix_by_callee.clone().unwrap_or_default();
        let compacted = ctx.compacted_parameters.as_deref().unwrap_or(&[]);

        let mut text = String::new();
        let pending = parameters_by_kernel.values().map(|(_, d)| d.len()).sum::<usize>()
            + symbols_to_add.len()
            + routine.packed_symbols_by_callee.len();
        if pending > 0 {
            self.marker(&mut text, "auto emul symbols :");
        }

        for mut symbol in symbols_to_add.into_iter().filter(|s| used.contains(&s.name)) {
            if symbol.declaration_type == DeclarationType::FrameworkArray {
                let count = compacted.iter().filter(|s| used.contains(&s.name)).count();
                symbol.domains = vec![Domain::new("hfauto", &count.to_string())];
            }
            let purge: &[&str] = if symbol.is_compacted {
                &ADDED_SYMBOL_PURGE
            } else {
                &ADDED_ARGUMENT_PURGE
            };
            let line = symbol.declaration_line(purge)?;
            let rendered = implementation.adjust_declaration_for_device(
                &line,
                &mut [&mut symbol],
                Some(&used_in_kernels),
                region_type,
                position,
            )?;
            text.push_str(&format!(
                "{} ! type {} symbol added for this subroutine\n",
                rendered.trim_end(),
                symbol.declaration_type.code()
            ));
        }

        for callee_name in routine.callee_names() {
            let adjusted = routine
                .adjusted_callee_names
                .get(&callee_name)
                .cloned()
                .unwrap_or(callee_name);
            let callee = match self.callees.get(&adjusted) {
                Some(c) => c,
                None => continue,
            };
            let callee_impl = match &callee.implementation {
                Some(i) => Rc::clone(i),
                None => continue,
            };
            let (imports, declarations) = parameters_by_kernel.get(&callee.name).cloned().unwrap_or_default();
            let import_names: BTreeMap<&str, &Symbol> = imports.iter().map(|s| (s.name.as_str(), s)).collect();
            for mut symbol in routine.filter_out_symbols_already_alive(&declarations) {
                if !matches!(
                    symbol.declaration_type,
                    DeclarationType::LocalArray | DeclarationType::LocalScalar
                ) || !used.contains(&symbol.name)
                    || declared.contains(&symbol.host_name())
                {
                    continue;
                }
                for domain in &mut symbol.domains {
                    if let Some(size_symbol) = import_names.get(domain.size.as_str()) {
                        domain.size = size_symbol.name_in_scope(true);
                    }
                }
                let line = symbol.declaration_line(&ADDED_SYMBOL_PURGE)?;
                let rendered = callee_impl.adjust_declaration_for_device(
                    &line,
                    &mut [&mut symbol],
                    Some(&used_in_kernels),
                    region_type,
                    position,
                )?;
                text.push_str(&format!(
                    "{} ! type {} symbol added for callee {}\n",
                    rendered.trim_end(),
                    symbol.declaration_type.code(),
                    callee.name
                ));
            }

            let packed = routine
                .packed_symbols_by_callee
                .get(&callee.name)
                .map(|list| list.iter().filter(|s| callee.used_symbol_names.contains(&s.name)).count())
                .unwrap_or(0);
            if packed == 0 {
                continue;
            }
            let prefix = compaction_prefixes.get(&callee.name).ok_or_else(|| {
                GenError::internal(
                    codes::MISSING_CONTEXT,
                    format!("no compaction declaration prefix for callee {}", callee.name),
                )
            })?;
            let mut array = Symbol {
                declaration_type: DeclarationType::FrameworkArray,
                declaration_prefix: Some(prefix.clone()),
                domains: vec![Domain::new("hfauto", &packed.to_string())],
                is_on_device: true,
                is_present: true,
                ..Symbol::new(&commons::framework_array_name(&callee.name), prefix)
            };
            let line = array.declaration_line(&[])?;
            let rendered = callee_impl.adjust_declaration_for_device(
                &line,
                &mut [&mut array],
                Some(&used_in_kernels),
                region_type,
                position,
            )?;
            text.push_str(&format!(
                "{} ! compaction array added for callee {}\n",
                rendered.trim_end(),
                callee.name
            ));
        }
        Ok(text)
    }

    // ── Exit points ──

    fn render_early_exit(&mut self, routine: &mut Routine, id: RegionId) -> GenResult<String> {
        let mut text = self.exit_point(routine, false)?;
        text.push_str(&self.render_plain(routine, id, true)?);
        Ok(self.sanitize(&text, "RoutineEarlyExitRegion", false))
    }

    fn exit_point(&mut self, routine: &mut Routine, is_subroutine_end: bool) -> GenResult<String> {
        let implementation = Rc::clone(&routine.implementation);
        let used = routine.used_symbol_names();
        let is_kernel_caller = routine.node.is_kernel_caller();
        let mut symbols: Vec<&mut Symbol> = routine.symbols.values_mut().filter(|s| used.contains(&s.name)).collect();
        implementation.subroutine_exit_point(&mut self.session, &mut symbols, is_kernel_caller, is_subroutine_end)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn not_in_scope(name: &str, routine: &str) -> GenError {
    GenError::internal(
        codes::SYMBOL_NOT_IN_SCOPE,
        format!("symbol {} is not known in {}", name, routine),
    )
}

fn mentions(text: &str, name: &str) -> bool {
    lexer::identifier_spans(text)
        .iter()
        .any(|span| text[span.start..span.end].eq_ignore_ascii_case(name))
}

/// The statements of a plain region with symbol accesses rewritten, joined by newlines.
fn implemented_lines(routine: &Routine, id: RegionId) -> GenResult<String> {
    let region = routine.arena.get(id)?;
    let implementation = &routine.implementation;
    let iterators = routine
        .arena
        .enclosing_template(id)?
        .map(|t| implementation.iterators(t))
        .unwrap_or_default();
    let ctx = AccessContext {
        iterators: &iterators,
        use_device: implementation.caps().on_device,
        in_kernel: routine.position() == RegionPosition::Within && !iterators.is_empty(),
    };
    let mut lines = Vec::with_capacity(region.lines.len());
    for line in &region.lines {
        let mut text = implement_statement(routine, line, &ctx)?;
        if ctx.in_kernel && is_loop_statement(&line.text) {
            let preparation = implementation.loop_preparation();
            if !preparation.is_empty() {
                text = format!("{}\n{}", preparation, text);
            }
        }
        lines.push(text);
    }
    Ok(lines.join("\n"))
}

fn implement_statement(routine: &Routine, line: &Line, ctx: &AccessContext<'_>) -> GenResult<String> {
    if line.symbols.is_empty() {
        return Ok(line.text.clone());
    }
    let mut symbols = Vec::with_capacity(line.symbols.len());
    for name in &line.symbols {
        symbols.push(routine.symbol(name).ok_or_else(|| not_in_scope(name, &routine.name))?);
    }
    implement_line(&line.text, &symbols, ctx, false).map_err(|e| e.with_context(format!("In line: {}", line.text)))
}

fn is_loop_statement(text: &str) -> bool {
    lexer::leading_identifier(text).map_or(false, |w| w.eq_ignore_ascii_case("do"))
}

/// Packing of scalars into the callee's framework array before the call.
fn compaction_assignments(routine: &Routine, callee: &Callee) -> String {
    let packed = match routine.packed_symbols_by_callee.get(&callee.name) {
        Some(p) => p,
        None => return String::new(),
    };
    let mut used: Vec<Symbol> = packed
        .iter()
        .filter(|s| callee.used_symbol_names.contains(&s.name))
        .cloned()
        .collect();
    sort_symbols(&mut used);
    let array = commons::framework_array_name(&callee.name);
    used.iter()
        .enumerate()
        .map(|(idx, symbol)| {
            format!(
                "{}({}) = {} ! type {} symbol compaction for callee {}\n",
                array,
                idx + 1,
                symbol.name_in_scope(true),
                symbol.declaration_type.code(),
                callee.name
            )
        })
        .collect()
}

/// Specification lines sorted into the buckets they are re-emitted from.
struct SpecificationBuckets {
    keywords: String,
    before: String,
    after: String,
    /// Symbols declared by annotated lines, in order of declaration.
    declared: Vec<String>,
}

fn classify_specification_lines(
    routine: &Routine,
    lines: &[Line],
    ctx: &SpecificationContext,
) -> GenResult<SpecificationBuckets> {
    let to_add: BTreeSet<String> = ctx
        .symbols_to_add
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|s| s.host_name())
        .collect();
    let mut buckets = SpecificationBuckets {
        keywords: String::new(),
        before: String::new(),
        after: String::new(),
        declared: Vec::new(),
    };
    let mut imports_found = false;
    for line in lines {
        if line.symbols.is_empty() {
            if parser::parse_use(&line.text).is_some() {
                imports_found = true;
            } else if !imports_found {
                buckets.keywords.push_str(line.text.trim());
                buckets.keywords.push('\n');
            } else if buckets.declared.is_empty() {
                buckets.before.push_str(line.text.trim());
                buckets.before.push('\n');
            } else {
                buckets.after.push_str(line.text.trim());
                buckets.after.push('\n');
            }
            continue;
        }
        let statement = parser::parse_statement(&line.text)?;
        for name in &line.symbols {
            if to_add.contains(name) || routine.symbols.get(name).map_or(false, |s| s.is_compacted) {
                continue;
            }
            match &statement {
                SpecStatement::Declaration(decl) if decl.declares(name) => {
                    if !buckets.declared.contains(name) {
                        buckets.declared.push(name.clone());
                    }
                }
                // extents and initializers may name other symbols
                SpecStatement::Declaration(_) if mentions(&line.text, name) => {}
                SpecStatement::Use(stmt) if stmt.imports(name) => imports_found = true,
                _ => {
                    return Err(GenError::internal(
                        codes::UNMATCHED_SPECIFICATION,
                        format!(
                            "symbol {} expected to be referenced in line '{}', but all matchings have failed",
                            name, line.text
                        ),
                    ))
                }
            }
        }
    }
    Ok(buckets)
}

// ── Module scope ────────────────────────────────────────────────────────────

/// Module specification part: declarations adjusted for the device, other
/// specification statements passed through the strategy.
pub fn render_module_specification(
    implementation: &dyn Implementation,
    lines: &[Line],
    symbols: &mut BTreeMap<String, Symbol>,
) -> GenResult<String> {
    let mut text = String::new();
    for line in lines {
        if line.symbols.is_empty() {
            let rendered = implementation.adjust_specification_for_device(&line.text, &line.text);
            if !rendered.trim().is_empty() {
                text.push_str(rendered.trim());
                text.push('\n');
            }
            continue;
        }
        let declaration = match parser::parse_statement(&line.text)? {
            SpecStatement::Declaration(decl) => decl,
            SpecStatement::Use(_) => {
                text.push_str(line.text.trim());
                text.push('\n');
                continue;
            }
        };
        let mut declared: Vec<Symbol> = Vec::new();
        for name in line.symbols.iter().filter(|n| declaration.declares(n)) {
            let mut symbol = symbols.get(name).cloned().ok_or_else(|| not_in_scope(name, "module scope"))?;
            implementation.update_symbol_device_state(
                &mut symbol,
                None,
                RegionType::ModuleDeclaration,
                RegionPosition::None,
                false,
            );
            declared.push(symbol);
        }
        if declared.is_empty() {
            text.push_str(line.text.trim());
            text.push('\n');
            continue;
        }
        let rendered = {
            let mut refs: Vec<&mut Symbol> = declared.iter_mut().collect();
            implementation
                .adjust_declaration_for_device(
                    &line.text,
                    &mut refs,
                    None,
                    RegionType::ModuleDeclaration,
                    RegionPosition::None,
                )
                .map_err(|e| e.with_context(format!("In module line: {}", line.text)))?
        };
        text.push_str(&rendered);
        for symbol in declared {
            symbols.insert(symbol.name.clone(), symbol);
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptionFlags;
    use crate::region::CallSite;
    use crate::strategy::cuda::CudaImplementation;
    use crate::strategy::host::{HostFlavor, HostImplementation};
    use crate::template::LoopDomain;

    fn host() -> Rc<dyn Implementation> {
        Rc::new(HostImplementation::new(HostFlavor::Sequential, OptionFlags::default()))
    }

    fn load_context(routine: &mut Routine) {
        let ctx = routine.specification_context_mut().unwrap();
        ctx.additional_parameters_by_kernel = Some(BTreeMap::new());
        ctx.symbols_to_add = Some(Vec::new());
        ctx.compaction_prefix_by_callee = Some(BTreeMap::new());
        ctx.compacted_parameters = Some(Vec::new());
        ctx.all_imports = Some(Vec::new());
    }

    /// `subroutine r(a)` incrementing `a` over `i=1..10`.
    fn incrementing_routine(implementation: Rc<dyn Implementation>) -> Routine {
        let mut r = Routine::new("r", "m", implementation);
        r.programmer_arguments = vec!["a".to_string()];
        r.add_symbol(Symbol::array("a", "real(8)", &[("i", "10")]));
        r.node.set_position(RegionPosition::Within);
        let spec = r.add_region(RegionKind::Specification(Box::default()));
        r.arena.load_line(spec, "implicit none", &[]).unwrap();
        r.arena
            .load_line(spec, "real(8), intent(inout) :: a(10)", &["a"])
            .unwrap();
        let template = ParallelTemplate::new("t", vec![LoopDomain::with_bounds("i", "1", "10")]);
        let p = r.add_parallel_region();
        r.arena.load_template(p, template.clone()).unwrap();
        r.arena.load_line(p, "a = a + 1", &["a"]).unwrap();
        r.parallel_templates = vec![template];
        r.load_declarations().unwrap();
        load_context(&mut r);
        r
    }

    #[test]
    fn sequential_host_routine() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = incrementing_routine(host());
        let text = ctx.render_routine(&mut r).unwrap();
        assert_eq!(
            text,
            "subroutine r(a)\n\
             implicit none\n\
             real(8), intent(inout) :: a(10)\n\
             !<----- impl. specific decl end : --\n\
             integer(4) :: i\n\
             do i=1,10\n\
             a(i) = a(i) + 1\n\
             end do\n\
             end subroutine r\n"
        );
        assert!(!ctx.session.is_in_flight());
    }

    #[test]
    fn region_markers_wrap_regions() {
        let callees = CalleeIndex::new();
        let options = GenOptions {
            region_markers: true,
            ..GenOptions::default()
        };
        let mut ctx = RenderContext::new(&callees, options);
        let mut r = incrementing_routine(host());
        let text = ctx.render_routine(&mut r).unwrap();
        assert!(text.contains("!<--- ParallelRegion\ndo i=1,10\n!<--- Region\na(i) = a(i) + 1\n!--->\nend do\n!--->\n"));
        assert!(text.contains("!<----- declarations: --\n"));
    }

    #[test]
    fn unloaded_context_is_internal_error() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = incrementing_routine(host());
        r.specification_context_mut().unwrap().symbols_to_add = None;
        let e = ctx.render_routine(&mut r).unwrap_err();
        assert_eq!(e.code, codes::MISSING_CONTEXT);
        assert!(!ctx.session.is_in_flight());
    }

    #[test]
    fn parallel_region_without_template_fails_in_kernel_routine() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = Routine::new("r", "m", host());
        r.node.set_position(RegionPosition::Within);
        r.add_symbol(Symbol::array("a", "real(8)", &[("i", "10")]));
        let p = r.add_parallel_region();
        r.arena.load_line(p, "a = 0", &["a"]).unwrap();
        ctx.session.begin(&r.node, "m").unwrap();
        let e = ctx.render_region(&mut r, p).unwrap_err();
        assert_eq!(e.code, codes::MISSING_TEMPLATE);
    }

    #[test]
    fn unused_symbols_are_not_declared() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = incrementing_routine(host());
        r.add_symbol(Symbol::new("spare", "integer(4)"));
        let spec = r.specification_region().unwrap();
        r.arena.load_line(spec, "integer(4) :: spare", &["spare"]).unwrap();
        r.load_declarations().unwrap();
        let text = ctx.render_routine(&mut r).unwrap();
        assert!(!text.contains("spare"));
    }

    #[test]
    fn call_without_callee_is_internal_error() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = Routine::new("r", "m", host());
        let c = r.add_region(RegionKind::Call {
            call: None,
            passed_in: Vec::new(),
        });
        let e = ctx.render_region(&mut r, c).unwrap_err();
        assert_eq!(e.code, codes::MISSING_CALLEE);
    }

    #[test]
    fn external_call_passes_arguments_through() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = Routine::new("r", "m", host());
        r.add_symbol(Symbol::array("a", "real(8)", &[("i", "10")]));
        let c = r.add_region(RegionKind::Call {
            call: Some(CallSite::new("mpi_barrier", &["comm", "ierr"])),
            passed_in: Vec::new(),
        });
        assert_eq!(ctx.render_region(&mut r, c).unwrap(), "call mpi_barrier(comm, ierr)\n");
    }

    #[test]
    fn kernel_launch_with_forwarded_arguments() {
        let cuda: Rc<dyn Implementation> = Rc::new(CudaImplementation::new(OptionFlags {
            keep_gpu_cache_settings: true,
            ..OptionFlags::default()
        }));
        let mut kernel = Routine::new("r_hfk0", "m", Rc::clone(&cuda));
        kernel.node.set_position(RegionPosition::Within);
        kernel.programmer_arguments = vec!["a".to_string()];
        kernel.parallel_templates = vec![ParallelTemplate::new("t", vec![LoopDomain::new("i", "n")])];
        let mut tmp = Symbol::array("tmp", "real(8)", &[("i", "n")]);
        tmp.is_present = true;
        tmp.is_on_device = true;
        kernel.additional_argument_symbols = vec![tmp.clone()];
        let p = kernel.add_parallel_region();
        kernel.arena.load_line(p, "tmp = a", &["tmp", "a"]).unwrap();
        let mut callees = CalleeIndex::new();
        callees.insert("r_hfk0", Callee::from_routine(&kernel));

        let mut wrapper = Routine::new("r_hfdev", "m", cuda);
        wrapper.node.set_position(RegionPosition::Inside);
        wrapper.node.set_attribute("isKernelCaller", "yes");
        let mut a = Symbol::array("a", "real(8)", &[("i", "n")]);
        a.is_using_device_postfix = true;
        a.is_on_device = true;
        wrapper.add_symbol(a);
        wrapper.add_symbol(Symbol {
            is_on_device: true,
            ..tmp
        });
        let call = wrapper.load_call(&kernel);
        wrapper.regions.push(call);

        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        ctx.session.begin(&wrapper.node, "m").unwrap();
        let text = ctx.render_region(&mut wrapper, call).unwrap();
        assert!(text.starts_with("cugridSizeX = ceiling(real(n) / real(CUDA_BLOCKSIZE_X))\n"));
        assert!(text.contains("\ncall r_hfk0 <<< cugrid, cublock >>>( &\ntmp, &\n&a_d)\n"));
        assert!(text.contains("'CUDA error in kernel r_hfk0:'"));
        assert!(ctx.session.pending_kernel_template.is_none());
    }

    #[test]
    fn compaction_is_packed_before_the_call() {
        let mut callee = Routine::new("k", "m", host());
        let p = callee.add_parallel_region();
        callee.arena.load_line(p, "x = dt", &["x", "dt"]).unwrap();
        let mut callees = CalleeIndex::new();
        callees.insert("k", Callee::from_routine(&callee));

        let mut caller = Routine::new("r", "m", host());
        caller.add_symbol(Symbol::new("dt", "real(8)"));
        caller
            .packed_symbols_by_callee
            .insert("k".to_string(), vec![Symbol::new("dt", "real(8)"), Symbol::new("unused", "real(8)")]);
        let c = caller.add_region(RegionKind::Call {
            call: Some(CallSite::new("k", &[])),
            passed_in: Vec::new(),
        });
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let text = ctx.render_region(&mut caller, c).unwrap();
        assert_eq!(
            text,
            "hfauto_k(1) = dt ! type 9 symbol compaction for callee k\ncall k()\n"
        );
    }

    #[test]
    fn early_exit_runs_exit_point_before_own_lines() {
        let callees = CalleeIndex::new();
        let options = GenOptions {
            region_markers: true,
            ..GenOptions::default()
        };
        let mut ctx = RenderContext::new(&callees, options);
        let mut r = Routine::new("r", "m", host());
        let e = r.add_region(RegionKind::EarlyExit);
        r.arena.load_line(e, "return", &[]).unwrap();
        ctx.session.begin(&r.node, "m").unwrap();
        let text = ctx.render_region(&mut r, e).unwrap();
        assert_eq!(text, "!<--- RoutineEarlyExitRegion\nreturn\n!--->\n");
        assert!(ctx.session.is_in_flight());
    }

    #[test]
    fn statements_before_the_first_import_stay_ahead_of_declarations() {
        let callees = CalleeIndex::new();
        let mut ctx = RenderContext::new(&callees, GenOptions::default());
        let mut r = incrementing_routine(host());
        let spec = r.specification_region().unwrap();
        r.arena.load_line(spec, "integer, parameter :: width = 4", &[]).unwrap();
        r.specification_context_mut().unwrap().all_imports = Some(vec![crate::region::ImportEntry {
            module: "kinds".to_string(),
            name_in_scope: Some("rk".to_string()),
            source_name: None,
        }]);
        ctx.session.begin(&r.node, "m").unwrap();
        let text = ctx.render_region(&mut r, spec).unwrap();
        assert!(text.starts_with(
            "use kinds, only: rk\nimplicit none\ninteger, parameter :: width = 4\nreal(8), intent(inout) :: a(10)\n"
        ));
    }

    #[test]
    fn module_specification_declares_device_shadows() {
        let cuda = CudaImplementation::new(OptionFlags::default());
        let mut symbols = BTreeMap::new();
        let mut field = Symbol::array("field", "real(8)", &[("i", "nx")]);
        field.declaration_type = DeclarationType::ModuleArray;
        field.is_to_be_transfered = true;
        symbols.insert("field".to_string(), field);
        let lines = vec![
            Line {
                text: "private".to_string(),
                symbols: vec![],
            },
            Line {
                text: "real(8) :: field(nx)".to_string(),
                symbols: vec!["field".to_string()],
            },
        ];
        let text = render_module_specification(&cuda, &lines, &mut symbols).unwrap();
        assert!(!text.contains("private"));
        assert!(text.contains("real(8) :: field(nx)\n"));
        assert!(text.contains("real(8), allocatable, device :: field_d(:)\n"));
    }
}
