// cuda.rs — Explicit-memory device strategy
//
// Every routine that contains a parallel region is split: one kernel per
// parallel region, a device-side wrapper that launches the kernels, and a
// host duplicate under the original name. Device arrays are allocated,
// copied and released explicitly around kernel launches.
//
// Preconditions: templates have one to three dimensions.
// Postconditions: `generate_routines` returns the wrapper first, then the
//   host duplicate, then the kernels in region order.
// Failure modes: unsupported dimensionality, imports into device routines,
//   malformed call arguments (usage errors); kernels of foreign modules,
//   regions without template (internal errors).
// Side effects: residency flags; pending launch template in the session.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::debug;

use super::host::{base_exit_point, base_kernel_call_post, HostImplementation};
use super::openacc::check_dimensionality;
use super::{
    commons, device_data, require_symbols, Capabilities, ImportSource, Implementation, KernelParameters, RegionType,
    RenderSession, CUDA_CAPABILITIES,
};
use crate::config::OptionFlags;
use crate::diag::{codes, GenError, GenResult};
use crate::lexer;
use crate::region::RegionKind;
use crate::routine::{Callee, ModuleIndex, RegionPosition, Routine, RoutineNode};
use crate::symbol::{sort_symbols, DeclarationType, Symbol};
use crate::template::{iterator_declaration, ParallelTemplate, VECTOR_SIZE_PP_NAMES};

const TARGETS: &[&str] = &["GPU"];
const THREAD_DIMS: [&str; 3] = ["x", "y", "z"];
const GRID_SIZE_NAMES: [&str; 3] = ["cugridSizeX", "cugridSizeY", "cugridSizeZ"];

#[derive(Debug, Clone)]
pub struct CudaImplementation {
    flags: OptionFlags,
}

impl CudaImplementation {
    pub fn new(flags: OptionFlags) -> Self {
        CudaImplementation { flags }
    }

    fn host_duplicate(&self, routine: &Routine) -> Routine {
        let mut host = routine.clone_with_name(&commons::synthesized_host_routine_name(&routine.name));
        host.implementation = Rc::new(HostImplementation::for_device_routine_duplicate(self.flags));
        host
    }
}

/// Global thread index per dimension, offset by the loop start.
pub(crate) fn iterator_definitions(template: &ParallelTemplate) -> GenResult<String> {
    check_dimensionality(template)?;
    let mut result = String::new();
    for (domain, dim) in template.domains.iter().zip(THREAD_DIMS) {
        result.push_str(&format!(
            "{i} = (blockidx%{d} - 1) * blockDim%{d} + threadidx%{d} + {start} - 1\n",
            i = domain.name,
            d = dim,
            start = domain.starts_at()
        ));
    }
    Ok(result)
}

/// Early return for threads outside the iteration space.
pub(crate) fn bounds_guard(template: &ParallelTemplate) -> String {
    let conditions: Vec<String> = template
        .domains
        .iter()
        .map(|d| format!("{} .GT. {}", d.name, d.ends_at()))
        .collect();
    format!("if ({}) then\nreturn\nend if\n", conditions.join(" .OR. "))
}

/// Grid and block dimensions for launching a kernel over `template`.
fn launch_configuration(template: &ParallelTemplate) -> GenResult<String> {
    check_dimensionality(template)?;
    let mut sizes: Vec<String> = Vec::with_capacity(3);
    let mut block: Vec<&str> = Vec::with_capacity(3);
    for (i, grid_name) in GRID_SIZE_NAMES.iter().enumerate() {
        match template.domains.get(i) {
            Some(domain) => {
                sizes.push(format!(
                    "{} = ceiling(real({}) / real({}))",
                    grid_name,
                    domain.extent(),
                    VECTOR_SIZE_PP_NAMES[i]
                ));
                block.push(VECTOR_SIZE_PP_NAMES[i]);
            }
            None => {
                sizes.push(format!("{} = 1", grid_name));
                block.push("1");
            }
        }
    }
    Ok(format!(
        "{}\ncugrid = dim3({})\ncublock = dim3({})\n",
        sizes.join("\n"),
        GRID_SIZE_NAMES.join(", "),
        block.join(", ")
    ))
}

fn cache_configuration(kernel: &str) -> String {
    format!(
        "cuerror = cudaFuncSetCacheConfig({k}, cudaFuncCachePreferL1)\n\
         cuerror = cudaGetLastError()\n\
         if(cuerror .NE. cudaSuccess) then\n\
         \twrite(0, *) 'CUDA error when setting cache configuration for kernel {k}:', cudaGetErrorString(cuerror)\n\
         \tstop 1\n\
         end if\n",
        k = kernel
    )
}

// ── Additional kernel parameters ────────────────────────────────────────────

/// Classification of the symbols of one scope around a kernel.
struct ScopeClassification<'r> {
    caller: &'r Routine,
    callee: &'r Callee,
    argument_names: &'r [&'r str],
    caller_kernel_names: BTreeSet<String>,
}

impl ScopeClassification<'_> {
    fn classify(&self, scope: &BTreeMap<String, Symbol>, dummy_names: &[String]) -> KernelParameters {
        let mut parameters = KernelParameters::default();
        for (name, scope_symbol) in scope {
            if self.argument_names.iter().any(|a| a.eq_ignore_ascii_case(name)) {
                continue;
            }
            let symbol = match self.caller.symbol(name) {
                Some(s) => s.clone(),
                None => {
                    debug!(
                        symbol = %name,
                        caller = %self.caller.name,
                        "symbol not known to the caller yet, taken from the kernel scope"
                    );
                    scope_symbol.clone()
                }
            };
            if symbol.is_type_parameter || dummy_names.iter().any(|d| d == name) {
                continue;
            }
            if symbol.is_host_symbol
                && !self.caller_kernel_names.contains(&symbol.name)
                && !self.callee.used_symbol_names_in_kernels.contains(&symbol.name)
            {
                continue;
            }
            let is_module_symbol = symbol.declaration_type.is_module_symbol();
            let same_module = symbol.source_module.as_deref() == Some(self.caller.module.as_str());
            if is_module_symbol && same_module {
                debug!(symbol = %symbol.name, "declaration added");
                parameters.declarations.push(symbol);
            } else if is_module_symbol || symbol.declaration_type == DeclarationType::ForeignModuleScalar {
                debug!(symbol = %symbol.name, "import added");
                parameters.imports.push(symbol);
            } else if matches!(
                symbol.declaration_type,
                DeclarationType::LocalArray | DeclarationType::LocalScalar | DeclarationType::OtherScalar
            ) {
                debug!(symbol = %symbol.name, "dummy added");
                parameters.dummies.push(symbol);
            }
        }
        parameters
    }
}

fn index_by_host_name(symbols: Vec<Symbol>) -> BTreeMap<String, Symbol> {
    symbols.into_iter().map(|s| (s.host_name(), s)).collect()
}

/// Merge what the module scope knows into `symbols`, consuming index entries.
fn merge_from_index(symbols: &mut [Symbol], index: &mut BTreeMap<String, Symbol>) {
    for symbol in symbols.iter_mut() {
        if let Some(known) = index.remove(&symbol.host_name()) {
            symbol.merge(&known);
        }
    }
}

fn finish(mut symbols: Vec<Symbol>, rest: BTreeMap<String, Symbol>) -> Vec<Symbol> {
    symbols.extend(rest.into_values());
    for symbol in &mut symbols {
        symbol.is_present = true;
    }
    sort_symbols(&mut symbols);
    symbols
}

impl Implementation for CudaImplementation {
    fn caps(&self) -> &'static Capabilities {
        &CUDA_CAPABILITIES
    }

    fn label(&self) -> String {
        "cuda".to_string()
    }

    fn template_targets(&self) -> &'static [&'static str] {
        TARGETS
    }

    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        used_in_kernel: Option<&BTreeSet<String>>,
        region_type: RegionType,
        position: RegionPosition,
        post_transfer: bool,
    ) {
        device_data::update_device_state(self.caps(), symbol, used_in_kernel, region_type, position, post_transfer);
    }

    fn generate_routines(&self, mut routine: Routine) -> GenResult<Vec<Routine>> {
        match routine.node.checked_position()? {
            RegionPosition::Outside => {
                let host = self.host_duplicate(&routine);
                routine.rename(&commons::synthesized_device_routine_name(&routine.name));
                return Ok(vec![routine, host]);
            }
            RegionPosition::Within => {}
            _ => return Ok(vec![routine]),
        }

        let host = self.host_duplicate(&routine);
        let specification = routine.specification_region();
        let mut kernels: Vec<Routine> = Vec::new();
        for (n, parallel) in routine.parallel_region_ids().into_iter().enumerate() {
            let kernel_name = commons::synthesized_kernel_name(&routine.name, n);
            let template = match &routine.arena.get(parallel)?.kind {
                RegionKind::Parallel {
                    template: Some(template),
                    ..
                } => template.clone(),
                _ => {
                    return Err(GenError::internal(
                        codes::MISSING_TEMPLATE,
                        format!("parallel region {} of {} has no template", n, routine.name),
                    ))
                }
            };
            let mut kernel = routine.create_clone_with_metadata(&kernel_name);
            if let Some(spec) = specification {
                kernel.reset_regions(&routine, spec)?;
            }
            kernel.import_region(&routine, parallel)?;
            kernel.node.set_position(RegionPosition::Within);
            kernel.parallel_templates = vec![template];
            kernels.push(kernel);
        }

        let mut wrapper_regions = Vec::with_capacity(routine.regions.len());
        let mut kernel_iter = kernels.iter();
        for id in routine.regions.clone() {
            let is_parallel = matches!(routine.arena.get(id)?.kind, RegionKind::Parallel { .. });
            if !is_parallel {
                wrapper_regions.push(id);
                continue;
            }
            let kernel = kernel_iter.next().ok_or_else(|| {
                GenError::internal(
                    codes::KERNEL_COUNTER_MISMATCH,
                    format!("more parallel regions than kernels in {}", routine.name),
                )
            })?;
            wrapper_regions.push(routine.load_call(kernel));
        }

        routine.rename(&commons::synthesized_device_routine_name(&routine.name));
        routine.node.set_position(RegionPosition::Inside);
        routine.node.set_attribute("isKernelCaller", "yes");
        routine.parallel_templates.clear();
        routine.regions = wrapper_regions;

        let mut routines = Vec::with_capacity(kernels.len() + 2);
        routines.push(routine);
        routines.push(host);
        routines.extend(kernels);
        Ok(routines)
    }

    fn warning_on_unrecognized_call(&self, caller: &str, callee: &str) -> String {
        format!(
            "subroutine {} called inside {}'s parallel region, but it is not defined in a h90 file.\n",
            callee, caller
        )
    }

    fn kernel_call_config(&self) -> String {
        "<<< cugrid, cublock >>>".to_string()
    }

    fn kernel_call_preparation(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        callee: Option<&RoutineNode>,
    ) -> GenResult<String> {
        session.pending_kernel_template = Some(template.clone());
        if !template.applies_to_any(TARGETS) {
            return Ok(String::new());
        }
        let mut result = String::new();
        if let Some(node) = callee {
            if !self.flags.keep_gpu_cache_settings {
                result.push_str(&cache_configuration(node.name()));
            }
        }
        result.push_str(&launch_configuration(template)?);
        Ok(result)
    }

    fn kernel_call_post(&self, session: &mut RenderSession, symbols: &[&Symbol], callee: &RoutineNode) -> String {
        let mut result = base_kernel_call_post(self.flags, session, symbols, callee, false);
        if callee.position() == RegionPosition::Within {
            result.push_str(&commons::cuda_error_handling(callee.name()));
        }
        result
    }

    fn subroutine_prefix(&self, node: &RoutineNode) -> GenResult<String> {
        Ok(match node.checked_position()? {
            RegionPosition::Within => "attributes(global)".to_string(),
            RegionPosition::Outside => "attributes(device)".to_string(),
            RegionPosition::None | RegionPosition::Inside => String::new(),
        })
    }

    fn import_specification(
        &self,
        source: ImportSource<'_, '_>,
        region_type: RegionType,
        position: RegionPosition,
    ) -> GenResult<String> {
        let symbols = match source {
            ImportSource::Module(module) => return Ok(commons::module_import(module)),
            ImportSource::Symbols(symbols) => symbols,
        };
        let declaration_block = matches!(
            region_type,
            RegionType::ModuleDeclaration | RegionType::KernelCallerDeclaration
        );
        for symbol in symbols.iter_mut() {
            if symbol.is_to_be_transfered || declaration_block {
                self.update_symbol_device_state(symbol, None, RegionType::Other, position, true);
            }
        }
        let first = match symbols.first() {
            Some(first) => first,
            None => return Ok(String::new()),
        };
        if first.is_type_parameter {
            return Ok(commons::import_statements(symbols, false));
        }
        match position {
            RegionPosition::Within => return Ok(String::new()),
            RegionPosition::Outside => {
                let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
                return Err(GenError::usage(
                    codes::UNSUPPORTED_IMPORT,
                    format!(
                        "importing symbols {} into a device routine (called within a kernel) is not supported; pass them as arguments instead",
                        names.join(", ")
                    ),
                ));
            }
            RegionPosition::None | RegionPosition::Inside => {}
        }
        if first.is_host_symbol {
            return Ok(commons::import_statements(symbols, true));
        }
        if first.is_present || first.is_to_be_transfered || declaration_block {
            let mut result = commons::import_statements(symbols, false);
            result.push_str(&commons::import_statements(symbols, true));
            return Ok(result);
        }
        Ok(commons::import_statements(symbols, false))
    }

    fn adjust_declaration_for_device(
        &self,
        line: &str,
        symbols: &mut [&mut Symbol],
        used_in_kernels: Option<&BTreeSet<String>>,
        region_type: RegionType,
        position: RegionPosition,
    ) -> GenResult<String> {
        device_data::adjust_declaration(self.caps(), line, symbols, used_in_kernels, region_type, position)
    }

    fn additional_kernel_parameters(
        &self,
        caller: &Routine,
        callee: &Callee,
        call_arguments: &[String],
        modules: &ModuleIndex,
    ) -> GenResult<KernelParameters> {
        if callee.position() != RegionPosition::Within || callee.parallel_templates.is_empty() {
            return Ok(KernelParameters::default());
        }
        let module = modules.get(&callee.module).ok_or_else(|| {
            GenError::internal(
                codes::MISSING_CONTEXT,
                format!(
                    "calling kernel {} directly from foreign module {} is not supported; use splitting instead",
                    callee.name, callee.module
                ),
            )
        })?;
        let mut argument_names: Vec<&str> = Vec::with_capacity(call_arguments.len());
        for argument in call_arguments {
            let name = lexer::leading_identifier(argument).ok_or_else(|| {
                GenError::usage(codes::MALFORMED_CALL_ARGUMENT, format!("illegal argument: {}", argument))
            })?;
            argument_names.push(name);
        }
        let scope = ScopeClassification {
            caller,
            callee,
            argument_names: &argument_names,
            caller_kernel_names: caller.used_symbol_names_in_kernels(),
        };

        debug!(module = %module.name, "loading additional symbols for module");
        let module_scope = scope.classify(&module.symbols, &[]);
        if let Some(first) = module_scope.dummies.first() {
            return Err(GenError::internal(
                codes::UNMATCHED_SPECIFICATION,
                format!(
                    "dummies are not supposed to be added for module scope symbols: {} ({:?})",
                    first.name, first.declaration_type
                ),
            ));
        }
        let mut module_imports = index_by_host_name(module_scope.imports);
        let mut module_declarations = index_by_host_name(module_scope.declarations);

        debug!(routine = %callee.name, "loading additional symbols for routine");
        let mut routine_scope = scope.classify(&callee.symbols, &callee.programmer_arguments);
        merge_from_index(&mut routine_scope.imports, &mut module_imports);
        merge_from_index(&mut routine_scope.declarations, &mut module_declarations);
        merge_from_index(&mut routine_scope.dummies, &mut module_imports);
        merge_from_index(&mut routine_scope.dummies, &mut module_declarations);

        Ok(KernelParameters {
            imports: finish(routine_scope.imports, module_imports),
            declarations: finish(routine_scope.declarations, module_declarations),
            dummies: finish(routine_scope.dummies, BTreeMap::new()),
        })
    }

    fn subroutine_exit_point(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        is_subroutine_end: bool,
    ) -> GenResult<String> {
        let mut result = device_data::exit_point(symbols, is_kernel_caller);
        result.push_str(&base_exit_point(self.flags, session, is_subroutine_end));
        Ok(result)
    }

    fn begin_parallel_region(
        &self,
        _session: &mut RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String> {
        require_symbols(symbols)?;
        let mut result = iterator_definitions(template)?;
        result.push_str(&bounds_guard(template));
        Ok(result)
    }

    fn end_parallel_region(
        &self,
        _session: &mut RenderSession,
        _template: &ParallelTemplate,
        _routine: &Routine,
    ) -> GenResult<String> {
        Ok(String::new())
    }

    fn declaration_end(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        _node: &RoutineNode,
        templates: &[ParallelTemplate],
    ) -> GenResult<String> {
        session.parallel_templates = templates.to_vec();
        let mut result = String::new();
        if self.flags.debug_print {
            result.push_str("real(8) :: hf_output_temp\n");
        }
        result.push_str(&iterator_declaration(templates, TARGETS));
        if is_kernel_caller {
            result.push_str("type(dim3) :: cugrid, cublock\n");
            result.push_str("integer(4) :: cugridSizeX, cugridSizeY, cugridSizeZ, cuerror, cuErrorMemcopy\n");
        }
        result.push_str(&device_data::declaration_end(session, symbols, is_kernel_caller)?);
        Ok(result)
    }

    fn additional_includes(&self) -> String {
        "use cudafor\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::ModuleInfo;
    use crate::template::LoopDomain;

    fn cuda() -> CudaImplementation {
        CudaImplementation::new(OptionFlags::default())
    }

    fn template_ij() -> ParallelTemplate {
        ParallelTemplate::new(
            "t",
            vec![LoopDomain::new("i", "nx"), LoopDomain::with_bounds("j", "2", "ny")],
        )
    }

    /// `diffuse` with one specification region, two parallel regions and a
    /// plain region between them.
    fn within_routine() -> Routine {
        let mut r = Routine::new("diffuse", "m", Rc::new(cuda()));
        r.node.set_position(RegionPosition::Within);
        r.programmer_arguments = vec!["a".to_string()];
        r.add_symbol(Symbol::array("a", "real(8)", &[("i", "nx"), ("j", "ny")]));
        let spec = r.add_region(RegionKind::Specification(Box::default()));
        r.arena.load_line(spec, "real(8), intent(inout) :: a(nx,ny)", &["a"]).unwrap();
        for (n, text) in ["a = 0", "a = a + 1"].iter().enumerate() {
            let p = r.add_parallel_region();
            r.arena.load_template(p, template_ij()).unwrap();
            r.arena.load_line(p, text, &["a"]).unwrap();
            if n == 0 {
                let plain = r.add_region(RegionKind::Plain);
                r.arena.load_line(plain, "continue", &[]).unwrap();
            }
        }
        r
    }

    #[test]
    fn within_routine_is_split_into_wrapper_host_and_kernels() {
        let routines = cuda().generate_routines(within_routine()).unwrap();
        let names: Vec<&str> = routines.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["diffuse_hfdev", "diffuse", "diffuse_hfk0", "diffuse_hfk1"]);

        let wrapper = &routines[0];
        assert_eq!(wrapper.position(), RegionPosition::Inside);
        assert!(wrapper.is_calling_kernel());
        assert!(wrapper.parallel_templates.is_empty());
        assert_eq!(wrapper.callee_names(), vec!["diffuse_hfk0", "diffuse_hfk1"]);
        assert!(wrapper.parallel_region_ids().is_empty());

        let host = &routines[1];
        assert_eq!(host.implementation.label(), "cpu");
        assert_eq!(host.parallel_region_ids().len(), 2);

        for kernel in &routines[2..] {
            assert_eq!(kernel.position(), RegionPosition::Within);
            assert_eq!(kernel.parallel_templates.len(), 1);
            assert_eq!(kernel.regions.len(), 2);
            assert!(kernel.specification_region().is_some());
        }
    }

    #[test]
    fn outside_routine_gets_device_and_host_versions() {
        let mut r = Routine::new("helper", "m", Rc::new(cuda()));
        r.node.set_position(RegionPosition::Outside);
        let routines = cuda().generate_routines(r).unwrap();
        let names: Vec<&str> = routines.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["helper_hfdev", "helper"]);
    }

    #[test]
    fn unrelated_routine_is_kept() {
        let r = Routine::new("setup", "m", Rc::new(cuda()));
        assert_eq!(cuda().generate_routines(r).unwrap().len(), 1);
    }

    #[test]
    fn kernel_begin_derives_indices_and_guards_bounds() {
        let a = Symbol::array("a", "real(8)", &[("i", "nx"), ("j", "ny")]);
        let text = cuda()
            .begin_parallel_region(&mut RenderSession::new(), &[&a], &template_ij())
            .unwrap();
        assert_eq!(
            text,
            "i = (blockidx%x - 1) * blockDim%x + threadidx%x + 1 - 1\n\
             j = (blockidx%y - 1) * blockDim%y + threadidx%y + 2 - 1\n\
             if (i .GT. nx .OR. j .GT. ny) then\nreturn\nend if\n"
        );
    }

    #[test]
    fn launch_preparation_computes_grid() {
        let flags = OptionFlags {
            keep_gpu_cache_settings: true,
            ..OptionFlags::default()
        };
        let mut session = RenderSession::new();
        let text = CudaImplementation::new(flags)
            .kernel_call_preparation(&mut session, &template_ij(), Some(&RoutineNode::new("k", "m")))
            .unwrap();
        assert_eq!(
            text,
            "cugridSizeX = ceiling(real(nx) / real(CUDA_BLOCKSIZE_X))\n\
             cugridSizeY = ceiling(real(ny - 2 + 1) / real(CUDA_BLOCKSIZE_Y))\n\
             cugridSizeZ = 1\n\
             cugrid = dim3(cugridSizeX, cugridSizeY, cugridSizeZ)\n\
             cublock = dim3(CUDA_BLOCKSIZE_X, CUDA_BLOCKSIZE_Y, 1)\n"
        );
        assert_eq!(session.pending_kernel_template, Some(template_ij()));
    }

    #[test]
    fn launch_preparation_sets_cache_configuration() {
        let text = cuda()
            .kernel_call_preparation(&mut RenderSession::new(), &template_ij(), Some(&RoutineNode::new("k", "m")))
            .unwrap();
        assert!(text.starts_with("cuerror = cudaFuncSetCacheConfig(k, cudaFuncCachePreferL1)\n"));
    }

    #[test]
    fn cpu_only_template_prepares_nothing() {
        let mut t = template_ij();
        t.applies_to = vec!["CPU".to_string()];
        let text = cuda()
            .kernel_call_preparation(&mut RenderSession::new(), &t, None)
            .unwrap();
        assert_eq!(text, "");
    }

    #[test]
    fn kernel_post_checks_errors() {
        let mut node = RoutineNode::new("diffuse_hfk0", "m");
        node.set_position(RegionPosition::Within);
        let text = cuda().kernel_call_post(&mut RenderSession::new(), &[], &node);
        assert!(text.starts_with("cuerror = cudaDeviceSynchronize()\n"));
        assert!(text.contains("CUDA error in kernel diffuse_hfk0"));
    }

    #[test]
    fn prefixes_by_position() {
        let mut node = RoutineNode::new("k", "m");
        node.set_position(RegionPosition::Within);
        assert_eq!(cuda().subroutine_prefix(&node).unwrap(), "attributes(global)");
        node.set_position(RegionPosition::Outside);
        assert_eq!(cuda().subroutine_prefix(&node).unwrap(), "attributes(device)");
        node.set_position(RegionPosition::Inside);
        assert_eq!(cuda().subroutine_prefix(&node).unwrap(), "");
        node.set_attribute("parallelRegionPosition", "sideways");
        assert!(cuda().subroutine_prefix(&node).unwrap_err().is_usage());
    }

    #[test]
    fn imports_into_device_routines() {
        let mut s = Symbol::array("grid", "real(8)", &[("i", "nx")]);
        s.source_module = Some("data".to_string());
        s.declaration_type = DeclarationType::ModuleArray;
        let mut outside = s.clone();
        let mut list = [&mut outside];
        let e = cuda()
            .import_specification(
                ImportSource::Symbols(&mut list),
                RegionType::Other,
                RegionPosition::Outside,
            )
            .unwrap_err();
        assert_eq!(e.code, codes::UNSUPPORTED_IMPORT);

        let mut within = s.clone();
        let mut list = [&mut within];
        let within = cuda()
            .import_specification(ImportSource::Symbols(&mut list), RegionType::Other, RegionPosition::Within)
            .unwrap();
        assert_eq!(within, "");

        let mut list = [&mut s];
        let caller = cuda()
            .import_specification(
                ImportSource::Symbols(&mut list),
                RegionType::KernelCallerDeclaration,
                RegionPosition::Inside,
            )
            .unwrap();
        assert_eq!(caller, "use data, only: grid_d\nuse data, only: grid\n");
    }

    #[test]
    fn kernel_parameters_classify_module_and_routine_symbols() {
        let mut caller = Routine::new("diffuse_hfdev", "m", Rc::new(cuda()));
        caller.node.set_position(RegionPosition::Inside);

        let mut kernel = Routine::new("diffuse_hfk0", "m", Rc::new(cuda()));
        kernel.node.set_position(RegionPosition::Within);
        kernel.programmer_arguments = vec!["a".to_string()];
        kernel.parallel_templates = vec![template_ij()];
        kernel.add_symbol(Symbol::array("a", "real(8)", &[("i", "nx"), ("j", "ny")]));
        kernel.add_symbol(Symbol::array("tmp", "real(8)", &[("i", "nx"), ("j", "ny")]));
        let mut nx = Symbol::new("nx", "integer(4)");
        nx.is_type_parameter = true;
        kernel.add_symbol(nx);

        let mut field = Symbol::array("field", "real(8)", &[("i", "nx"), ("j", "ny")]);
        field.declaration_type = DeclarationType::ModuleArray;
        field.source_module = Some("m".to_string());
        let mut other = Symbol::array("coeff", "real(8)", &[("i", "nx")]);
        other.declaration_type = DeclarationType::ModuleArray;
        other.source_module = Some("physics".to_string());
        let mut module = ModuleInfo {
            name: "m".to_string(),
            ..ModuleInfo::default()
        };
        module.symbols.insert("field".to_string(), field);
        module.symbols.insert("coeff".to_string(), other);
        let modules: ModuleIndex = [("m".to_string(), module)].into_iter().collect();

        let callee = Callee::from_routine(&kernel);
        let params = cuda()
            .additional_kernel_parameters(&caller, &callee, &kernel.programmer_arguments, &modules)
            .unwrap();
        let names = |list: &[Symbol]| list.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&params.declarations), vec!["field"]);
        assert_eq!(names(&params.imports), vec!["coeff"]);
        assert_eq!(names(&params.dummies), vec!["tmp"]);
        assert!(params.dummies.iter().all(|s| s.is_present));
    }

    #[test]
    fn kernel_parameters_need_the_module() {
        let caller = Routine::new("c", "m", Rc::new(cuda()));
        let mut kernel = Routine::new("k_hfk0", "elsewhere", Rc::new(cuda()));
        kernel.node.set_position(RegionPosition::Within);
        kernel.parallel_templates = vec![template_ij()];
        let e = cuda()
            .additional_kernel_parameters(&caller, &Callee::from_routine(&kernel), &[], &ModuleIndex::new())
            .unwrap_err();
        assert_eq!(e.code, codes::MISSING_CONTEXT);

        let e = cuda()
            .additional_kernel_parameters(
                &caller,
                &Callee::from_routine(&kernel),
                &["(1)".to_string()],
                &[("elsewhere".to_string(), ModuleInfo::default())].into_iter().collect(),
            )
            .unwrap_err();
        assert_eq!(e.code, codes::MALFORMED_CALL_ARGUMENT);
    }

    #[test]
    fn non_kernels_get_no_parameters() {
        let caller = Routine::new("c", "m", Rc::new(cuda()));
        let callee = Callee::external("ext");
        let params = cuda()
            .additional_kernel_parameters(&caller, &callee, &[], &ModuleIndex::new())
            .unwrap();
        assert_eq!(params, KernelParameters::default());
    }

    #[test]
    fn kernel_caller_declares_launch_variables() {
        let text = cuda()
            .declaration_end(
                &mut RenderSession::new(),
                &mut [],
                true,
                &RoutineNode::new("r", "m"),
                &[],
            )
            .unwrap();
        assert_eq!(
            text,
            "type(dim3) :: cugrid, cublock\ninteger(4) :: cugridSizeX, cugridSizeY, cugridSizeZ, cuerror, cuErrorMemcopy\n"
        );
    }
}
