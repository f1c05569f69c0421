// strategy — Backend code-generation strategies
//
// One `Implementation` per target architecture decides how parallel loops,
// device declarations, data transfers and kernel launches are spelled. Debug
// and trace instrumentation are overlays that wrap a base strategy and add
// their own text around the wrapped output.
//
// Strategies are stateless and shared between routines. Everything that
// lives for the duration of one subroutine render is kept in `RenderSession`,
// which callers pass by exclusive reference.
//
// Preconditions: a session is begun before any session-taking operation.
// Postconditions: `subroutine_exit_point(.., true)` leaves the session reset.
// Failure modes: usage errors for annotation problems, internal errors for
//   bookkeeping inconsistencies (see `diag::codes`).
// Side effects: residency flags of the symbols passed in are updated.

pub mod commons;
pub mod cuda;
pub mod device_data;
pub mod host;
pub mod openacc;
pub mod overlay;

use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::config::{Architecture, OptionFlags, Target};
use crate::diag::{codes, GenError, GenResult};
use crate::routine::{Callee, ModuleIndex, RegionPosition, Routine, RoutineNode};
use crate::symbol::Symbol;
use crate::template::ParallelTemplate;

use self::cuda::CudaImplementation;
use self::host::{HostFlavor, HostImplementation};
use self::openacc::OpenAccImplementation;
use self::overlay::{DebugFlavor, DebugOverlay, TraceMode, TraceOverlay};

// ── Capabilities ────────────────────────────────────────────────────────────

/// How device data is managed by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryModel {
    /// No device.
    Host,
    /// Data is made present by directives outside the generated code.
    PresentData,
    /// Allocation, copies and deallocation are generated explicitly.
    ExplicitMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub architecture: &'static [&'static str],
    pub on_device: bool,
    pub splits_routines: bool,
    pub memory_model: MemoryModel,
    pub multiple_parallel_regions_per_subroutine_allowed: bool,
    pub assignment_to_scalars_in_kernels_allowed: bool,
    pub uses_duplicates_as_host_routines: bool,
    pub allows_mixed_host_and_device_code: bool,
    pub supports_native_memsets_outside_of_kernels: bool,
    pub supports_arbitrary_data_accesses_outside_of_kernels: bool,
    pub supports_native_module_imports_within_kernels: bool,
}

pub const HOST_CAPABILITIES: Capabilities = Capabilities {
    architecture: &["cpu", "host"],
    on_device: false,
    splits_routines: false,
    memory_model: MemoryModel::Host,
    multiple_parallel_regions_per_subroutine_allowed: true,
    assignment_to_scalars_in_kernels_allowed: true,
    uses_duplicates_as_host_routines: false,
    allows_mixed_host_and_device_code: true,
    supports_native_memsets_outside_of_kernels: true,
    supports_arbitrary_data_accesses_outside_of_kernels: true,
    supports_native_module_imports_within_kernels: true,
};

pub const OPENMP_CAPABILITIES: Capabilities = Capabilities {
    architecture: &["cpu", "host", "openmp"],
    ..HOST_CAPABILITIES
};

pub const OPENACC_CAPABILITIES: Capabilities = Capabilities {
    architecture: &["openacc", "gpu", "nvd", "nvidia"],
    on_device: true,
    memory_model: MemoryModel::PresentData,
    ..HOST_CAPABILITIES
};

pub const CUDA_CAPABILITIES: Capabilities = Capabilities {
    architecture: &["cuda", "gpu", "nvd", "nvidia"],
    on_device: true,
    splits_routines: true,
    memory_model: MemoryModel::ExplicitMemory,
    multiple_parallel_regions_per_subroutine_allowed: false,
    assignment_to_scalars_in_kernels_allowed: false,
    uses_duplicates_as_host_routines: true,
    allows_mixed_host_and_device_code: false,
    supports_native_memsets_outside_of_kernels: true,
    supports_arbitrary_data_accesses_outside_of_kernels: false,
    supports_native_module_imports_within_kernels: false,
};

/// Capabilities of every base variant. Overlays inherit the wrapped entry.
pub const CAPABILITY_MATRIX: [(Architecture, &Capabilities); 4] = [
    (Architecture::Cpu, &HOST_CAPABILITIES),
    (Architecture::Openmp, &OPENMP_CAPABILITIES),
    (Architecture::Openacc, &OPENACC_CAPABILITIES),
    (Architecture::Cuda, &CUDA_CAPABILITIES),
];

pub fn capabilities_of(architecture: Architecture) -> &'static Capabilities {
    match architecture {
        Architecture::Cpu => &HOST_CAPABILITIES,
        Architecture::Openmp => &OPENMP_CAPABILITIES,
        Architecture::Openacc => &OPENACC_CAPABILITIES,
        Architecture::Cuda => &CUDA_CAPABILITIES,
    }
}

// ── Dispatch table ──────────────────────────────────────────────────────────

/// Overlay stack built on top of a base variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layers {
    Base,
    Debug,
    TraceRecord,
    DebugTraceRecord,
    /// Compare against a recorded trace; always includes the debug overlay.
    DebugTraceCompare,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchEntry {
    pub architecture: Architecture,
    pub debug: bool,
    pub trace: bool,
    pub layers: Layers,
}

const fn entry(architecture: Architecture, debug: bool, trace: bool, layers: Layers) -> DispatchEntry {
    DispatchEntry {
        architecture,
        debug,
        trace,
        layers,
    }
}

/// Strategy composition keyed by (architecture, debug, trace).
pub const DISPATCH_TABLE: [DispatchEntry; 16] = [
    entry(Architecture::Cpu, false, false, Layers::Base),
    entry(Architecture::Cpu, true, false, Layers::Debug),
    entry(Architecture::Cpu, false, true, Layers::TraceRecord),
    entry(Architecture::Cpu, true, true, Layers::DebugTraceRecord),
    entry(Architecture::Openmp, false, false, Layers::Base),
    entry(Architecture::Openmp, true, false, Layers::Debug),
    entry(Architecture::Openmp, false, true, Layers::TraceRecord),
    entry(Architecture::Openmp, true, true, Layers::DebugTraceRecord),
    entry(Architecture::Openacc, false, false, Layers::Base),
    entry(Architecture::Openacc, true, false, Layers::Debug),
    entry(Architecture::Openacc, false, true, Layers::DebugTraceCompare),
    entry(Architecture::Openacc, true, true, Layers::DebugTraceCompare),
    entry(Architecture::Cuda, false, false, Layers::Base),
    entry(Architecture::Cuda, true, false, Layers::Debug),
    entry(Architecture::Cuda, false, true, Layers::Unsupported),
    entry(Architecture::Cuda, true, true, Layers::Unsupported),
];

pub fn lookup_layers(architecture: Architecture, debug: bool, trace: bool) -> Layers {
    DISPATCH_TABLE
        .iter()
        .find(|e| e.architecture == architecture && e.debug == debug && e.trace == trace)
        .map(|e| e.layers)
        .unwrap_or(Layers::Unsupported)
}

fn base_strategy(target: &Target, flags: OptionFlags) -> Box<dyn Implementation> {
    match target.architecture {
        Architecture::Cpu => Box::new(HostImplementation::new(HostFlavor::Sequential, flags)),
        Architecture::Openmp => Box::new(HostImplementation::new(HostFlavor::OpenMp, flags)),
        Architecture::Openacc => Box::new(OpenAccImplementation::new(flags)),
        Architecture::Cuda => Box::new(CudaImplementation::new(flags)),
    }
}

fn debug_flavor(target: &Target) -> DebugFlavor {
    match target.architecture {
        Architecture::Cpu | Architecture::Openmp => DebugFlavor::Host,
        Architecture::Openacc => DebugFlavor::PresentData,
        Architecture::Cuda => DebugFlavor::ExplicitMemory {
            emulated: target.emulation,
        },
    }
}

/// Build the strategy for one (target, flags) pair.
pub fn build_strategy(target: &Target, flags: OptionFlags) -> GenResult<Rc<dyn Implementation>> {
    let base = base_strategy(target, flags);
    let strategy: Box<dyn Implementation> = match lookup_layers(target.architecture, target.debug, target.trace) {
        Layers::Base => base,
        Layers::Debug => Box::new(DebugOverlay::new(base, debug_flavor(target))),
        Layers::TraceRecord => Box::new(TraceOverlay::new(base, TraceMode::Record)),
        Layers::DebugTraceRecord => Box::new(TraceOverlay::new(
            Box::new(DebugOverlay::new(base, debug_flavor(target))),
            TraceMode::Record,
        )),
        Layers::DebugTraceCompare => Box::new(TraceOverlay::new(
            Box::new(DebugOverlay::new(base, debug_flavor(target))),
            TraceMode::Compare,
        )),
        Layers::Unsupported => {
            return Err(GenError::usage(
                codes::UNSUPPORTED_TARGET,
                format!("target {} is not supported", target),
            ))
        }
    };
    Ok(Rc::from(strategy))
}

// ── Region context ──────────────────────────────────────────────────────────

/// Kind of declaration block a declaration or import is rendered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    ModuleDeclaration,
    KernelCallerDeclaration,
    Other,
}

/// What an import statement is requested for.
#[derive(Debug)]
pub enum ImportSource<'a, 'b> {
    Module(&'a str),
    Symbols(&'a mut [&'b mut Symbol]),
}

/// Extra parameters a kernel launch forwards beyond the written arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelParameters {
    pub imports: Vec<Symbol>,
    pub declarations: Vec<Symbol>,
    pub dummies: Vec<Symbol>,
}

// ── Render session ──────────────────────────────────────────────────────────

/// Per-subroutine state of one render in flight.
///
/// Reset when a subroutine begins and when its end exit point is rendered.
#[derive(Debug, Default, Clone)]
pub struct RenderSession {
    pub routine_node: Option<RoutineNode>,
    pub module_name: Option<String>,
    /// Index of the next parallel region, used to name kernels.
    pub kernel_index: usize,
    /// Template of the kernel launch being emitted, between preparation and post.
    pub pending_kernel_template: Option<ParallelTemplate>,
    pub parallel_templates: Vec<ParallelTemplate>,
    pub debug_print_iterator_declared: bool,
    pub traced_symbols: Vec<Symbol>,
    pub early_exit_counter: usize,
    in_flight: bool,
}

impl RenderSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start rendering `node`. Fails if another subroutine is still in flight.
    pub fn begin(&mut self, node: &RoutineNode, module_name: &str) -> GenResult<()> {
        if self.in_flight {
            return Err(GenError::internal(
                codes::SESSION_IN_FLIGHT,
                format!(
                    "cannot begin {}: {} is still being rendered",
                    node.name(),
                    self.routine_name()
                ),
            ));
        }
        *self = RenderSession {
            routine_node: Some(node.clone()),
            module_name: Some(module_name.to_string()),
            in_flight: true,
            ..RenderSession::default()
        };
        Ok(())
    }

    /// Clear all per-subroutine state.
    pub fn end_subroutine(&mut self) {
        *self = RenderSession::default();
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn routine_name(&self) -> String {
        self.routine_node
            .as_ref()
            .map(|n| n.name().to_string())
            .unwrap_or_default()
    }

    pub fn position(&self) -> RegionPosition {
        self.routine_node
            .as_ref()
            .map(|n| n.position())
            .unwrap_or_default()
    }

    pub fn module(&self) -> &str {
        self.module_name.as_deref().unwrap_or("")
    }
}

// ── Strategy interface ──────────────────────────────────────────────────────

/// A code-generation strategy for one target.
pub trait Implementation: fmt::Debug {
    fn caps(&self) -> &'static Capabilities;

    /// Short label of the variant including overlays, e.g. `cuda+debug`.
    fn label(&self) -> String;

    /// Template target tags this strategy generates loops for.
    fn template_targets(&self) -> &'static [&'static str];

    /// Loop iterators of `template`, empty when the template does not apply.
    fn iterators(&self, template: &ParallelTemplate) -> Vec<String> {
        if !template.applies_to_any(self.template_targets()) {
            return Vec::new();
        }
        template.domains.iter().map(|d| d.name.clone()).collect()
    }

    /// Residency state transition of `symbol` for one region.
    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        used_in_kernel: Option<&BTreeSet<String>>,
        region_type: RegionType,
        position: RegionPosition,
        post_transfer: bool,
    );

    /// Name under which a caller reaches `callee_name` (called on the callee's strategy).
    fn adjust_callee_name(
        &self,
        callee_name: &str,
        callee_position: RegionPosition,
        caller_caps: &Capabilities,
        caller_position: RegionPosition,
        callee_is_kernel_caller: bool,
    ) -> String {
        commons::adjusted_callee_name(
            self.caps(),
            callee_name,
            callee_position,
            caller_caps,
            caller_position,
            callee_is_kernel_caller,
        )
    }

    fn adjust_specification_for_device(&self, line: &str, specification: &str) -> String {
        if self.caps().uses_duplicates_as_host_routines && specification.trim().eq_ignore_ascii_case("private") {
            return String::new();
        }
        line.to_string()
    }

    /// Specialize one routine into the routines actually emitted.
    fn generate_routines(&self, routine: Routine) -> GenResult<Vec<Routine>> {
        Ok(vec![routine])
    }

    fn file_preparation(&self, _filename: &str) -> String {
        commons::STORAGE_ORDER_INCLUDE.to_string()
    }

    fn additional_includes(&self) -> String {
        String::new()
    }

    fn loop_preparation(&self) -> String {
        String::new()
    }

    fn warning_on_unrecognized_call(&self, _caller: &str, _callee: &str) -> String {
        String::new()
    }

    fn kernel_call_config(&self) -> String {
        String::new()
    }

    fn kernel_call_preparation(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        _callee: Option<&RoutineNode>,
    ) -> GenResult<String> {
        session.pending_kernel_template = Some(template.clone());
        Ok(String::new())
    }

    fn kernel_call_post(&self, session: &mut RenderSession, symbols: &[&Symbol], callee: &RoutineNode) -> String;

    fn subroutine_prefix(&self, _node: &RoutineNode) -> GenResult<String> {
        Ok(String::new())
    }

    fn import_specification(
        &self,
        source: ImportSource<'_, '_>,
        region_type: RegionType,
        position: RegionPosition,
    ) -> GenResult<String>;

    fn adjust_declaration_for_device(
        &self,
        line: &str,
        symbols: &mut [&mut Symbol],
        used_in_kernels: Option<&BTreeSet<String>>,
        region_type: RegionType,
        position: RegionPosition,
    ) -> GenResult<String>;

    fn additional_kernel_parameters(
        &self,
        _caller: &Routine,
        _callee: &Callee,
        _call_arguments: &[String],
        _modules: &ModuleIndex,
    ) -> GenResult<KernelParameters> {
        Ok(KernelParameters::default())
    }

    fn begin_parallel_region(
        &self,
        session: &mut RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String>;

    fn end_parallel_region(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        routine: &Routine,
    ) -> GenResult<String>;

    fn declaration_end(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        node: &RoutineNode,
        templates: &[ParallelTemplate],
    ) -> GenResult<String>;

    fn subroutine_exit_point(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        is_subroutine_end: bool,
    ) -> GenResult<String>;
}

/// Fail with the standard usage error when a parallel region has no symbols.
pub(crate) fn require_symbols(symbols: &[&Symbol]) -> GenResult<()> {
    if symbols.is_empty() {
        return Err(GenError::usage(
            codes::EMPTY_PARALLEL_REGION,
            "parallel region without any dependant arrays",
        ));
    }
    Ok(())
}
