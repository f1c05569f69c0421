// overlay.rs — Debug and trace overlays
//
// Both overlays own the strategy they wrap and forward every operation to
// it. The debug overlay adds runtime print statements around subroutine
// entry and kernel launches; the trace overlay records argument values at
// subroutine entry and exit, or compares them against a recorded trace.
//
// Postconditions: capabilities are those of the wrapped strategy.
// Side effects: the trace overlay keeps its traced symbols and early exit
//   count in the render session.

use std::collections::BTreeSet;

use tracing::info;

use super::cuda::{bounds_guard, iterator_definitions};
use super::{
    commons, require_symbols, Capabilities, ImportSource, Implementation, KernelParameters, RegionType, RenderSession,
};
use crate::access::first_thread_access;
use crate::diag::{codes, GenError, GenResult};
use crate::routine::{Callee, ModuleIndex, RegionPosition, Routine, RoutineNode};
use crate::symbol::{Intent, Symbol};
use crate::template::ParallelTemplate;

/// Forward the operations an overlay does not change.
macro_rules! forward_unchanged {
    () => {
        fn caps(&self) -> &'static Capabilities {
            self.inner.caps()
        }

        fn template_targets(&self) -> &'static [&'static str] {
            self.inner.template_targets()
        }

        fn iterators(&self, template: &ParallelTemplate) -> Vec<String> {
            self.inner.iterators(template)
        }

        fn update_symbol_device_state(
            &self,
            symbol: &mut Symbol,
            used_in_kernel: Option<&BTreeSet<String>>,
            region_type: RegionType,
            position: RegionPosition,
            post_transfer: bool,
        ) {
            self.inner
                .update_symbol_device_state(symbol, used_in_kernel, region_type, position, post_transfer)
        }

        fn adjust_callee_name(
            &self,
            callee_name: &str,
            callee_position: RegionPosition,
            caller_caps: &Capabilities,
            caller_position: RegionPosition,
            callee_is_kernel_caller: bool,
        ) -> String {
            self.inner.adjust_callee_name(
                callee_name,
                callee_position,
                caller_caps,
                caller_position,
                callee_is_kernel_caller,
            )
        }

        fn adjust_specification_for_device(&self, line: &str, specification: &str) -> String {
            self.inner.adjust_specification_for_device(line, specification)
        }

        fn generate_routines(&self, routine: Routine) -> GenResult<Vec<Routine>> {
            self.inner.generate_routines(routine)
        }

        fn file_preparation(&self, filename: &str) -> String {
            self.inner.file_preparation(filename)
        }

        fn loop_preparation(&self) -> String {
            self.inner.loop_preparation()
        }

        fn warning_on_unrecognized_call(&self, caller: &str, callee: &str) -> String {
            self.inner.warning_on_unrecognized_call(caller, callee)
        }

        fn kernel_call_config(&self) -> String {
            self.inner.kernel_call_config()
        }

        fn subroutine_prefix(&self, node: &RoutineNode) -> GenResult<String> {
            self.inner.subroutine_prefix(node)
        }

        fn import_specification(
            &self,
            source: ImportSource<'_, '_>,
            region_type: RegionType,
            position: RegionPosition,
        ) -> GenResult<String> {
            self.inner.import_specification(source, region_type, position)
        }

        fn adjust_declaration_for_device(
            &self,
            line: &str,
            symbols: &mut [&mut Symbol],
            used_in_kernels: Option<&BTreeSet<String>>,
            region_type: RegionType,
            position: RegionPosition,
        ) -> GenResult<String> {
            self.inner
                .adjust_declaration_for_device(line, symbols, used_in_kernels, region_type, position)
        }

        fn additional_kernel_parameters(
            &self,
            caller: &Routine,
            callee: &Callee,
            call_arguments: &[String],
            modules: &ModuleIndex,
        ) -> GenResult<KernelParameters> {
            self.inner
                .additional_kernel_parameters(caller, callee, call_arguments, modules)
        }

        fn end_parallel_region(
            &self,
            session: &mut RenderSession,
            template: &ParallelTemplate,
            routine: &Routine,
        ) -> GenResult<String> {
            self.inner.end_parallel_region(session, template, routine)
        }
    };
}

// ── Debug ───────────────────────────────────────────────────────────────────

/// Which memory model the debug output is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugFlavor {
    Host,
    PresentData,
    /// `emulated` adds per-thread checks for device emulation builds.
    ExplicitMemory { emulated: bool },
}

#[derive(Debug)]
pub struct DebugOverlay {
    inner: Box<dyn Implementation>,
    flavor: DebugFlavor,
}

impl DebugOverlay {
    pub fn new(inner: Box<dyn Implementation>, flavor: DebugFlavor) -> Self {
        DebugOverlay { inner, flavor }
    }

    fn announces_entry(&self, position: RegionPosition) -> bool {
        match self.flavor {
            DebugFlavor::Host => true,
            DebugFlavor::PresentData => position != RegionPosition::Outside,
            DebugFlavor::ExplicitMemory { .. } => position == RegionPosition::Inside,
        }
    }

    /// Kernel entry checks run by emulated device builds, placed between the
    /// index definitions and the bounds guard.
    fn emulated_kernel_entry(
        &self,
        session: &RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String> {
        require_symbols(symbols)?;
        let kernel = session.routine_name();
        if kernel.is_empty() {
            return Err(GenError::internal(
                codes::MISSING_CONTEXT,
                "kernel entry checks rendered outside of a subroutine",
            ));
        }
        let iterators = self.inner.iterators(template);
        if iterators.is_empty() {
            return Err(GenError::usage(
                codes::UNSUPPORTED_DIMENSIONALITY,
                format!("no iterators in kernel {}", kernel),
            ));
        }
        let mut result = iterator_definitions(template)?;

        let invalid: Vec<String> = iterators.iter().map(|i| format!("{} .LT. 1", i)).collect();
        let values: Vec<String> = iterators.iter().map(|i| format!("'{i}', {i}")).collect();
        result.push_str(&format!(
            "if ({}) then\n\twrite(0,*) 'ERROR: invalid initialization of iterators in kernel {} - check kernel domain setup'\n\twrite(0,*) {}\nend if\n",
            invalid.join(" .OR. "),
            kernel,
            values.join(", ")
        ));

        let first: Vec<String> = iterators.iter().map(|i| format!("{} .EQ. 1", i)).collect();
        let first = format!("({})", first.join(" .AND. "));
        result.push_str(&format!(
            "if {} write(0,*) '*********** entering kernel {} finished *************** '\n",
            first, kernel
        ));
        for symbol in symbols.iter().filter(|s| s.intent.is_input()) {
            let access = first_thread_access(symbol, &iterators);
            result.push_str(&format!("if {} then\n\twrite(0,*) '{}', {}\nend if\n", first, access, access));
        }
        result.push_str(&format!(
            "if {} write(0,*) '**********************************************'\n",
            first
        ));
        result.push_str(&format!("if {} write(0,*) ''\n", first));
        result.push_str(&bounds_guard(template));
        Ok(result)
    }
}

impl Implementation for DebugOverlay {
    forward_unchanged!();

    fn label(&self) -> String {
        format!("{}+debug", self.inner.label())
    }

    fn additional_includes(&self) -> String {
        self.inner.additional_includes()
    }

    fn kernel_call_preparation(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        callee: Option<&RoutineNode>,
    ) -> GenResult<String> {
        let mut result = self.inner.kernel_call_preparation(session, template, callee)?;
        let node = match callee {
            Some(node) => node,
            None => return Ok(result),
        };
        match self.flavor {
            DebugFlavor::Host => {}
            DebugFlavor::PresentData => {
                result.push_str(&format!("write(0,*) 'calling kernel {}'\n", node.name()));
            }
            DebugFlavor::ExplicitMemory { .. } => {
                let grid: Vec<&str> = ["cugridSizeX", "cugridSizeY", "cugridSizeZ"]
                    .into_iter()
                    .take(self.inner.iterators(template).len())
                    .collect();
                result.push_str(&format!(
                    "write(0,*) 'calling kernel {} with grid size', {}\n",
                    node.name(),
                    grid.join(", ")
                ));
            }
        }
        Ok(result)
    }

    fn kernel_call_post(&self, session: &mut RenderSession, symbols: &[&Symbol], callee: &RoutineNode) -> String {
        let mut result = self.inner.kernel_call_post(session, symbols, callee);
        if matches!(self.flavor, DebugFlavor::ExplicitMemory { .. }) && callee.position() == RegionPosition::Within {
            result.push_str("if(cuerror .NE. cudaSuccess) then\n\tstop 1\nend if\n");
        }
        result
    }

    fn begin_parallel_region(
        &self,
        session: &mut RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String> {
        match self.flavor {
            DebugFlavor::ExplicitMemory { emulated: true } => self.emulated_kernel_entry(session, symbols, template),
            _ => self.inner.begin_parallel_region(session, symbols, template),
        }
    }

    fn declaration_end(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        node: &RoutineNode,
        templates: &[ParallelTemplate],
    ) -> GenResult<String> {
        let mut result = self
            .inner
            .declaration_end(session, symbols, is_kernel_caller, node, templates)?;
        if self.announces_entry(node.position()) {
            result.push_str(&format!("write(0,*) 'entering subroutine {}'\n", node.name()));
        }
        Ok(result)
    }

    fn subroutine_exit_point(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        is_subroutine_end: bool,
    ) -> GenResult<String> {
        self.inner
            .subroutine_exit_point(session, symbols, is_kernel_caller, is_subroutine_end)
    }
}

// ── Trace ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Write argument values to trace files.
    Record,
    /// Read trace files and report deviations.
    Compare,
}

#[derive(Debug)]
pub struct TraceOverlay {
    inner: Box<dyn Implementation>,
    mode: TraceMode,
}

const COMPARISON_DECLARATIONS: &str = "integer(4) :: hf_tracing_imt, hf_tracing_ierr\n\
                                       real(8) :: hf_tracing_error\n\
                                       real(8) :: hf_mean_ref\n\
                                       real(8) :: hf_mean_gpu\n\
                                       integer(8) :: hf_num_of_elements\n\
                                       logical :: hf_tracing_error_found\n";

impl TraceOverlay {
    pub fn new(inner: Box<dyn Implementation>, mode: TraceMode) -> Self {
        TraceOverlay { inner, mode }
    }

    fn statements(&self, session: &RenderSession, symbols: &[&Symbol], checkpoint: &str, point: commons::TracePoint, increment: bool) -> String {
        let module = session.module().to_string();
        let routine = session.routine_name();
        match self.mode {
            TraceMode::Record => commons::tracing_statements(&routine, symbols, checkpoint, increment, |s| {
                commons::record_trace(&module, &routine, s, point)
            }),
            TraceMode::Compare => commons::tracing_statements(&routine, symbols, checkpoint, increment, |s| {
                commons::compare_trace(&module, &routine, s, point, checkpoint)
            }),
        }
    }
}

impl Implementation for TraceOverlay {
    forward_unchanged!();

    fn label(&self) -> String {
        match self.mode {
            TraceMode::Record => format!("{}+trace", self.inner.label()),
            TraceMode::Compare => format!("{}+tracecheck", self.inner.label()),
        }
    }

    fn additional_includes(&self) -> String {
        let mut result = self.inner.additional_includes();
        result.push_str("use helper_functions\n");
        if self.mode == TraceMode::Compare {
            result.push_str("use cudafor\n");
        }
        result
    }

    fn kernel_call_preparation(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        callee: Option<&RoutineNode>,
    ) -> GenResult<String> {
        self.inner.kernel_call_preparation(session, template, callee)
    }

    fn kernel_call_post(&self, session: &mut RenderSession, symbols: &[&Symbol], callee: &RoutineNode) -> String {
        self.inner.kernel_call_post(session, symbols, callee)
    }

    fn begin_parallel_region(
        &self,
        session: &mut RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String> {
        self.inner.begin_parallel_region(session, symbols, template)
    }

    fn declaration_end(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        node: &RoutineNode,
        templates: &[ParallelTemplate],
    ) -> GenResult<String> {
        let traced = commons::traceable_symbols(symbols);
        info!(
            routine = %node.name(),
            symbols = ?traced.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "symbols declared for tracing"
        );
        let inner = self
            .inner
            .declaration_end(session, symbols, is_kernel_caller, node, templates)?;

        let mut result = String::new();
        if self.mode == TraceMode::Compare {
            result.push_str(COMPARISON_DECLARATIONS);
        }
        result.push_str(&commons::tracing_declarations(&traced, self.mode == TraceMode::Compare));
        result.push_str(&inner);
        if self.mode == TraceMode::Compare {
            result.push_str("hf_tracing_error_found = .false.\n");
            result.push_str("hf_tracing_error = 0.0d0\n");
        }
        let inputs: Vec<&Symbol> = traced.iter().filter(|s| s.intent.is_input()).collect();
        result.push_str(&self.statements(session, &inputs, "start", commons::TracePoint::Begin, false));
        session.traced_symbols = traced;
        Ok(result)
    }

    fn subroutine_exit_point(
        &self,
        session: &mut RenderSession,
        symbols: &mut [&mut Symbol],
        is_kernel_caller: bool,
        is_subroutine_end: bool,
    ) -> GenResult<String> {
        let checkpoint = if is_subroutine_end {
            "end".to_string()
        } else {
            session.early_exit_counter += 1;
            format!("exit{}", session.early_exit_counter)
        };
        let traced = session.traced_symbols.clone();
        let outputs: Vec<&Symbol> = traced
            .iter()
            .filter(|s| s.intent.is_output() || s.intent == Intent::Unspecified)
            .collect();
        info!(
            routine = %session.routine_name(),
            symbols = ?traced.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "symbols used for tracing"
        );
        let mut result = self.statements(session, &outputs, &checkpoint, commons::TracePoint::End, !traced.is_empty());
        result.push_str(
            &self
                .inner
                .subroutine_exit_point(session, symbols, is_kernel_caller, is_subroutine_end)?,
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptionFlags;
    use crate::strategy::cuda::CudaImplementation;
    use crate::strategy::host::{HostFlavor, HostImplementation};
    use crate::strategy::openacc::OpenAccImplementation;
    use crate::template::LoopDomain;

    fn host() -> Box<dyn Implementation> {
        Box::new(HostImplementation::new(HostFlavor::Sequential, OptionFlags::default()))
    }

    fn node(name: &str, position: RegionPosition) -> RoutineNode {
        let mut n = RoutineNode::new(name, "m");
        n.set_position(position);
        n
    }

    fn begun(node: &RoutineNode) -> RenderSession {
        let mut session = RenderSession::new();
        session.begin(node, "m").unwrap();
        session
    }

    fn template_ij() -> ParallelTemplate {
        ParallelTemplate::new("t", vec![LoopDomain::new("i", "nx"), LoopDomain::new("j", "ny")])
    }

    #[test]
    fn debug_overlay_announces_subroutine_entry() {
        let overlay = DebugOverlay::new(host(), DebugFlavor::Host);
        let n = node("step", RegionPosition::None);
        let mut session = begun(&n);
        let text = overlay.declaration_end(&mut session, &mut [], false, &n, &[]).unwrap();
        assert!(text.ends_with("write(0,*) 'entering subroutine step'\n"));
        assert_eq!(overlay.label(), "cpu+debug");
        assert_eq!(overlay.caps(), &crate::strategy::HOST_CAPABILITIES);
    }

    #[test]
    fn present_data_entry_is_silent_for_device_routines() {
        let overlay = DebugOverlay::new(
            Box::new(OpenAccImplementation::new(OptionFlags::default())),
            DebugFlavor::PresentData,
        );
        let n = node("helper", RegionPosition::Outside);
        let mut session = begun(&n);
        let text = overlay.declaration_end(&mut session, &mut [], false, &n, &[]).unwrap();
        assert!(!text.contains("entering subroutine"));

        let callee = node("k", RegionPosition::Within);
        let prep = overlay
            .kernel_call_preparation(&mut session, &template_ij(), Some(&callee))
            .unwrap();
        assert_eq!(prep, "write(0,*) 'calling kernel k'\n");
    }

    #[test]
    fn explicit_memory_reports_grid_and_stops_on_error() {
        let flags = OptionFlags {
            keep_gpu_cache_settings: true,
            ..OptionFlags::default()
        };
        let overlay = DebugOverlay::new(
            Box::new(CudaImplementation::new(flags)),
            DebugFlavor::ExplicitMemory { emulated: false },
        );
        let callee = node("diffuse_hfk0", RegionPosition::Within);
        let mut session = RenderSession::new();
        let prep = overlay
            .kernel_call_preparation(&mut session, &template_ij(), Some(&callee))
            .unwrap();
        assert!(prep.ends_with("write(0,*) 'calling kernel diffuse_hfk0 with grid size', cugridSizeX, cugridSizeY\n"));
        let post = overlay.kernel_call_post(&mut session, &[], &callee);
        assert!(post.ends_with("if(cuerror .NE. cudaSuccess) then\n\tstop 1\nend if\n"));
    }

    #[test]
    fn emulated_kernels_check_iterators_before_the_guard() {
        let overlay = DebugOverlay::new(
            Box::new(CudaImplementation::new(OptionFlags::default())),
            DebugFlavor::ExplicitMemory { emulated: true },
        );
        let n = node("diffuse_hfk0", RegionPosition::Within);
        let mut session = begun(&n);
        let mut a = Symbol::array("a", "real(8)", &[("i", "nx"), ("k", "nz")]);
        a.intent = Intent::In;
        let b = Symbol::array("b", "real(8)", &[("i", "nx"), ("j", "ny")]);
        let t = template_ij();
        let text = overlay.begin_parallel_region(&mut session, &[&a, &b], &t).unwrap();
        let check = text.find("ERROR: invalid initialization of iterators in kernel diffuse_hfk0").unwrap();
        let guard = text.find("if (i .GT. nx .OR. j .GT. ny) then").unwrap();
        assert!(text.starts_with("i = (blockidx%x - 1)"));
        assert!(check < guard);
        assert!(text.contains("if (i .LT. 1 .OR. j .LT. 1) then\n"));
        assert!(text.contains("\twrite(0,*) 'i', i, 'j', j\n"));
        assert!(text.contains("if (i .EQ. 1 .AND. j .EQ. 1) then\n\twrite(0,*) 'a(i,1)', a(i,1)\nend if\n"));
        assert!(!text.contains("'b("));
    }

    fn traced_symbols() -> (Symbol, Symbol) {
        let mut a = Symbol::array("a", "real(8)", &[("i", "nx")]);
        a.intent = Intent::In;
        let mut b = Symbol::array("b", "real(8)", &[("i", "nx")]);
        b.intent = Intent::Out;
        (a, b)
    }

    #[test]
    fn trace_record_writes_inputs_at_entry_and_outputs_at_exit() {
        let overlay = TraceOverlay::new(host(), TraceMode::Record);
        let n = node("step", RegionPosition::None);
        let mut session = begun(&n);
        let (mut a, mut b) = traced_symbols();
        let text = overlay
            .declaration_end(&mut session, &mut [&mut a, &mut b], false, &n, &[])
            .unwrap();
        assert!(text.starts_with("integer(4), save :: hf_tracing_counter = 0\n"));
        assert!(text.contains("! tracing checkpoint step start\n"));
        assert!(text.contains("./datatrace/m_step_a_begin"));
        assert!(!text.contains("m_step_b_begin"));
        assert_eq!(session.traced_symbols.len(), 2);

        let early = overlay
            .subroutine_exit_point(&mut session, &mut [&mut a, &mut b], false, false)
            .unwrap();
        assert!(early.starts_with("! tracing checkpoint step exit1\n"));
        assert!(early.contains("./datatrace/m_step_b_end"));
        assert!(early.contains("hf_tracing_counter = hf_tracing_counter + 1\n"));

        let end = overlay
            .subroutine_exit_point(&mut session, &mut [&mut a, &mut b], false, true)
            .unwrap();
        assert!(end.starts_with("! tracing checkpoint step end\n"));
        assert!(session.traced_symbols.is_empty());
        assert_eq!(session.early_exit_counter, 0);
    }

    #[test]
    fn trace_compare_declares_error_state() {
        let overlay = TraceOverlay::new(
            Box::new(DebugOverlay::new(
                Box::new(OpenAccImplementation::new(OptionFlags::default())),
                DebugFlavor::PresentData,
            )),
            TraceMode::Compare,
        );
        assert_eq!(overlay.label(), "openacc+debug+tracecheck");
        assert!(overlay.additional_includes().ends_with("use helper_functions\nuse cudafor\n"));
        let n = node("step", RegionPosition::Inside);
        let mut session = begun(&n);
        let (mut a, mut b) = traced_symbols();
        let text = overlay
            .declaration_end(&mut session, &mut [&mut a, &mut b], false, &n, &[])
            .unwrap();
        assert!(text.starts_with(COMPARISON_DECLARATIONS));
        assert!(text.contains("real(8), allocatable :: hf_tracing_comparison_a(:)\n"));
        assert!(text.contains("hf_tracing_error_found = .false.\nhf_tracing_error = 0.0d0\n"));
        assert!(text.contains("call readFromFile(hf_tracing_current_path, hf_tracing_comparison_a)\n"));
    }
}
