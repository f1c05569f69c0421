// host.rs — Sequential and thread-parallel host strategies
//
// Parallel regions become plain loop nests, optionally wrapped in a
// thread-parallel directive. No device exists, so every residency flag is
// cleared and declarations pass through unchanged.

use std::collections::BTreeSet;

use super::commons;
use super::{
    require_symbols, Capabilities, ImportSource, Implementation, RegionType, RenderSession, HOST_CAPABILITIES,
    OPENMP_CAPABILITIES,
};
use crate::config::OptionFlags;
use crate::diag::{codes, GenError, GenResult};
use crate::routine::{RegionPosition, Routine, RoutineNode};
use crate::symbol::Symbol;
use crate::template::{iterator_declaration, LoopDomain, ParallelTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostFlavor {
    Sequential,
    OpenMp,
}

#[derive(Debug, Clone)]
pub struct HostImplementation {
    flavor: HostFlavor,
    targets: &'static [&'static str],
    use_kernel_prefixes_for_debug_print: bool,
    flags: OptionFlags,
}

impl HostImplementation {
    pub fn new(flavor: HostFlavor, flags: OptionFlags) -> Self {
        HostImplementation {
            flavor,
            targets: &["CPU", ""],
            use_kernel_prefixes_for_debug_print: true,
            flags,
        }
    }

    /// Host version of a routine that was split off a device routine: it runs
    /// the loops meant for the device, sequentially.
    pub fn for_device_routine_duplicate(flags: OptionFlags) -> Self {
        HostImplementation {
            flavor: HostFlavor::Sequential,
            targets: &["GPU", ""],
            use_kernel_prefixes_for_debug_print: false,
            flags,
        }
    }

    pub fn flavor(&self) -> HostFlavor {
        self.flavor
    }
}

// ── Loop helpers shared with the device strategies ──────────────────────────

pub(crate) fn loop_header(domain: &LoopDomain) -> String {
    format!("do {}={},{}", domain.name, domain.starts_at(), domain.ends_at())
}

/// Loop headers in reverse declared order: the first dimension is innermost.
pub(crate) fn loop_nest(template: &ParallelTemplate) -> String {
    let mut result = String::new();
    for (pos, domain) in template.domains.iter().enumerate().rev() {
        result.push_str(&loop_header(domain));
        if pos != 0 {
            result.push_str("\n ");
        }
    }
    result
}

pub(crate) fn end_loops(template: &ParallelTemplate) -> String {
    "end do\n".repeat(template.domains.len())
}

/// Trailing part of every exit point: debug counter and, at the true end,
/// the session reset.
pub(crate) fn base_exit_point(flags: OptionFlags, session: &mut RenderSession, is_subroutine_end: bool) -> String {
    let mut result = String::new();
    if flags.debug_print && session.debug_print_iterator_declared {
        result.push_str("#ifndef GPU\n");
        result.push_str("hf_debug_print_iterator = hf_debug_print_iterator + 1\n");
        result.push_str("#endif\n");
    }
    if is_subroutine_end {
        session.end_subroutine();
    }
    result
}

/// Value dump after a kernel launch returned; closes the pending launch.
pub(crate) fn base_kernel_call_post(
    flags: OptionFlags,
    session: &mut RenderSession,
    symbols: &[&Symbol],
    callee: &RoutineNode,
    use_openacc: bool,
) -> String {
    if callee.position() != RegionPosition::Within {
        return String::new();
    }
    let mut result = String::new();
    if flags.debug_print {
        result.push_str(&commons::runtime_debug_print_statements(callee.name(), symbols, use_openacc));
    }
    session.pending_kernel_template = None;
    result
}

impl HostImplementation {
    /// Value dump after the parallel region the kernel counter points at.
    fn region_debug_print(&self, session: &mut RenderSession, routine: &Routine) -> GenResult<String> {
        let regions = routine.parallel_region_ids();
        let active = regions.get(session.kernel_index).copied().ok_or_else(|| {
            GenError::internal(
                codes::KERNEL_COUNTER_MISMATCH,
                format!(
                    "kernel counter {} points past the {} parallel regions of {}",
                    session.kernel_index,
                    regions.len(),
                    routine.name
                ),
            )
        })?;
        let used: BTreeSet<String> = routine.arena.used_symbol_names(active)?.into_iter().collect();
        let active_symbols: Vec<&Symbol> = routine.symbols.values().filter(|s| used.contains(&s.name)).collect();
        let label = if self.use_kernel_prefixes_for_debug_print {
            commons::synthesized_kernel_name(&routine.name, session.kernel_index)
        } else {
            routine.name.clone()
        };
        session.kernel_index += 1;
        Ok(commons::runtime_debug_print_statements(&label, &active_symbols, true))
    }
}

impl Implementation for HostImplementation {
    fn caps(&self) -> &'static Capabilities {
        match self.flavor {
            HostFlavor::Sequential => &HOST_CAPABILITIES,
            HostFlavor::OpenMp => &OPENMP_CAPABILITIES,
        }
    }

    fn label(&self) -> String {
        match self.flavor {
            HostFlavor::Sequential => "cpu".to_string(),
            HostFlavor::OpenMp => "openmp".to_string(),
        }
    }

    fn template_targets(&self) -> &'static [&'static str] {
        self.targets
    }

    fn update_symbol_device_state(
        &self,
        symbol: &mut Symbol,
        _used_in_kernel: Option<&BTreeSet<String>>,
        _region_type: RegionType,
        _position: RegionPosition,
        _post_transfer: bool,
    ) {
        symbol.is_using_device_postfix = false;
        symbol.is_on_device = false;
    }

    fn kernel_call_post(&self, session: &mut RenderSession, symbols: &[&Symbol], callee: &RoutineNode) -> String {
        base_kernel_call_post(self.flags, session, symbols, callee, true)
    }

    fn import_specification(
        &self,
        source: ImportSource<'_, '_>,
        _region_type: RegionType,
        _position: RegionPosition,
    ) -> GenResult<String> {
        Ok(match source {
            ImportSource::Module(module) => commons::module_import(module),
            ImportSource::Symbols(symbols) => commons::import_statements(symbols, false),
        })
    }

    fn adjust_declaration_for_device(
        &self,
        line: &str,
        _symbols: &mut [&mut Symbol],
        _used_in_kernels: Option<&BTreeSet<String>>,
        _region_type: RegionType,
        _position: RegionPosition,
    ) -> GenResult<String> {
        Ok(format!("{}\n", line.trim_end()))
    }

    fn begin_parallel_region(
        &self,
        _session: &mut RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String> {
        require_symbols(symbols)?;
        let mut result = String::new();
        if self.flavor == HostFlavor::OpenMp {
            let shared: Vec<String> = symbols.iter().map(|s| s.name_in_scope(true)).collect();
            result.push_str(&format!(
                "!$OMP PARALLEL DO DEFAULT(firstprivate) {} SHARED({})\n",
                template.reduction_clause().to_uppercase(),
                shared.join(", ")
            ));
        }
        result.push_str(&loop_nest(template));
        Ok(result)
    }

    fn end_parallel_region(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        routine: &Routine,
    ) -> GenResult<String> {
        let mut result = end_loops(template);
        if self.flags.debug_print && self.caps().allows_mixed_host_and_device_code {
            result.push_str(&self.region_debug_print(session, routine)?);
        }
        if self.flavor == HostFlavor::OpenMp {
            result.push_str("\n!$OMP END PARALLEL DO\n");
        }
        Ok(result)
    }

    fn declaration_end(
        &self,
        session: &mut RenderSession,
        _symbols: &mut [&mut Symbol],
        _is_kernel_caller: bool,
        _node: &RoutineNode,
        templates: &[ParallelTemplate],
    ) -> GenResult<String> {
        session.kernel_index = 0;
        session.parallel_templates = templates.to_vec();
        let mut result = String::new();
        if self.flags.debug_print {
            result.push_str("real(8) :: hf_output_temp\n");
            result.push_str("#ifndef GPU\n");
            result.push_str("integer(4), save :: hf_debug_print_iterator = 0\n");
            result.push_str("#endif\n");
            session.debug_print_iterator_declared = true;
        }
        result.push_str(&iterator_declaration(templates, self.targets));
        Ok(result)
    }

    fn subroutine_exit_point(
        &self,
        session: &mut RenderSession,
        _symbols: &mut [&mut Symbol],
        _is_kernel_caller: bool,
        is_subroutine_end: bool,
    ) -> GenResult<String> {
        Ok(base_exit_point(self.flags, session, is_subroutine_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;
    use crate::template::Reduction;
    use std::rc::Rc;

    fn template_ij() -> ParallelTemplate {
        ParallelTemplate::new(
            "t",
            vec![LoopDomain::new("i", "nx"), LoopDomain::with_bounds("j", "2", "ny")],
        )
    }

    #[test]
    fn sequential_loop_over_one_dimension() {
        let host = HostImplementation::new(HostFlavor::Sequential, OptionFlags::default());
        let a = Symbol::array("a", "real(8)", &[("i", "10")]);
        let t = ParallelTemplate::new("t", vec![LoopDomain::with_bounds("i", "1", "10")]);
        let mut session = RenderSession::new();
        assert_eq!(host.begin_parallel_region(&mut session, &[&a], &t).unwrap(), "do i=1,10");
        let routine = Routine::new("r", "m", Rc::new(host.clone()));
        assert_eq!(host.end_parallel_region(&mut session, &t, &routine).unwrap(), "end do\n");
    }

    #[test]
    fn loops_are_emitted_in_reverse_order() {
        let host = HostImplementation::new(HostFlavor::Sequential, OptionFlags::default());
        let a = Symbol::array("a", "real(8)", &[("i", "nx"), ("j", "ny")]);
        let text = host
            .begin_parallel_region(&mut RenderSession::new(), &[&a], &template_ij())
            .unwrap();
        assert_eq!(text, "do j=2,ny\n do i=1,nx");
    }

    #[test]
    fn openmp_directive_lists_shared_symbols_and_reductions() {
        let omp = HostImplementation::new(HostFlavor::OpenMp, OptionFlags::default());
        let a = Symbol::array("a", "real(8)", &[("i", "nx")]);
        let s = Symbol::new("s", "real(8)");
        let mut t = ParallelTemplate::new("t", vec![LoopDomain::new("i", "nx")]);
        t.reductions.push(Reduction {
            operator: "+".to_string(),
            symbols: vec!["s".to_string()],
        });
        let text = omp.begin_parallel_region(&mut RenderSession::new(), &[&a, &s], &t).unwrap();
        assert_eq!(
            text,
            "!$OMP PARALLEL DO DEFAULT(firstprivate) REDUCTION(+: S) SHARED(a, s)\ndo i=1,nx"
        );
        let routine = Routine::new("r", "m", Rc::new(omp.clone()));
        let end = omp.end_parallel_region(&mut RenderSession::new(), &t, &routine).unwrap();
        assert_eq!(end, "end do\n\n!$OMP END PARALLEL DO\n");
    }

    #[test]
    fn empty_region_is_rejected() {
        let host = HostImplementation::new(HostFlavor::OpenMp, OptionFlags::default());
        let e = host
            .begin_parallel_region(&mut RenderSession::new(), &[], &template_ij())
            .unwrap_err();
        assert!(e.is_usage());
    }

    #[test]
    fn residency_is_always_cleared() {
        let host = HostImplementation::new(HostFlavor::Sequential, OptionFlags::default());
        let mut a = Symbol::array("a", "real(8)", &[("i", "nx")]);
        a.is_on_device = true;
        a.is_using_device_postfix = true;
        host.update_symbol_device_state(&mut a, None, RegionType::KernelCallerDeclaration, RegionPosition::Within, true);
        assert!(!a.is_on_device);
        assert!(!a.is_using_device_postfix);
        assert_eq!(a.name_in_scope(true), "a");
    }

    #[test]
    fn debug_print_follows_kernel_counter() {
        let flags = OptionFlags {
            debug_print: true,
            ..OptionFlags::default()
        };
        let host = HostImplementation::new(HostFlavor::Sequential, flags);
        let mut routine = Routine::new("r", "m", Rc::new(host.clone()));
        routine.add_symbol(Symbol::array("a", "real(8)", &[("i", "nx")]));
        routine.add_region(RegionKind::Plain);
        let p = routine.add_parallel_region();
        routine.arena.load_line(p, "a = 1", &["a"]).unwrap();

        let t = ParallelTemplate::new("t", vec![LoopDomain::new("i", "nx")]);
        let mut session = RenderSession::new();
        let decl = host
            .declaration_end(&mut session, &mut [], false, &routine.node, std::slice::from_ref(&t))
            .unwrap();
        assert!(decl.contains("integer(4), save :: hf_debug_print_iterator = 0"));
        assert!(decl.ends_with("integer(4) :: i\n"));

        let end = host.end_parallel_region(&mut session, &t, &routine).unwrap();
        assert!(end.contains("write(0,*) 'r_hfk0 a:', hf_output_temp"));
        assert_eq!(session.kernel_index, 1);

        let e = host.end_parallel_region(&mut session, &t, &routine).unwrap_err();
        assert_eq!(e.code, codes::KERNEL_COUNTER_MISMATCH);
    }

    #[test]
    fn exit_point_resets_session_only_at_end() {
        let flags = OptionFlags {
            debug_print: true,
            ..OptionFlags::default()
        };
        let host = HostImplementation::new(HostFlavor::Sequential, flags);
        let mut session = RenderSession::new();
        session.begin(&RoutineNode::new("r", "m"), "m").unwrap();
        host.declaration_end(&mut session, &mut [], false, &RoutineNode::new("r", "m"), &[])
            .unwrap();
        let early = host.subroutine_exit_point(&mut session, &mut [], false, false).unwrap();
        assert!(early.contains("hf_debug_print_iterator + 1"));
        assert!(session.is_in_flight());
        host.subroutine_exit_point(&mut session, &mut [], false, true).unwrap();
        assert!(!session.is_in_flight());
        assert!(!session.debug_print_iterator_declared);
    }
}
