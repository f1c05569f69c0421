// openacc.rs — Directive-based device strategy over present data
//
// Parallel regions become `!$acc kernels` blocks with one vectorized loop
// directive per dimension. Device data is expected to be present; copies are
// only generated for arrays explicitly marked for transfer.

use std::collections::BTreeSet;
use std::path::Path;

use super::host::{base_exit_point, base_kernel_call_post, end_loops, loop_header};
use super::{
    commons, device_data, require_symbols, Capabilities, ImportSource, Implementation, RegionType, RenderSession,
    OPENACC_CAPABILITIES,
};
use crate::config::OptionFlags;
use crate::diag::{codes, GenError, GenResult};
use crate::routine::{RegionPosition, Routine, RoutineNode};
use crate::symbol::Symbol;
use crate::template::{iterator_declaration, ParallelTemplate, VECTOR_SIZE_PP_NAMES};

const TARGETS: &[&str] = &["GPU"];

#[derive(Debug, Clone)]
pub struct OpenAccImplementation {
    flags: OptionFlags,
}

impl OpenAccImplementation {
    pub fn new(flags: OptionFlags) -> Self {
        OpenAccImplementation { flags }
    }
}

/// Loop dimensions a device kernel can map onto (one to three).
pub(crate) fn check_dimensionality(template: &ParallelTemplate) -> GenResult<()> {
    let n = template.domains.len();
    if !(1..=VECTOR_SIZE_PP_NAMES.len()).contains(&n) {
        return Err(GenError::usage(
            codes::UNSUPPORTED_DIMENSIONALITY,
            format!(
                "invalid number of parallel domains in parallel region definition: {} (template {})",
                n, template.id
            ),
        ));
    }
    Ok(())
}

impl Implementation for OpenAccImplementation {
    fn caps(&self) -> &'static Capabilities {
        &OPENACC_CAPABILITIES
    }

    fn label(&self) -> String {
        "openacc".to_string()
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

    fn file_preparation(&self, filename: &str) -> String {
        let stem = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or("unit");
        format!(
            "{}\nattributes(global) subroutine HF_DUMMYKERNEL_{}()\nuse cudafor\nend subroutine\n",
            commons::STORAGE_ORDER_INCLUDE,
            stem
        )
    }

    fn additional_includes(&self) -> String {
        "use openacc\nuse cudafor\n".to_string()
    }

    fn loop_preparation(&self) -> String {
        "!$acc loop seq".to_string()
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
        symbols: &mut [&mut Symbol],
        used_in_kernels: Option<&BTreeSet<String>>,
        region_type: RegionType,
        position: RegionPosition,
    ) -> GenResult<String> {
        device_data::adjust_declaration(self.caps(), line, symbols, used_in_kernels, region_type, position)
    }

    fn begin_parallel_region(
        &self,
        _session: &mut RenderSession,
        symbols: &[&Symbol],
        template: &ParallelTemplate,
    ) -> GenResult<String> {
        require_symbols(symbols)?;
        let mut result = String::from("!$acc kernels ");
        for symbol in symbols.iter().filter(|s| s.is_array() && s.is_on_device) {
            result.push_str(&format!("deviceptr({}) ", symbol.name));
        }
        result.push('\n');
        check_dimensionality(template)?;
        for (pos, domain) in template.domains.iter().enumerate().rev() {
            result.push_str(&format!("!$acc loop independent vector({}) \n", VECTOR_SIZE_PP_NAMES[pos]));
            result.push_str(&loop_header(domain));
            if pos != 0 {
                result.push_str("\n ");
            }
        }
        Ok(result)
    }

    fn end_parallel_region(
        &self,
        session: &mut RenderSession,
        template: &ParallelTemplate,
        routine: &Routine,
    ) -> GenResult<String> {
        let mut result = end_loops(template);
        result.push_str("\n!$acc end kernels\n");
        if self.flags.debug_print && self.caps().allows_mixed_host_and_device_code {
            let used = routine.used_symbol_names_in_kernels();
            let active: Vec<&Symbol> = routine.symbols.values().filter(|s| used.contains(&s.name)).collect();
            result.push_str(&commons::runtime_debug_print_statements(
                &commons::synthesized_kernel_name(&routine.name, session.kernel_index),
                &active,
                true,
            ));
            session.kernel_index += 1;
        }
        Ok(result)
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
        result.push_str(&device_data::declaration_end(session, symbols, is_kernel_caller)?);
        Ok(result)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;
    use crate::template::LoopDomain;
    use std::rc::Rc;

    fn device_array(name: &str) -> Symbol {
        let mut s = Symbol::array(name, "real(8)", &[("i", "nx"), ("j", "ny")]);
        s.is_on_device = true;
        s
    }

    #[test]
    fn kernels_directive_with_device_pointers_and_vector_loops() {
        let acc = OpenAccImplementation::new(OptionFlags::default());
        let a = device_array("a");
        let n = Symbol::new("n", "integer(4)");
        let t = ParallelTemplate::new("t", vec![LoopDomain::new("i", "nx"), LoopDomain::new("j", "ny")]);
        let text = acc.begin_parallel_region(&mut RenderSession::new(), &[&a, &n], &t).unwrap();
        assert_eq!(
            text,
            "!$acc kernels deviceptr(a) \n\
             !$acc loop independent vector(CUDA_BLOCKSIZE_Y) \ndo j=1,ny\n \
             !$acc loop independent vector(CUDA_BLOCKSIZE_X) \ndo i=1,nx"
        );
    }

    #[test]
    fn four_dimensions_are_rejected() {
        let acc = OpenAccImplementation::new(OptionFlags::default());
        let a = device_array("a");
        let t = ParallelTemplate::new(
            "t",
            ["i", "j", "k", "l"].iter().map(|n| LoopDomain::new(n, "n")).collect(),
        );
        let e = acc.begin_parallel_region(&mut RenderSession::new(), &[&a], &t).unwrap_err();
        assert!(e.is_usage());
        assert_eq!(e.code, codes::UNSUPPORTED_DIMENSIONALITY);
    }

    #[test]
    fn end_closes_kernels_and_prints_kernel_values() {
        let flags = OptionFlags {
            debug_print: true,
            ..OptionFlags::default()
        };
        let acc = OpenAccImplementation::new(flags);
        let mut routine = Routine::new("step", "m", Rc::new(acc.clone()));
        let mut a = device_array("a");
        a.is_present = true;
        routine.add_symbol(a);
        let p = routine.add_parallel_region();
        routine.arena.load_line(p, "a = 0", &["a"]).unwrap();
        routine.add_region(RegionKind::Plain);

        let t = ParallelTemplate::new("t", vec![LoopDomain::new("i", "nx")]);
        let mut session = RenderSession::new();
        let text = acc.end_parallel_region(&mut session, &t, &routine).unwrap();
        assert!(text.starts_with("end do\n\n!$acc end kernels\n"));
        assert!(text.contains("!$acc update host(a)\n"));
        assert!(text.contains("'step_hfk0 a:'"));
        assert_eq!(session.kernel_index, 1);
    }

    #[test]
    fn file_preparation_adds_dummy_kernel() {
        let acc = OpenAccImplementation::new(OptionFlags::default());
        let text = acc.file_preparation("src/diffusion.h90");
        assert!(text.starts_with("#include \"storage_order.F90\"\n"));
        assert!(text.contains("subroutine HF_DUMMYKERNEL_diffusion()"));
    }

    #[test]
    fn declaration_end_declares_gpu_iterators_only() {
        let acc = OpenAccImplementation::new(OptionFlags::default());
        let mut cpu_only = ParallelTemplate::new("c", vec![LoopDomain::new("k", "nz")]);
        cpu_only.applies_to = vec!["CPU".to_string()];
        let gpu = ParallelTemplate::new("g", vec![LoopDomain::new("i", "nx")]);
        let text = acc
            .declaration_end(
                &mut RenderSession::new(),
                &mut [],
                false,
                &RoutineNode::new("r", "m"),
                &[cpu_only, gpu],
            )
            .unwrap();
        assert_eq!(text, "integer(4) :: i\n");
    }
}
