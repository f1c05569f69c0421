// commons.rs — Text fragments shared by several strategies
//
// Routine naming, import statements, runtime debug output, device error
// checks and trace record/compare statements.

use sha2::{Digest, Sha256};

use super::Capabilities;
use crate::routine::RegionPosition;
use crate::symbol::Symbol;

pub const STORAGE_ORDER_INCLUDE: &str = "#include \"storage_order.F90\"\n";

/// Longest identifier the target language accepts.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

const DEVICE_ROUTINE_SUFFIX: &str = "_hfdev";
const KERNEL_SUFFIX: &str = "_hfk";
const FRAMEWORK_ARRAY_PREFIX: &str = "hfauto_";

// ── Naming ──────────────────────────────────────────────────────────────────

/// Shorten `name` deterministically when it exceeds the identifier limit.
pub fn limit_length(name: &str) -> String {
    if name.len() <= MAX_IDENTIFIER_LENGTH {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    let mut hash = String::with_capacity(8);
    for b in digest.iter().take(4) {
        use std::fmt::Write;
        let _ = write!(hash, "{:02x}", b);
    }
    let keep = MAX_IDENTIFIER_LENGTH - hash.len() - 1;
    let mut cut = keep;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &name[..cut], hash)
}

pub fn synthesized_host_routine_name(name: &str) -> String {
    name.to_string()
}

pub fn synthesized_device_routine_name(name: &str) -> String {
    limit_length(&format!("{}{}", name, DEVICE_ROUTINE_SUFFIX))
}

pub fn synthesized_kernel_name(name: &str, kernel_index: usize) -> String {
    limit_length(&format!("{}{}{}", name, KERNEL_SUFFIX, kernel_index))
}

pub fn is_kernel_name(name: &str) -> bool {
    name.contains(KERNEL_SUFFIX)
}

/// Name of the array that carries compacted scalars for `routine_name`.
pub fn framework_array_name(routine_name: &str) -> String {
    limit_length(&format!("{}{}", FRAMEWORK_ARRAY_PREFIX, routine_name))
}

/// Naming rule for strategies that duplicate routines into host and device
/// versions. Others keep every name.
pub fn adjusted_callee_name(
    callee_caps: &Capabilities,
    callee_name: &str,
    callee_position: RegionPosition,
    caller_caps: &Capabilities,
    caller_position: RegionPosition,
    callee_is_kernel_caller: bool,
) -> String {
    if !callee_caps.uses_duplicates_as_host_routines {
        return callee_name.to_string();
    }
    let callee_is_device_side = matches!(callee_position, RegionPosition::Outside | RegionPosition::Within);
    if (callee_is_device_side && caller_position == RegionPosition::None)
        || (!caller_caps.on_device && callee_position != RegionPosition::None)
    {
        return synthesized_host_routine_name(callee_name);
    }
    if callee_position == RegionPosition::Outside
        || callee_is_kernel_caller
        || (!is_kernel_name(callee_name) && callee_position == RegionPosition::Within)
    {
        return synthesized_device_routine_name(callee_name);
    }
    callee_name.to_string()
}

// ── Imports ─────────────────────────────────────────────────────────────────

pub fn module_import(module: &str) -> String {
    format!("use {}\n", module)
}

/// `use m, only: local => source` per symbol; device names unless `force_host`.
pub fn import_statements(symbols: &[&mut Symbol], force_host: bool) -> String {
    let mut result = String::new();
    for symbol in symbols {
        let module = symbol.source_module.as_deref().unwrap_or("");
        let local = symbol.name_in_scope(!force_host);
        let source = symbol.source_name_in_scope(!force_host);
        if local == source {
            result.push_str(&format!("use {}, only: {}\n", module, local));
        } else {
            result.push_str(&format!("use {}, only: {} => {}\n", module, local, source));
        }
    }
    result
}

// ── Allocation guards ───────────────────────────────────────────────────────

/// Runtime guard shared by allocation, copy-in, copy-out and deallocation of
/// one device array.
pub fn array_check_conditional(symbol: &Symbol) -> String {
    let host = symbol.host_name();
    if symbol.is_pointer {
        format!("if (associated({})) then", host)
    } else if symbol.is_allocatable || symbol.deferred_shape {
        format!("if (allocated({})) then", host)
    } else {
        "if (.TRUE.) then".to_string()
    }
}

// ── Runtime debug output ────────────────────────────────────────────────────

/// Value dumps for `symbols` after a kernel named `label` ran.
pub fn runtime_debug_print_statements(label: &str, symbols: &[&Symbol], use_openacc: bool) -> String {
    let mut sorted: Vec<&Symbol> = symbols.to_vec();
    sorted.sort_by(|a, b| a.cmp_declaration_order(b));
    let mut result = String::new();
    for symbol in sorted {
        let name = symbol.name_in_scope(true);
        if symbol.is_array() {
            if use_openacc && symbol.is_on_device && !symbol.is_using_device_postfix {
                result.push_str(&format!("!$acc update host({})\n", name));
            }
            result.push_str(&format!("hf_output_temp = sum(real({}, 8))\n", name));
            result.push_str(&format!(
                "write(0,*) '{} {}:', hf_output_temp\n",
                label, symbol.name
            ));
        } else {
            result.push_str(&format!("write(0,*) '{} {}:', {}\n", label, symbol.name, name));
        }
    }
    result
}

/// Synchronize and check the device error state after launching `kernel`.
pub fn cuda_error_handling(kernel: &str) -> String {
    format!(
        "cuerror = cudaDeviceSynchronize()\n\
         cuerror = cudaGetLastError()\n\
         if(cuerror .NE. cudaSuccess) then\n\
         \twrite(0, *) 'CUDA error in kernel {}:', cudaGetErrorString(cuerror)\n\
         \tstop 1\n\
         end if\n",
        kernel
    )
}

// ── Tracing ─────────────────────────────────────────────────────────────────

/// Which end of a subroutine a trace file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    Begin,
    End,
}

impl TracePoint {
    fn as_str(self) -> &'static str {
        match self {
            TracePoint::Begin => "begin",
            TracePoint::End => "end",
        }
    }
}

/// Symbols eligible for tracing: numeric data, no type parameters, not packed.
pub fn traceable_symbols(symbols: &[&mut Symbol]) -> Vec<Symbol> {
    let mut traced: Vec<Symbol> = symbols
        .iter()
        .filter(|s| !s.is_type_parameter && !s.is_compacted)
        .filter(|s| {
            let t = s.declaration_directives().to_ascii_lowercase();
            t.starts_with("real") || t.starts_with("integer") || t.starts_with("double")
        })
        .map(|s| (**s).clone())
        .collect();
    traced.sort_by(|a, b| a.cmp_declaration_order(b));
    traced
}

/// Declarations of the temporaries used to record or compare `traced`.
pub fn tracing_declarations(traced: &[Symbol], with_comparison: bool) -> String {
    let mut result = String::new();
    result.push_str("integer(4), save :: hf_tracing_counter = 0\n");
    result.push_str("character(len=256) :: hf_tracing_current_path\n");
    for symbol in traced {
        let type_spec = &symbol.type_spec;
        let shape = temporary_shape(symbol);
        let allocatable = if symbol.is_array() { ", allocatable" } else { "" };
        result.push_str(&format!(
            "{}{} :: hf_tracing_temp_{}{}\n",
            type_spec, allocatable, symbol.name, shape
        ));
        if with_comparison {
            result.push_str(&format!(
                "{}{} :: hf_tracing_comparison_{}{}\n",
                type_spec, allocatable, symbol.name, shape
            ));
        }
    }
    result
}

fn temporary_shape(symbol: &Symbol) -> String {
    if !symbol.is_array() {
        return String::new();
    }
    format!("({})", vec![":"; symbol.domains.len()].join(","))
}

pub fn tracing_filename(module: &str, routine: &str, symbol: &str, point: TracePoint) -> String {
    format!("{}_{}_{}_{}", module, routine, symbol, point.as_str())
}

fn trace_path_statement(module: &str, routine: &str, symbol: &Symbol, point: TracePoint) -> String {
    format!(
        "write(hf_tracing_current_path, '(A,I3.3,A)') './datatrace/{}', hf_tracing_counter, '.dat'\n",
        tracing_filename(module, routine, &symbol.name, point)
    )
}

/// Write the current value of `symbol` to its trace file.
pub fn record_trace(module: &str, routine: &str, symbol: &Symbol, point: TracePoint) -> String {
    format!(
        "hf_tracing_temp_{name} = {value}\n{path}call writeToFile(hf_tracing_current_path, hf_tracing_temp_{name})\n",
        name = symbol.name,
        value = symbol.host_name(),
        path = trace_path_statement(module, routine, symbol, point),
    )
}

/// Read the recorded value of `symbol` and report deviations from it.
pub fn compare_trace(module: &str, routine: &str, symbol: &Symbol, point: TracePoint, checkpoint: &str) -> String {
    let name = &symbol.name;
    let elements = if symbol.is_array() {
        format!("size(hf_tracing_temp_{})", name)
    } else {
        "1".to_string()
    };
    let mut result = trace_path_statement(module, routine, symbol, point);
    result.push_str(&format!(
        "call readFromFile(hf_tracing_current_path, hf_tracing_comparison_{})\n",
        name
    ));
    result.push_str(&format!("hf_tracing_temp_{} = {}\n", name, symbol.name_in_scope(true)));
    result.push_str(&format!("hf_num_of_elements = {}\n", elements));
    result.push_str(&format!(
        "hf_mean_ref = sum(real(hf_tracing_comparison_{}, 8)) / hf_num_of_elements\n",
        name
    ));
    result.push_str(&format!(
        "hf_mean_gpu = sum(real(hf_tracing_temp_{}, 8)) / hf_num_of_elements\n",
        name
    ));
    result.push_str(&format!(
        "hf_tracing_error = sqrt(sum((real(hf_tracing_temp_{n}, 8) - real(hf_tracing_comparison_{n}, 8))**2) / hf_num_of_elements)\n",
        n = name
    ));
    result.push_str("if (hf_tracing_error .GT. 1.0d-8) then\n");
    result.push_str(&format!(
        "write(0,*) 'In module {}, subroutine {}, checkpoint {}: error in {}', hf_tracing_error, hf_mean_ref, hf_mean_gpu\n",
        module, routine, checkpoint, name
    ));
    result.push_str("hf_tracing_error_found = .true.\n");
    result.push_str("end if\n");
    result
}

/// Checkpoint label plus one trace statement per symbol.
pub fn tracing_statements<F>(
    routine: &str,
    symbols: &[&Symbol],
    checkpoint: &str,
    increment_counter: bool,
    statement: F,
) -> String
where
    F: Fn(&Symbol) -> String,
{
    let mut result = format!("! tracing checkpoint {} {}\n", routine, checkpoint);
    for symbol in symbols {
        result.push_str(&statement(symbol));
    }
    if increment_counter {
        result.push_str("hf_tracing_counter = hf_tracing_counter + 1\n");
    }
    result
}
