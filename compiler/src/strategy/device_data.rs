// device_data.rs — Residency bookkeeping shared by the device strategies
//
// Preconditions: symbols passed together stem from one declaration line.
// Postconditions: after `update_device_state`, `is_on_device` and
//   `is_using_device_postfix` reflect the region being rendered.
// Failure modes: declaration lines mixing present / transfer / host arrays or
//   type parameters with other symbols (usage error U0002).
// Side effects: residency flags of the passed symbols.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::commons;
use super::{Capabilities, RegionType, RenderSession};
use crate::diag::{codes, GenError, GenResult};
use crate::routine::RegionPosition;
use crate::spec_line;
use crate::symbol::{DeclarationType, Intent, Symbol};

const DECLARATION_PURGE: [&str; 4] = ["intent", "dimension", "save", "optional"];

/// Residency transition of one symbol. The rules are checked in order and
/// the first array rule that matches wins.
pub(crate) fn update_device_state(
    caps: &Capabilities,
    symbol: &mut Symbol,
    used_in_kernel: Option<&BTreeSet<String>>,
    region_type: RegionType,
    position: RegionPosition,
    post_transfer: bool,
) {
    debug!(
        symbol = %symbol.name,
        on_device = symbol.is_on_device,
        postfix = symbol.is_using_device_postfix,
        "device state before update"
    );

    // 1. packed into a framework array
    if symbol.is_compacted {
        return;
    }
    // 2. explicit host data where host code may run next to kernels
    if caps.allows_mixed_host_and_device_code && symbol.is_host_symbol {
        return;
    }
    // 3. anything seen from device code is already there
    if position.is_device_side() {
        symbol.is_present = true;
        symbol.is_to_be_transfered = false;
    }

    if !symbol.is_array() {
        // 4. passed-in scalars
        if position.is_device_side() && !symbol.intent.is_output() && symbol.intent != Intent::Local {
            symbol.is_on_device = true;
        }
    } else if symbol.is_host_symbol && region_type == RegionType::ModuleDeclaration {
        // 5a. device shadow is declared, data not there yet
        symbol.is_using_device_postfix = true;
        symbol.is_on_device = false;
    } else if symbol.is_host_symbol
        && region_type == RegionType::KernelCallerDeclaration
        && used_in_kernel.map_or(true, |names| names.contains(&symbol.name))
    {
        // 5b. transfer handled by the programmer around the launch
        symbol.is_using_device_postfix = true;
        symbol.is_on_device = true;
    } else if symbol.is_host_symbol {
        // 5c
        symbol.is_using_device_postfix = false;
        symbol.is_on_device = false;
    } else if symbol.declaration_type == DeclarationType::ModuleArray && position != RegionPosition::None {
        // 5d. imported module data
        symbol.is_using_device_postfix = true;
        symbol.is_on_device = true;
    } else if symbol.is_present
        || (symbol.intent.is_local_like() && region_type == RegionType::KernelCallerDeclaration)
    {
        // 5e
        symbol.is_using_device_postfix = false;
        symbol.is_on_device = true;
    } else if symbol.is_to_be_transfered || region_type == RegionType::KernelCallerDeclaration {
        // 5f
        symbol.is_using_device_postfix = post_transfer;
        symbol.is_on_device = post_transfer;
    }

    debug!(
        symbol = %symbol.name,
        on_device = symbol.is_on_device,
        postfix = symbol.is_using_device_postfix,
        "device state after update"
    );
}

/// Residency of the arrays of one declaration line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LineResidency {
    pub present: Option<bool>,
    pub transfer: Option<bool>,
    pub host: Option<bool>,
}

fn uniform<F>(symbols: &[&mut Symbol], label: &str, flag: F) -> GenResult<Option<bool>>
where
    F: Fn(&Symbol) -> bool,
{
    let mut seen: Option<bool> = None;
    for symbol in symbols.iter().filter(|s| s.is_array()) {
        let value = flag(symbol);
        match seen {
            None => seen = Some(value),
            Some(v) if v != value => {
                let listing: Vec<String> = symbols
                    .iter()
                    .filter(|s| s.is_array())
                    .map(|s| format!("{}: {}", s.name, flag(s)))
                    .collect();
                return Err(GenError::usage(
                    codes::MIXED_DECLARATION_LINE,
                    format!("line contains a mix of {} arrays ({})", label, listing.join(", ")),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(seen)
}

fn names_where<F>(symbols: &[&mut Symbol], flag: F) -> String
where
    F: Fn(&Symbol) -> bool,
{
    symbols
        .iter()
        .filter(|s| s.is_array() && flag(s))
        .map(|s| s.name.clone())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Arrays on one line must agree on present, transfer and host flags, and
/// type parameters cannot share a line with other symbols.
pub(crate) fn check_declaration_conformity(symbols: &[&mut Symbol]) -> GenResult<LineResidency> {
    let residency = LineResidency {
        present: uniform(symbols, "present / non present", |s| s.is_present)?,
        transfer: uniform(symbols, "transferHere / non transferHere", |s| s.is_to_be_transfered)?,
        host: uniform(symbols, "host / non host", |s| s.is_host_symbol)?,
    };
    let conflicts = [
        (residency.transfer, residency.present, "transferHere", "present"),
        (residency.transfer, residency.host, "transferHere", "host"),
        (residency.present, residency.host, "present", "host"),
    ];
    for (a, b, a_label, b_label) in conflicts {
        if a == Some(true) && b == Some(true) {
            return Err(GenError::usage(
                codes::MIXED_DECLARATION_LINE,
                format!(
                    "symbols with '{}' attribute cannot appear on the same line as symbols with '{}' attribute ({}: {}; {}: {})",
                    a_label,
                    b_label,
                    a_label,
                    names_where(symbols, |s| flag_by_label(s, a_label)),
                    b_label,
                    names_where(symbols, |s| flag_by_label(s, b_label)),
                ),
            ));
        }
    }
    if let Some(first) = symbols.first() {
        if symbols.iter().any(|s| s.is_type_parameter != first.is_type_parameter) {
            let listing: Vec<String> = symbols
                .iter()
                .map(|s| format!("{}: {}", s.name, s.is_type_parameter))
                .collect();
            return Err(GenError::usage(
                codes::MIXED_DECLARATION_LINE,
                format!(
                    "line contains a mix of type parameter / non type parameter symbols ({})",
                    listing.join(", ")
                ),
            ));
        }
    }
    Ok(residency)
}

fn flag_by_label(symbol: &Symbol, label: &str) -> bool {
    match label {
        "present" => symbol.is_present,
        "host" => symbol.is_host_symbol,
        _ => symbol.is_to_be_transfered,
    }
}

fn device_declarations(symbols: &[&mut Symbol], directives: &str) -> String {
    let allocatable = spec_line::has_attribute(directives, "allocatable") || spec_line::has_attribute(directives, "pointer");
    symbols
        .iter()
        .map(|symbol| {
            let extra = if symbol.has_undecided_domain_sizes() && !allocatable {
                ", allocatable"
            } else {
                ""
            };
            format!("{}{}, device :: {}", directives, extra, symbol.domain_representation())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Device form of one declaration line.
pub(crate) fn adjust_declaration(
    caps: &Capabilities,
    line: &str,
    symbols: &mut [&mut Symbol],
    used_in_kernels: Option<&BTreeSet<String>>,
    region_type: RegionType,
    position: RegionPosition,
) -> GenResult<String> {
    if symbols.is_empty() {
        return Err(GenError::internal(
            codes::UNMATCHED_SPECIFICATION,
            format!("no symbols to adjust in '{}'", line.trim()),
        ));
    }
    for symbol in symbols.iter_mut() {
        if matches!(
            region_type,
            RegionType::ModuleDeclaration | RegionType::KernelCallerDeclaration
        ) || symbol.is_to_be_transfered
        {
            update_device_state(caps, symbol, used_in_kernels, region_type, position, true);
        }
    }
    let residency = check_declaration_conformity(symbols).map_err(|e| e.with_context(format!("In {}", line.trim())))?;

    let first_is_array = symbols[0].is_array();
    let mut purge: Vec<&str> = DECLARATION_PURGE.to_vec();
    if first_is_array {
        purge.push("parameter");
    }
    let split = spec_line::split_and_purge_specification(line, &purge)?;
    let intent = symbols[0].intent;

    if symbols[0].is_compacted {
        return Ok(format!("{} :: {}\n", split.purged_directives, split.entity_text));
    }

    let mut adjusted = line.trim_end().to_string();
    if position == RegionPosition::Within && !first_is_array {
        let is_character = split.purged_directives.to_ascii_lowercase().contains("character");
        if (!intent.is_output() || !caps.assignment_to_scalars_in_kernels_allowed) && !is_character {
            adjusted = format!("{}, value :: {}", split.purged_directives, split.entity_text);
        } else {
            adjusted = format!("{}, intent({}) :: {}", split.purged_directives, intent, split.entity_text);
        }
    } else if first_is_array {
        if residency.present == Some(true)
            || (intent.is_local_like() && region_type == RegionType::KernelCallerDeclaration)
        {
            let directives = if position.is_device_side() {
                &split.purged_directives
            } else {
                &split.all_directives
            };
            adjusted = device_declarations(symbols, directives);
        } else if residency.transfer == Some(true)
            || matches!(
                region_type,
                RegionType::KernelCallerDeclaration | RegionType::ModuleDeclaration
            )
        {
            adjusted.push('\n');
            adjusted.push_str(&device_declarations(symbols, &split.purged_directives));
        }
    }
    adjusted.push('\n');
    Ok(adjusted)
}

fn needs_device_management(symbol: &Symbol) -> bool {
    symbol.is_array() && symbol.is_on_device && !symbol.is_present
}

fn guarded(symbol: &Symbol, statement: &str) -> String {
    format!("{}\n{}\nend if\n", commons::array_check_conditional(symbol), statement)
}

/// Host and device whole-array sections of `symbol`.
fn host_and_device_sections(symbol: &mut Symbol) -> (String, String) {
    symbol.is_using_device_postfix = false;
    let host = symbol.select_all_representation();
    symbol.is_using_device_postfix = true;
    let device = symbol.select_all_representation();
    (host, device)
}

/// Device allocation and copy-in after the declarations.
pub(crate) fn declaration_end(
    session: &mut RenderSession,
    symbols: &mut [&mut Symbol],
    is_kernel_caller: bool,
) -> GenResult<String> {
    session.kernel_index = 0;
    let mut result = String::new();
    for symbol in symbols.iter_mut() {
        if !needs_device_management(symbol) {
            continue;
        }
        let managed_here = is_kernel_caller || symbol.is_to_be_transfered;
        let sizes_known = !symbol.has_unknown_size();
        if managed_here && symbol.has_undecided_domain_sizes() && sizes_known {
            if !symbol.is_to_be_transfered {
                info!(
                    symbol = %symbol.name,
                    routine = %session.routine_name(),
                    "generating implicit device data allocation"
                );
            }
            let allocation = symbol.allocation_representation().map_err(|e| {
                e.with_context(format!(
                    "kernel caller: {}, to be transferred: {}",
                    is_kernel_caller, symbol.is_to_be_transfered
                ))
            })?;
            result.push_str(&guarded(symbol, &format!("allocate({})", allocation)));
        }
        let copy_in = symbol.intent.is_input() || symbol.declaration_type == DeclarationType::ModuleArray;
        if copy_in && managed_here {
            if sizes_known {
                let (host, device) = host_and_device_sections(symbol);
                result.push_str(&guarded(symbol, &format!("{} = {}", device, host)));
            }
        } else if managed_here {
            result.push_str(&format!("{} = 0\n", symbol.select_all_representation()));
        }
    }
    Ok(result)
}

/// Copy-out and deallocation before the routine returns.
pub(crate) fn exit_point(symbols: &mut [&mut Symbol], is_kernel_caller: bool) -> String {
    let mut result = String::new();
    for symbol in symbols.iter_mut() {
        if !needs_device_management(symbol) {
            continue;
        }
        let managed_here = is_kernel_caller || symbol.is_to_be_transfered;
        let sizes_known = !symbol.has_unknown_size();
        let copy_out = symbol.intent.is_output() || symbol.declaration_type == DeclarationType::ModuleArray;
        if copy_out && managed_here && sizes_known {
            let (host, device) = host_and_device_sections(symbol);
            result.push_str(&guarded(symbol, &format!("{} = {}", host, device)));
        }
        if managed_here && symbol.has_undecided_domain_sizes() && sizes_known {
            result.push_str(&guarded(symbol, &format!("deallocate({})", symbol.name_in_scope(true))));
        }
    }
    result
}
