// access.rs — Access-expression synthesis
//
// Rewrites the symbol references of one statement into the form the active
// strategy needs: device names for device-resident data and, inside a
// parallel construct, full index expressions with the loop iterators placed
// at the positions of the parallel dimensions.
//
// Preconditions: `iterators` are the iterators of the enclosing template, or
//   empty outside parallel constructs.
// Postconditions: text outside symbol references is reproduced byte for byte.
// Failure modes: wrong number of indices (usage error U0007),
//   device-postfixed symbol that is not device resident inside a kernel
//   (internal error I0006).
// Side effects: none.

use crate::diag::{codes, GenError, GenResult};
use crate::lexer;
use crate::symbol::Symbol;

/// Where a statement is rendered.
#[derive(Debug, Clone, Copy)]
pub struct AccessContext<'a> {
    pub iterators: &'a [String],
    /// Render device names for device-resident symbols.
    pub use_device: bool,
    /// The statement runs inside a device kernel.
    pub in_kernel: bool,
}

impl AccessContext<'static> {
    pub fn host() -> Self {
        AccessContext {
            iterators: &[],
            use_device: false,
            in_kernel: false,
        }
    }
}

/// Rewrite every reference to one of `symbols` in `line`.
///
/// `is_call_argument` keeps bare arrays bare so whole arrays can be passed on.
pub fn implement_line(
    line: &str,
    symbols: &[&Symbol],
    ctx: &AccessContext<'_>,
    is_call_argument: bool,
) -> GenResult<String> {
    let bare_allowed = is_call_argument || lexer::is_pointer_assignment(line);
    let mut out = String::with_capacity(line.len());
    let mut cursor = 0;
    for span in lexer::identifier_spans(line) {
        if span.start < cursor {
            continue;
        }
        let ident = &line[span.start..span.end];
        let symbol = match symbols.iter().find(|s| s.name.eq_ignore_ascii_case(ident)) {
            Some(s) => *s,
            None => continue,
        };
        out.push_str(&line[cursor..span.start]);
        let (accessor, end) = accessor_after(line, span.end, symbol)?;
        let accessor = match accessor {
            Some(inner) => Some(implement_line(inner, symbols, ctx, false)?),
            None => None,
        };
        out.push_str(&access_representation(symbol, accessor.as_deref(), ctx, bare_allowed)?);
        cursor = end;
    }
    out.push_str(&line[cursor..]);
    Ok(out)
}

/// The parenthesized accessor directly after `pos`, and the offset after it.
fn accessor_after<'l>(line: &'l str, pos: usize, symbol: &Symbol) -> GenResult<(Option<&'l str>, usize)> {
    let rest = &line[pos..];
    let skipped = rest.len() - rest.trim_start().len();
    if !rest[skipped..].starts_with('(') {
        return Ok((None, pos));
    }
    let open = pos + skipped;
    let mut depth = 0usize;
    for (offset, c) in line[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let close = open + offset;
                    return Ok((Some(&line[open + 1..close]), close + 1));
                }
            }
            _ => {}
        }
    }
    Err(GenError::usage(
        codes::INVALID_ACCESS,
        format!("unbalanced accessor for {} in '{}'", symbol.name, line.trim()),
    ))
}

/// Split an accessor at its top-level commas.
pub fn split_arguments(text: &str) -> Vec<&str> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts
}

/// Access expression for one reference to `symbol`.
pub fn access_representation(
    symbol: &Symbol,
    accessor: Option<&str>,
    ctx: &AccessContext<'_>,
    bare_allowed: bool,
) -> GenResult<String> {
    if ctx.use_device
        && ctx.in_kernel
        && symbol.is_array()
        && symbol.is_using_device_postfix
        && !symbol.is_on_device
    {
        return Err(GenError::internal(
            codes::INCONSISTENT_RESIDENCY,
            format!(
                "{} uses a device name but is not device resident ({:?})",
                symbol.name, symbol.declaration_type
            ),
        ));
    }
    let name = symbol.name_in_scope(ctx.use_device);
    if !symbol.is_array() || ctx.iterators.is_empty() {
        return Ok(match accessor {
            Some(a) => format!("{}({})", name, a),
            None => name,
        });
    }

    let slots: Vec<Option<&String>> = symbol
        .domains
        .iter()
        .map(|d| ctx.iterators.iter().find(|it| it.eq_ignore_ascii_case(&d.name)))
        .collect();
    let total = slots.len();
    let parallel = slots.iter().filter(|s| s.is_some()).count();

    match accessor {
        None if bare_allowed || parallel == 0 => Ok(name),
        None if parallel == total => {
            let indices: Vec<&str> = slots.iter().flatten().map(|s| s.as_str()).collect();
            Ok(format!("{}({})", name, indices.join(",")))
        }
        None => Err(wrong_index_count(symbol, 0, total, total - parallel)),
        Some(a) => {
            let given = split_arguments(a);
            if given.len() == total {
                return Ok(format!("{}({})", name, a));
            }
            if given.len() != total - parallel {
                return Err(wrong_index_count(symbol, given.len(), total, total - parallel));
            }
            let mut given = given.into_iter();
            let mut indices: Vec<&str> = Vec::with_capacity(total);
            for slot in &slots {
                match slot {
                    Some(iterator) => indices.push(iterator.as_str()),
                    None => indices.push(given.next().unwrap_or_default()),
                }
            }
            Ok(format!("{}({})", name, indices.join(",")))
        }
    }
}

fn wrong_index_count(symbol: &Symbol, given: usize, total: usize, non_parallel: usize) -> GenError {
    GenError::usage(
        codes::INVALID_ACCESS,
        format!(
            "{} is accessed with {} indices; expected {} (all dimensions) or {} (non-parallel dimensions)",
            symbol.name, given, total, non_parallel
        ),
    )
}

/// Element seen by the first thread: iterators in parallel dimensions, `1` elsewhere.
pub fn first_thread_access(symbol: &Symbol, iterators: &[String]) -> String {
    let name = symbol.name_in_scope(true);
    if !symbol.is_array() {
        return name;
    }
    let indices: Vec<&str> = symbol
        .domains
        .iter()
        .map(|d| {
            iterators
                .iter()
                .find(|it| it.eq_ignore_ascii_case(&d.name))
                .map(String::as_str)
                .unwrap_or("1")
        })
        .collect();
    format!("{}({})", name, indices.join(","))
}
