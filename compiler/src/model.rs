// model.rs — Input description of one annotated compilation unit
//
// The region tree of every routine, the annotated symbols and the parallel
// templates, as produced by the source analysis that runs before generation.
// The model is plain data; `pipeline` turns it into routines.
//
// Preconditions: none.
// Postconditions: `UnitModel::from_json` returns a structurally valid unit.
// Failure modes: malformed JSON, parallel regions nested in parallel regions,
//   specification blocks that are not the first region (usage errors).
// Side effects: none.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, GenError, GenResult};
use crate::symbol::Symbol;
use crate::template::ParallelTemplate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitModel {
    /// Name of the source file the unit was read from.
    pub filename: String,
    pub modules: Vec<ModuleModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleModel {
    pub name: String,
    #[serde(default)]
    pub specification: Vec<LineModel>,
    /// Symbols declared at module scope.
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub routines: Vec<RoutineModel>,
}

/// One statement and the names of the annotated symbols it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineModel {
    pub text: String,
    #[serde(default)]
    pub symbols: Vec<String>,
}

impl LineModel {
    pub fn new(text: &str, symbols: &[&str]) -> Self {
        LineModel {
            text: text.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn symbol_refs(&self) -> Vec<&str> {
        self.symbols.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineModel {
    pub name: String,
    /// Node attributes, e.g. `parallelRegionPosition`.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Dummy arguments as written.
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub body: Vec<RegionModel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionModel {
    Specification {
        #[serde(default)]
        lines: Vec<LineModel>,
        /// `data` statements, re-emitted after the declarations.
        #[serde(default)]
        data_lines: Vec<String>,
    },
    Plain {
        #[serde(default)]
        lines: Vec<LineModel>,
    },
    Parallel {
        #[serde(default)]
        template: Option<ParallelTemplate>,
        #[serde(default)]
        sub_regions: Vec<RegionModel>,
    },
    Call {
        callee: String,
        #[serde(default)]
        arguments: Vec<String>,
    },
    EarlyExit {
        #[serde(default)]
        lines: Vec<LineModel>,
    },
}

impl RegionModel {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RegionModel::Specification { .. } => "specification",
            RegionModel::Plain { .. } => "plain",
            RegionModel::Parallel { .. } => "parallel",
            RegionModel::Call { .. } => "call",
            RegionModel::EarlyExit { .. } => "early_exit",
        }
    }
}

impl UnitModel {
    pub fn from_json(text: &str) -> GenResult<UnitModel> {
        let unit: UnitModel = serde_json::from_str(text)
            .map_err(|e| GenError::usage(codes::MALFORMED_UNIT, format!("invalid unit description: {}", e)))?;
        unit.validate()?;
        Ok(unit)
    }

    /// Structural checks the type system does not express.
    pub fn validate(&self) -> GenResult<()> {
        for module in &self.modules {
            for routine in &module.routines {
                validate_body(routine).map_err(|e| {
                    e.with_context(format!("In subroutine {} of module {}", routine.name, module.name))
                })?;
            }
        }
        Ok(())
    }
}

fn validate_body(routine: &RoutineModel) -> GenResult<()> {
    for (n, region) in routine.body.iter().enumerate() {
        match region {
            RegionModel::Specification { .. } if n != 0 => {
                return Err(GenError::usage(
                    codes::MALFORMED_UNIT,
                    "the specification block must be the first region of a subroutine",
                ))
            }
            RegionModel::Parallel { sub_regions, .. } => {
                if let Some(nested) = sub_regions
                    .iter()
                    .find(|r| !matches!(r, RegionModel::Plain { .. } | RegionModel::Call { .. }))
                {
                    return Err(GenError::usage(
                        codes::MALFORMED_UNIT,
                        format!(
                            "a parallel region may only contain statements and calls, found a {} region",
                            nested.kind_name()
                        ),
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_regions() {
        let unit = UnitModel::from_json(
            r#"{
              "filename": "diffusion.h90",
              "modules": [{
                "name": "diffusion",
                "routines": [{
                  "name": "step",
                  "attributes": {"parallelRegionPosition": "within"},
                  "arguments": ["a"],
                  "symbols": [{"name": "a", "type_spec": "real(8)",
                               "domains": [{"name": "i", "size": "n"}],
                               "declaration_type": "local_array"}],
                  "body": [
                    {"kind": "specification", "lines": [{"text": "real(8) :: a(n)", "symbols": ["a"]}]},
                    {"kind": "parallel",
                     "template": {"id": "t", "domains": [{"name": "i", "size": "n"}]},
                     "sub_regions": [{"kind": "plain", "lines": [{"text": "a = 0", "symbols": ["a"]}]}]},
                    {"kind": "call", "callee": "halo", "arguments": ["a"]}
                  ]
                }]
              }]
            }"#,
        )
        .unwrap();
        let routine = &unit.modules[0].routines[0];
        assert_eq!(routine.body.len(), 3);
        assert_eq!(routine.symbols[0].domains[0].size, "n");
        match &routine.body[1] {
            RegionModel::Parallel { template, sub_regions } => {
                assert_eq!(template.as_ref().map(|t| t.id.as_str()), Some("t"));
                assert_eq!(sub_regions.len(), 1);
            }
            other => panic!("unexpected region {:?}", other),
        }
    }

    #[test]
    fn nested_parallel_regions_are_rejected() {
        let e = UnitModel::from_json(
            r#"{"filename": "x.h90", "modules": [{"name": "m", "routines": [{"name": "r", "body": [
                {"kind": "parallel", "sub_regions": [{"kind": "parallel"}]}
            ]}]}]}"#,
        )
        .unwrap_err();
        assert_eq!(e.code, codes::MALFORMED_UNIT);
        assert!(e.message.contains("found a parallel region"));
    }

    #[test]
    fn late_specification_is_rejected() {
        let e = UnitModel::from_json(
            r#"{"filename": "x.h90", "modules": [{"name": "m", "routines": [{"name": "r", "body": [
                {"kind": "plain"}, {"kind": "specification"}
            ]}]}]}"#,
        )
        .unwrap_err();
        assert!(e.is_usage());
    }

    #[test]
    fn invalid_json_is_usage_error() {
        let e = UnitModel::from_json("{").unwrap_err();
        assert_eq!(e.code, codes::MALFORMED_UNIT);
    }
}
