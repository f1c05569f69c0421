// hfc — Hybrid Fortran code generator
//
// Library root. Strategies live under `strategy`, the region tree and its
// rendering under `region` and `render`; `pipeline` drives one unit.

pub mod access;
pub mod config;
pub mod diag;
pub mod id;
pub mod lexer;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod region;
pub mod render;
pub mod routine;
pub mod spec_line;
pub mod strategy;
pub mod symbol;
pub mod template;
