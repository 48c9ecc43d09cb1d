//! Per-datapoint transform pipelines
//!
//! A transform is a small, side-effect-free filter/projection language
//! applied to each datapoint of a range. A pipeline is a sequence of stages
//! separated by `|` or `:`; each stage either filters (`if expr`) or
//! projects (`expr`) the value carried through the pipeline. The carried
//! value starts as the datapoint's payload parsed as JSON.
//!
//! ```text
//! if get() < 5 : get() >= 3
//! if has("temperature") | get(temperature) * 1.8 + 32
//! ```
//!
//! Parsing is a hand-written lexer plus recursive descent with precedence
//! climbing. Named functions (`identifier(args...)`) resolve at parse time
//! from a process-wide registry that is populated at startup and read-only
//! afterwards. Evaluation is pure: no I/O, and the input datapoint is never
//! mutated. An evaluation failure drops that one datapoint and is recorded
//! on the iterator; iteration continues.

use crate::core::{Datapoint, Result};
use serde_json::Value;

pub mod ast;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod range;

pub use ast::{Expr, Pipeline, Stage};
pub use functions::{register_function, TransformFunction};
pub use range::TransformRange;

/// Parse a transform source string into an executable pipeline
pub fn parse(source: &str) -> Result<Pipeline> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_pipeline()
}

impl Pipeline {
    /// Run the pipeline over one value; `Ok(None)` means the value was
    /// dropped by an `if` stage
    pub fn apply_value(&self, input: &Value) -> Result<Option<Value>> {
        let mut current = input.clone();
        for stage in self.stages() {
            match stage {
                Stage::Filter(expr) => {
                    if !ast::truthy(&expr.eval(&current)?)? {
                        return Ok(None);
                    }
                }
                Stage::Map(expr) => {
                    current = expr.eval(&current)?;
                }
            }
        }
        Ok(Some(current))
    }

    /// Run the pipeline over one datapoint, interpreting its payload as a
    /// JSON document. Timestamp and sender pass through untouched.
    pub fn apply(&self, dp: &Datapoint) -> Result<Option<Datapoint>> {
        let input: Value = serde_json::from_slice(&dp.data).map_err(|e| {
            crate::core::Error::TransformEval(format!("payload is not valid JSON: {e}"))
        })?;
        match self.apply_value(&input)? {
            Some(out) => Ok(Some(Datapoint {
                timestamp: dp.timestamp,
                data: serde_json::to_vec(&out).map_err(|e| {
                    crate::core::Error::TransformEval(format!("unencodable result: {e}"))
                })?,
                sender: dp.sender.clone(),
            })),
            None => Ok(None),
        }
    }
}
