//! Expression evaluator.
//!
//! Evaluates parsed guard expressions against a run-context scope. The
//! evaluator is total and bounded: every call runs under a step budget and
//! a wall-clock deadline, so a hostile or degenerate expression cannot stall
//! the dispatcher.

use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::parser::{self, BinaryOp, Builtin, Expr, Literal, PathExpr, PathRoot, Segment, UnaryOp};

/// Hard ceiling on AST nodes visited per evaluation.
const MAX_EVAL_STEPS: u32 = 4_096;

/// Wall-clock ceiling per evaluation call.
const EVAL_DEADLINE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("expression parse error: {0}")]
    Parse(#[from] parser::ParseError),

    #[error("unresolved reference '{0}'")]
    Unresolved(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivideByZero,

    #[error("evaluation budget exceeded")]
    BudgetExceeded,
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Read-only view of the run context namespaces an expression may touch.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub inputs: &'a Value,
    pub vars: &'a serde_json::Map<String, Value>,
    pub globals: &'a serde_json::Map<String, Value>,
    pub node_outputs: &'a std::collections::HashMap<String, Value>,
}

impl<'a> Scope<'a> {
    fn root(&self, root: &PathRoot) -> EvalResult<Value> {
        match root {
            PathRoot::Inputs => Ok(self.inputs.clone()),
            PathRoot::Vars => Ok(Value::Object(self.vars.clone())),
            PathRoot::Globals => Ok(Value::Object(self.globals.clone())),
            PathRoot::NodeOutputs(id) => self
                .node_outputs
                .get(id)
                .cloned()
                .ok_or_else(|| EvalError::Unresolved(format!("node[{id}].outputs"))),
        }
    }
}

struct Budget {
    steps: u32,
    deadline: Instant,
}

impl Budget {
    fn new() -> Self {
        Self {
            steps: MAX_EVAL_STEPS,
            deadline: Instant::now() + EVAL_DEADLINE,
        }
    }

    fn spend(&mut self) -> EvalResult<()> {
        if self.steps == 0 || Instant::now() >= self.deadline {
            return Err(EvalError::BudgetExceeded);
        }
        self.steps -= 1;
        Ok(())
    }
}

/// Parse and evaluate an expression source string.
pub fn eval_str(source: &str, scope: &Scope<'_>) -> EvalResult<Value> {
    let expr = parser::parse(source)?;
    eval(&expr, scope)
}

/// Parse and evaluate, then coerce to a boolean.
///
/// Guards must produce real booleans; any other type is a type error rather
/// than a silent truthiness coercion.
pub fn eval_bool(source: &str, scope: &Scope<'_>) -> EvalResult<bool> {
    match eval_str(source, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Type(format!(
            "guard expression must evaluate to a boolean, got {}",
            type_name(&other)
        ))),
    }
}

/// Evaluate a parsed expression.
pub fn eval(expr: &Expr, scope: &Scope<'_>) -> EvalResult<Value> {
    let mut budget = Budget::new();
    eval_inner(expr, scope, &mut budget)
}

fn eval_inner(expr: &Expr, scope: &Scope<'_>, budget: &mut Budget) -> EvalResult<Value> {
    budget.spend()?;
    match expr {
        Expr::Literal(lit) => Ok(literal_value(lit)),
        Expr::Path(path) => resolve_path(path, scope),
        Expr::Unary { op, operand } => {
            let value = eval_inner(operand, scope, budget)?;
            apply_unary(*op, &value)
        }
        Expr::Binary { op, left, right } => match op {
            // Short-circuit connectives evaluate the right side lazily.
            BinaryOp::And => {
                if !expect_bool(&eval_inner(left, scope, budget)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(expect_bool(&eval_inner(right, scope, budget)?)?))
            }
            BinaryOp::Or => {
                if expect_bool(&eval_inner(left, scope, budget)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(expect_bool(&eval_inner(right, scope, budget)?)?))
            }
            _ => {
                let lhs = eval_inner(left, scope, budget)?;
                let rhs = eval_inner(right, scope, budget)?;
                apply_binary(*op, &lhs, &rhs)
            }
        },
        Expr::Call { func, arg } => {
            let value = eval_inner(arg, scope, budget)?;
            match func {
                Builtin::Len => match &value {
                    Value::String(s) => Ok(Value::Number(s.chars().count().into())),
                    Value::Array(items) => Ok(Value::Number(items.len().into())),
                    Value::Object(map) => Ok(Value::Number(map.len().into())),
                    other => Err(EvalError::Type(format!(
                        "len() expects string, array, or object, got {}",
                        type_name(other)
                    ))),
                },
                Builtin::IsNull => Ok(Value::Bool(value.is_null())),
            }
        }
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(i) => Value::Number((*i).into()),
        Literal::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Literal::Str(s) => Value::String(s.clone()),
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Null => Value::Null,
    }
}

fn resolve_path(path: &PathExpr, scope: &Scope<'_>) -> EvalResult<Value> {
    let mut current = scope.root(&path.root)?;
    for segment in &path.segments {
        current = match (&current, segment) {
            (Value::Object(map), Segment::Key(key)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| EvalError::Unresolved(display_path(path)))?,
            (Value::Array(items), Segment::Index(i)) => {
                let idx = normalize_index(*i, items.len())
                    .ok_or_else(|| EvalError::Unresolved(display_path(path)))?;
                items[idx].clone()
            }
            _ => return Err(EvalError::Unresolved(display_path(path))),
        };
    }
    Ok(current)
}

/// Negative indices count from the end, Python-style.
fn normalize_index(i: i64, len: usize) -> Option<usize> {
    if i >= 0 {
        let idx = i as usize;
        (idx < len).then_some(idx)
    } else {
        let back = i.unsigned_abs() as usize;
        (back <= len).then(|| len - back)
    }
}

fn display_path(path: &PathExpr) -> String {
    let mut out = match &path.root {
        PathRoot::Inputs => "inputs".to_string(),
        PathRoot::Vars => "vars".to_string(),
        PathRoot::Globals => "globals".to_string(),
        PathRoot::NodeOutputs(id) => format!("node[{id}].outputs"),
    };
    for segment in &path.segments {
        match segment {
            Segment::Key(k) => {
                out.push('.');
                out.push_str(k);
            }
            Segment::Index(i) => out.push_str(&format!("[{i}]")),
        }
    }
    out
}

fn apply_unary(op: UnaryOp, value: &Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!expect_bool(value)?)),
        UnaryOp::Neg => match as_f64(value) {
            Some(f) => num_value(-f, value),
            None => Err(EvalError::Type(format!(
                "cannot negate {}",
                type_name(value)
            ))),
        },
    }
}

fn apply_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(json_eq(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!json_eq(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (a, b) = numeric_pair(op, lhs, rhs)?;
            let result = match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numeric_pair(op, lhs, rhs)?;
            if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b == 0.0 {
                return Err(EvalError::DivideByZero);
            }
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => a % b,
            };
            // Preserve integer arithmetic when both operands were integers.
            if lhs.as_i64().is_some() && rhs.as_i64().is_some() && result.fract() == 0.0 {
                Ok(Value::Number((result as i64).into()))
            } else {
                serde_json::Number::from_f64(result)
                    .map(Value::Number)
                    .ok_or_else(|| EvalError::Type("non-finite arithmetic result".into()))
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("connectives are short-circuited"),
    }
}

/// Equality with numeric unification (1 == 1.0); otherwise deep JSON
/// equality, strings case-sensitive.
fn json_eq(lhs: &Value, rhs: &Value) -> bool {
    match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn numeric_pair(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalResult<(f64, f64)> {
    match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(EvalError::Type(format!(
            "{op:?} requires numbers, got {} and {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn expect_bool(value: &Value) -> EvalResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::Type(format!(
            "expected boolean, got {}",
            type_name(other)
        ))),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn num_value(f: f64, original: &Value) -> EvalResult<Value> {
    if original.as_i64().is_some() && f.fract() == 0.0 {
        return Ok(Value::Number((f as i64).into()));
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Type("non-finite arithmetic result".into()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
