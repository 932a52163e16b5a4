//! Binary/unary operator evaluation.
//!
//! Precedence climbing over an `Expression`'s flat `(BinOp, Ast)` tail
//! happens in [`super`]; this module only knows how to apply one
//! already-resolved operator to two values.

use regex::Regex;

use crate::ast::{BinOp, UnaryOp};
use crate::fault::EvalFault;
use crate::position::Span;
use crate::scope::MatchScope;
use crate::value::Value;

/// Outcome of a binary operator: either a value, or (for `=~`/`!~`) a
/// value plus the match captures to push onto the match-scope stack.
pub enum BinaryOutcome {
    Value(Value),
    Match(Value, MatchScope),
}

pub fn apply_unary(op: UnaryOp, operand: Value, span: Span) -> Result<Value, EvalFault> {
    match op {
        UnaryOp::Not => Ok(Value::Boolean(!operand.is_truthy())),
        UnaryOp::Neg => match operand.resolve() {
            Value::Integer(n) => n
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| EvalFault::new("integer overflow negating a value", span)),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(EvalFault::new("unary '-' requires a numeric operand", span)),
        },
        UnaryOp::Splat => match operand.resolve() {
            Value::Array(_) => Ok(operand),
            other => Ok(Value::Array(vec![other.clone()])),
        },
    }
}

pub fn apply_binary(op: BinOp, left: Value, right: Value, span: Span) -> Result<BinaryOutcome, EvalFault> {
    use BinOp::*;
    match op {
        Add | Sub | Mul | Div | Mod => arithmetic(op, &left, &right, span).map(BinaryOutcome::Value),
        ShiftLeft => shift_left(left, right, span).map(BinaryOutcome::Value),
        ShiftRight => shift_right(&left, &right, span).map(BinaryOutcome::Value),
        Eq => Ok(BinaryOutcome::Value(Value::Boolean(left.equals(&right)))),
        NotEq => Ok(BinaryOutcome::Value(Value::Boolean(!left.equals(&right)))),
        Lt | Le | Gt | Ge => compare(op, &left, &right, span).map(BinaryOutcome::Value),
        Match => regex_match(left, right, span, false),
        NotMatch => regex_match(left, right, span, true),
        In => Ok(BinaryOutcome::Value(Value::Boolean(contains(&left, &right)))),
        And => Ok(BinaryOutcome::Value(Value::Boolean(left.is_truthy() && right.is_truthy()))),
        Or => Ok(BinaryOutcome::Value(Value::Boolean(left.is_truthy() || right.is_truthy()))),
        RelBefore | RelNotify | RelRequire | RelSubscribe => {
            Err(EvalFault::new("relationship operators are evaluated by the resource/catalog layer, not as values", span))
        }
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value, span: Span) -> Result<Value, EvalFault> {
    match (left.resolve(), right.resolve()) {
        (Value::Integer(a), Value::Integer(b)) => int_arithmetic(op, *a, *b, span),
        (Value::Integer(a), Value::Float(b)) => float_arithmetic(op, *a as f64, *b, span),
        (Value::Float(a), Value::Integer(b)) => float_arithmetic(op, *a, *b as f64, span),
        (Value::Float(a), Value::Float(b)) => float_arithmetic(op, *a, *b, span),
        (Value::Array(a), Value::Array(b)) if op == BinOp::Add => {
            let mut combined = a.clone();
            combined.extend(b.iter().cloned());
            Ok(Value::Array(combined))
        }
        (Value::Array(a), other) if op == BinOp::Add => {
            let mut combined = a.clone();
            combined.push(other.clone());
            Ok(Value::Array(combined))
        }
        (Value::Array(a), Value::Array(b)) if op == BinOp::Sub => {
            Ok(Value::Array(a.iter().filter(|x| !b.iter().any(|y| x.equals(y))).cloned().collect()))
        }
        (Value::Hash(a), Value::Hash(b)) if op == BinOp::Add => {
            let mut combined = a.clone();
            for (k, v) in b {
                if let Some(entry) = combined.iter_mut().find(|(ek, _)| ek.equals(k)) {
                    entry.1 = v.clone();
                } else {
                    combined.push((k.clone(), v.clone()));
                }
            }
            Ok(Value::Hash(combined))
        }
        _ => Err(EvalFault::new(format!("{:?} is not defined for these operand types", op), span)),
    }
}

fn int_arithmetic(op: BinOp, a: i64, b: i64, span: Span) -> Result<Value, EvalFault> {
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(EvalFault::new("division by zero", span));
            }
            a.checked_div(b)
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(EvalFault::new("division by zero", span));
            }
            a.checked_rem(b)
        }
        _ => unreachable!("only arithmetic ops reach int_arithmetic"),
    };
    result.map(Value::Integer).ok_or_else(|| EvalFault::new("integer overflow", span))
}

fn float_arithmetic(op: BinOp, a: f64, b: f64, span: Span) -> Result<Value, EvalFault> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalFault::new("division by zero", span));
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalFault::new("division by zero", span));
            }
            a % b
        }
        _ => unreachable!("only arithmetic ops reach float_arithmetic"),
    };
    if result.is_infinite() {
        return Err(EvalFault::new("floating point overflow", span));
    }
    Ok(Value::Float(result))
}

/// `<<` on arrays appends; on integers it is a bitwise left shift.
fn shift_left(left: Value, right: Value, span: Span) -> Result<Value, EvalFault> {
    match left.resolve() {
        Value::Array(items) => {
            let mut combined = items.clone();
            combined.push(right);
            Ok(Value::Array(combined))
        }
        Value::Integer(a) => match right.resolve() {
            Value::Integer(b) if *b >= 0 && *b < 64 => Ok(Value::Integer(a.wrapping_shl(*b as u32))),
            Value::Integer(_) => Err(EvalFault::new("shift amount out of range", span)),
            _ => Err(EvalFault::new("'<<' requires an integer shift amount", span)),
        },
        _ => Err(EvalFault::new("'<<' requires an array or an integer", span)),
    }
}

fn shift_right(left: &Value, right: &Value, span: Span) -> Result<Value, EvalFault> {
    match (left.resolve(), right.resolve()) {
        (Value::Integer(a), Value::Integer(b)) if *b >= 0 && *b < 64 => Ok(Value::Integer(a.wrapping_shr(*b as u32))),
        (Value::Integer(_), Value::Integer(_)) => Err(EvalFault::new("shift amount out of range", span)),
        _ => Err(EvalFault::new("'>>' requires two integers", span)),
    }
}

fn compare(op: BinOp, left: &Value, right: &Value, span: Span) -> Result<Value, EvalFault> {
    let ordering = match (left.resolve(), right.resolve()) {
        (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
        (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => a.to_lowercase().partial_cmp(&b.to_lowercase()),
        _ => return Err(EvalFault::new(format!("{:?} requires two comparable operands", op), span)),
    };
    let ordering = ordering.ok_or_else(|| EvalFault::new("values are not comparable (NaN)", span))?;
    let result = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!("only comparisons reach compare"),
    };
    Ok(Value::Boolean(result))
}

fn regex_match(left: Value, right: Value, span: Span, negate: bool) -> Result<BinaryOutcome, EvalFault> {
    // `$x =~ Type` is an instance test, not a pattern match; it sets no
    // match variables.
    if let Value::Type(t) = right.resolve() {
        let is_instance = t.is_instance(left.resolve());
        return Ok(BinaryOutcome::Value(Value::Boolean(is_instance != negate)));
    }
    let subject = left.as_str().ok_or_else(|| EvalFault::new("'=~' requires a string operand", span))?.to_string();
    let pattern = match right.resolve() {
        Value::Regex(p) => p.clone(),
        Value::String(s) => regex::escape(s),
        _ => return Err(EvalFault::new("'=~' requires a regexp or string pattern", span)),
    };
    let re = Regex::new(&pattern).map_err(|e| EvalFault::new(format!("invalid regular expression: {}", e), span))?;
    match re.captures(&subject) {
        Some(caps) => {
            let captures: Vec<Option<String>> =
                caps.iter().skip(1).map(|m| m.map(|m| m.as_str().to_string())).collect();
            if negate {
                Ok(BinaryOutcome::Value(Value::Boolean(false)))
            } else {
                Ok(BinaryOutcome::Match(Value::Boolean(true), MatchScope::from_captures(captures)))
            }
        }
        None => Ok(BinaryOutcome::Value(Value::Boolean(negate))),
    }
}

/// `in`: substring test for strings, element test for arrays, key test
/// for hashes.
fn contains(needle: &Value, haystack: &Value) -> bool {
    match haystack.resolve() {
        Value::Array(items) => items.iter().any(|item| item.equals(needle)),
        Value::Hash(pairs) => pairs.iter().any(|(k, _)| k.equals(needle)),
        Value::String(s) => match needle.as_str() {
            Some(n) => s.to_lowercase().contains(&n.to_lowercase()),
            None => false,
        },
        _ => false,
    }
}
