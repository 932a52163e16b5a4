//! String interpolation evaluation.
//!
//! By the time an [`AstKind::Interpolated`](crate::ast::AstKind::Interpolated)
//! node reaches the evaluator, the lexer has already resolved escapes
//! (including `\u{...}`) and the parser has already re-entered itself on
//! every `${...}` piece via `interpolate_parse`, so all that is left is to
//! evaluate each embedded expression against the live context and
//! concatenate.

use crate::ast::{Ast, StringPart};
use crate::fault::EvalFault;
use crate::position::Span;
use crate::value::Value;

/// Evaluates an interpolated string's parts, converting each `${expr}`
/// result with [`Value::to_display_string`] and concatenating literal
/// text verbatim. `eval_expr` is supplied by [`super`] so this module
/// never has to depend on the rest of the evaluator.
pub fn evaluate(
    parts: &[StringPart],
    span: Span,
    mut eval_expr: impl FnMut(&Ast) -> Result<Value, EvalFault>,
) -> Result<String, EvalFault> {
    let mut out = String::new();
    for part in parts {
        match part {
            StringPart::Text(text) => out.push_str(text),
            StringPart::Expr(expr) => {
                let value = eval_expr(expr)?;
                out.push_str(&value.to_display_string());
            }
        }
    }
    if std::str::from_utf8(out.as_bytes()).is_err() {
        return Err(EvalFault::new("interpolated string is not valid UTF-8", span));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::AstKind;
    use crate::position::Position;

    fn span() -> Span {
        Span::point(Position::start())
    }

    #[test]
    fn concatenates_text_and_expression_results() {
        let parts = vec![
            StringPart::Text("a".to_string()),
            StringPart::Expr(Box::new(Ast::new(AstKind::Number(crate::token::NumberLiteral::Integer {
                value: 2,
                base: crate::token::NumberBase::Decimal,
            }), span()))),
            StringPart::Text("b".to_string()),
        ];
        let result = evaluate(&parts, span(), |ast| match &ast.kind {
            AstKind::Number(crate::token::NumberLiteral::Integer { value, .. }) => Ok(Value::Integer(value + 1)),
            _ => unreachable!(),
        })
        .unwrap();
        assert_eq!(result, "a2b");
    }

    #[test]
    fn propagates_errors_from_embedded_expressions() {
        let parts = vec![StringPart::Expr(Box::new(Ast::new(AstKind::Undef, span())))];
        let result = evaluate(&parts, span(), |_| Err(EvalFault::new("boom", span())));
        assert!(result.is_err());
    }

    #[test]
    fn plain_text_needs_no_expression_evaluation() {
        let parts = vec![StringPart::Text("hello".to_string())];
        let result = evaluate(&parts, span(), |_| unreachable!("no expression parts")).unwrap();
        assert_eq!(result, "hello");
    }
}
