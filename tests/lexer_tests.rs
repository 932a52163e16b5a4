//! Lexer integration tests: token classification, numeric literal bases
//! and range errors, string escapes, comments, and operators.

use proptest::prelude::*;
use rstest::rstest;

use puppetc::lexer::Lexer;
use puppetc::token::{NumberBase, NumberLiteral, RawStringPart, Token, TokenKind};

fn lex_all(source: &str) -> Vec<Token> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token().expect("lexing should succeed");
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            break;
        }
    }
    tokens
}

fn lex_one(source: &str) -> TokenKind {
    lex_all(source).into_iter().next().expect("at least one token").kind
}

fn lex_error(source: &str) -> String {
    let mut lexer = Lexer::new(source);
    loop {
        match lexer.next_token() {
            Ok(token) if token.kind == TokenKind::Eof => panic!("expected a lex error for {:?}", source),
            Ok(_) => continue,
            Err(fault) => return fault.message,
        }
    }
}

// =============================================================================
// Identifier classification
// =============================================================================

#[rstest]
#[case("ensure")]
#[case("foo::bar")]
#[case("_private")]
fn bare_names_lex_as_name_tokens(#[case] source: &str) {
    assert!(matches!(lex_one(source), TokenKind::Name(n) if n == source));
}

#[rstest]
#[case("File")]
#[case("Integer")]
#[case("Foo::Bar")]
fn capitalized_identifiers_lex_as_type_tokens(#[case] source: &str) {
    assert!(matches!(lex_one(source), TokenKind::Type(t) if t == source));
}

#[rstest]
#[case("class")]
#[case("define")]
#[case("inherits")]
#[case("unless")]
fn reserved_words_lex_as_keywords(#[case] source: &str) {
    assert!(matches!(lex_one(source), TokenKind::Keyword(k) if k == source));
}

#[rstest]
#[case("include")]
#[case("notice")]
#[case("fail")]
#[case("realize")]
fn statement_call_names_lex_as_statement_calls(#[case] source: &str) {
    assert!(matches!(lex_one(source), TokenKind::StatementCall(s) if s == source));
}

#[test]
fn variables_keep_their_qualified_name() {
    assert!(matches!(lex_one("$foo"), TokenKind::Variable(n) if n == "foo"));
    assert!(matches!(lex_one("$::osfamily"), TokenKind::Variable(n) if n == "::osfamily"));
    assert!(matches!(lex_one("$apache::version"), TokenKind::Variable(n) if n == "apache::version"));
    assert!(matches!(lex_one("$1"), TokenKind::Variable(n) if n == "1"));
}

#[test]
fn dollar_without_a_name_is_an_error() {
    assert!(lex_error("$ ").contains("expected variable name"));
}

// =============================================================================
// Numbers
// =============================================================================

#[rstest]
#[case("0", 0, NumberBase::Decimal)]
#[case("42", 42, NumberBase::Decimal)]
#[case("0755", 493, NumberBase::Octal)]
#[case("0x1F", 31, NumberBase::Hexadecimal)]
#[case("0XFF", 255, NumberBase::Hexadecimal)]
fn integer_literals_lex_in_their_base(#[case] source: &str, #[case] value: i64, #[case] base: NumberBase) {
    match lex_one(source) {
        TokenKind::Number(NumberLiteral::Integer { value: v, base: b }) => {
            assert_eq!(v, value);
            assert_eq!(b, base);
        }
        other => panic!("expected an integer, got {:?}", other),
    }
}

#[rstest]
#[case("3.14", 3.14)]
#[case("1e3", 1000.0)]
#[case("2.5e-1", 0.25)]
fn float_literals_lex_as_floats(#[case] source: &str, #[case] value: f64) {
    match lex_one(source) {
        TokenKind::Number(NumberLiteral::Float(f)) => assert!((f - value).abs() < 1e-9),
        other => panic!("expected a float, got {:?}", other),
    }
}

#[test]
fn huge_hexadecimal_literal_is_an_out_of_range_error() {
    assert!(lex_error("0xFFFFFFFFFFFFFFFFFFFFFFFF").contains("out of range"));
}

#[test]
fn octal_digit_nine_is_rejected() {
    assert!(lex_error("0799").contains("octal"));
}

#[test]
fn huge_decimal_literal_is_an_out_of_range_error() {
    assert!(lex_error("99999999999999999999999999").contains("out of range"));
}

// =============================================================================
// Strings
// =============================================================================

#[test]
fn single_quoted_strings_only_escape_backslash_and_quote() {
    assert!(matches!(lex_one(r"'it\'s'"), TokenKind::SingleQuotedString(s) if s == "it's"));
    assert!(matches!(lex_one(r"'a\\b'"), TokenKind::SingleQuotedString(s) if s == r"a\b"));
    // Other escapes stay verbatim.
    assert!(matches!(lex_one(r"'a\nb'"), TokenKind::SingleQuotedString(s) if s == r"a\nb"));
}

#[test]
fn double_quoted_string_without_interpolation_is_a_single_text_part() {
    match lex_one(r#""plain text""#) {
        TokenKind::StringLiteral(payload) => {
            assert!(!payload.interpolated);
            assert_eq!(payload.parts, vec![RawStringPart::Text("plain text".to_string())]);
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[test]
fn double_quoted_escapes_are_resolved() {
    match lex_one(r#""a\tb\nc\$d\se""#) {
        TokenKind::StringLiteral(payload) => {
            assert_eq!(payload.parts, vec![RawStringPart::Text("a\tb\nc$d e".to_string())]);
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[test]
fn unknown_escape_preserves_the_backslash() {
    match lex_one(r#""a\qb""#) {
        TokenKind::StringLiteral(payload) => {
            assert_eq!(payload.parts, vec![RawStringPart::Text(r"a\qb".to_string())]);
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[rstest]
#[case(r#""A""#, "A")]
#[case(r#""\u{48}""#, "H")]
#[case(r#""\u{1F600}""#, "\u{1F600}")]
fn unicode_escapes_decode_to_their_code_point(#[case] source: &str, #[case] expected: &str) {
    match lex_one(source) {
        TokenKind::StringLiteral(payload) => {
            assert_eq!(payload.parts, vec![RawStringPart::Text(expected.to_string())]);
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[test]
fn malformed_unicode_escape_is_an_error() {
    assert!(lex_error(r#""\uZZ""#).contains("\\u escape"));
    assert!(lex_error(r#""\u{}""#).contains("unicode"));
    assert!(lex_error(r#""\u{D800}""#).contains("code point"));
}

#[test]
fn interpolation_splits_the_string_into_parts() {
    match lex_one(r#""a${1 + 2}b""#) {
        TokenKind::StringLiteral(payload) => {
            assert!(payload.interpolated);
            assert_eq!(
                payload.parts,
                vec![
                    RawStringPart::Text("a".to_string()),
                    RawStringPart::Expr("1 + 2".to_string()),
                    RawStringPart::Text("b".to_string()),
                ]
            );
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[test]
fn bare_variable_interpolation_is_greedy_over_the_identifier() {
    match lex_one(r#""$name!""#) {
        TokenKind::StringLiteral(payload) => {
            assert_eq!(
                payload.parts,
                vec![RawStringPart::BareVariable("name".to_string()), RawStringPart::Text("!".to_string())]
            );
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[test]
fn nested_braces_inside_interpolation_are_balanced() {
    match lex_one(r#""${ { 'a' => 1 } }""#) {
        TokenKind::StringLiteral(payload) => {
            assert_eq!(payload.parts, vec![RawStringPart::Expr(" { 'a' => 1 } ".to_string())]);
        }
        other => panic!("expected a string literal, got {:?}", other),
    }
}

#[test]
fn unclosed_strings_are_errors() {
    assert!(lex_error("'oops").contains("unclosed"));
    assert!(lex_error("\"oops").contains("unclosed"));
    assert!(lex_error(r#""${1 + 2"#).contains("unterminated"));
}

// =============================================================================
// Comments and whitespace
// =============================================================================

#[test]
fn line_comments_are_skipped() {
    let tokens = lex_all("# a comment\n42");
    assert!(matches!(&tokens[0].kind, TokenKind::Number(_)));
}

#[test]
fn block_comments_are_skipped_and_may_span_lines() {
    let tokens = lex_all("/* one\ntwo */ 42");
    assert!(matches!(&tokens[0].kind, TokenKind::Number(_)));
    assert_eq!(tokens[0].span.begin.line, 2);
}

#[test]
fn runaway_block_comment_is_an_error() {
    assert!(lex_error("/* never closed").contains("unterminated block comment"));
}

#[test]
fn line_numbers_track_across_newlines() {
    let tokens = lex_all("1\n2\n\n3");
    assert_eq!(tokens[0].span.begin.line, 1);
    assert_eq!(tokens[1].span.begin.line, 2);
    assert_eq!(tokens[2].span.begin.line, 4);
}

// =============================================================================
// Operators
// =============================================================================

#[rstest]
#[case("->", TokenKind::InArrow)]
#[case("~>", TokenKind::InArrowSub)]
#[case("<-", TokenKind::OutArrow)]
#[case("<~", TokenKind::OutArrowSub)]
#[case("<|", TokenKind::PipeLeft)]
#[case("<<|", TokenKind::PipeLeftLeft)]
#[case("|>", TokenKind::PipeRight)]
#[case("|>>", TokenKind::PipeRightRight)]
#[case("=~", TokenKind::Match)]
#[case("!~", TokenKind::NotMatch)]
#[case("=>", TokenKind::FatArrow)]
#[case("+>", TokenKind::PlusArrow)]
#[case("<<", TokenKind::ShiftLeft)]
#[case(">>", TokenKind::ShiftRight)]
#[case("<=", TokenKind::Le)]
#[case(">=", TokenKind::Ge)]
#[case("==", TokenKind::Eq)]
#[case("!=", TokenKind::NotEq)]
#[case("@@", TokenKind::AtAt)]
fn multi_character_operators_fold_into_single_tokens(#[case] source: &str, #[case] expected: TokenKind) {
    assert_eq!(lex_one(source), expected);
}

#[test]
fn regex_literals_capture_their_pattern() {
    assert!(matches!(lex_one("/^web\\d+$/"), TokenKind::Regex(p) if p == "^web\\d+$"));
}

#[test]
fn slash_after_an_operand_is_division_not_a_regex() {
    let tokens = lex_all("10 / 2");
    assert_eq!(tokens[1].kind, TokenKind::Slash);
    let tokens = lex_all("$total / $count");
    assert_eq!(tokens[1].kind, TokenKind::Slash);
    let tokens = lex_all("(1 + 2) / 3");
    assert!(tokens.iter().any(|t| t.kind == TokenKind::Slash));
}

#[test]
fn slash_after_an_operator_or_keyword_starts_a_regex() {
    let tokens = lex_all("$x =~ /ab/");
    assert!(matches!(&tokens[2].kind, TokenKind::Regex(p) if p == "ab"));
    let tokens = lex_all("node /^db$/ { }");
    assert!(matches!(&tokens[1].kind, TokenKind::Regex(_)));
}

#[test]
fn unterminated_regex_is_an_error() {
    assert!(lex_error("/never").contains("unterminated regular expression"));
}

#[test]
fn unexpected_characters_are_reported() {
    assert!(lex_error("`").contains("unexpected character"));
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    /// The lexer never panics, whatever bytes it is fed; it either
    /// produces tokens through to EOF or reports a structured fault.
    #[test]
    fn lexing_arbitrary_input_never_panics(input in ".{0,80}") {
        let mut lexer = Lexer::new(&input);
        for _ in 0..input.len() + 2 {
            match lexer.next_token() {
                Ok(token) if token.kind == TokenKind::Eof => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Decimal integer literals round-trip through the lexer.
    #[test]
    fn decimal_integers_round_trip(n in 0i64..i64::MAX) {
        let source = n.to_string();
        match lex_one(&source) {
            TokenKind::Number(NumberLiteral::Integer { value, base: NumberBase::Decimal }) => {
                prop_assert_eq!(value, n);
            }
            other => prop_assert!(false, "expected an integer, got {:?}", other),
        }
    }
}
