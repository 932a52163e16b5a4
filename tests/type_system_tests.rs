//! The runtime type system: textual parsing, instance membership,
//! specialization ordering, and the `is_instance(v, get_type(v))`
//! invariant.

use proptest::prelude::*;
use rstest::rstest;

use puppetc::value::{Type, Value};

// =============================================================================
// Textual type specifications
// =============================================================================

#[rstest]
#[case("Any")]
#[case("Undef")]
#[case("Boolean")]
#[case("Scalar")]
#[case("Numeric")]
#[case("Data")]
#[case("Collection")]
fn bare_type_names_parse(#[case] spec: &str) {
    assert_eq!(Type::parse(spec).unwrap().name(), spec);
}

#[test]
fn parameterized_specifications_carry_their_arguments() {
    assert_eq!(Type::parse("Integer[1, 10]").unwrap(), Type::Integer { from: Some(1), to: Some(10) });
    assert_eq!(
        Type::parse("Enum['red', 'green']").unwrap(),
        Type::Enum(vec!["red".to_string(), "green".to_string()])
    );
    assert_eq!(Type::parse("Optional[String]").unwrap(), Type::Optional(Box::new(Type::StringType { from: None, to: None })));
}

#[test]
fn nested_specifications_parse_recursively() {
    let t = Type::parse("Hash[String, Array[Integer], 1, 4]").unwrap();
    match t {
        Type::Hash { key, value, from, to } => {
            assert_eq!(*key, Type::StringType { from: None, to: None });
            assert!(matches!(*value, Type::Array { .. }));
            assert_eq!((from, to), (Some(1), Some(4)));
        }
        other => panic!("expected a hash type, got {:?}", other),
    }
}

#[test]
fn struct_specifications_parse_their_field_map() {
    let t = Type::parse("Struct[{ 'name' => String, 'port' => Optional[Integer] }]").unwrap();
    match t {
        Type::Struct(fields) => {
            assert_eq!(fields.len(), 2);
            assert_eq!(fields[0].0, "name");
        }
        other => panic!("expected a struct type, got {:?}", other),
    }
}

#[test]
fn trailing_garbage_in_a_specification_is_rejected() {
    assert!(Type::parse("Integer] oops").is_err());
}

// =============================================================================
// Instance membership
// =============================================================================

#[rstest]
#[case("Integer[0, 10]", Value::Integer(5), true)]
#[case("Integer[0, 10]", Value::Integer(11), false)]
#[case("String[2]", Value::string("ab"), true)]
#[case("String[2]", Value::string("a"), false)]
#[case("Enum['present', 'absent']", Value::string("present"), true)]
#[case("Enum['present', 'absent']", Value::string("gone"), false)]
#[case("Pattern['^\\d+$']", Value::string("123"), true)]
#[case("Pattern['^\\d+$']", Value::string("x1"), false)]
#[case("Optional[Integer]", Value::Undef, true)]
#[case("NotUndef[Integer]", Value::Undef, false)]
#[case("Variant[Integer, String]", Value::string("x"), true)]
#[case("Variant[Integer, String]", Value::Boolean(true), false)]
#[case("Tuple[Integer, String]", Value::Array(vec![Value::Integer(1), Value::string("a")]), true)]
#[case("Tuple[Integer, String]", Value::Array(vec![Value::string("a"), Value::Integer(1)]), false)]
fn membership_follows_the_specification(#[case] spec: &str, #[case] value: Value, #[case] expected: bool) {
    let t = Type::parse(spec).unwrap();
    assert_eq!(t.is_instance(&value), expected, "{} vs {:?}", spec, value);
}

#[test]
fn struct_fields_may_be_optional() {
    let t = Type::parse("Struct[{ 'name' => String, 'port' => Optional[Integer] }]").unwrap();
    let without_port = Value::Hash(vec![(Value::string("name"), Value::string("x"))]);
    assert!(t.is_instance(&without_port));
    let missing_name = Value::Hash(vec![(Value::string("port"), Value::Integer(80))]);
    assert!(!t.is_instance(&missing_name));
}

#[test]
fn type_of_membership_uses_specialization() {
    let t = Type::parse("Type[Numeric]").unwrap();
    assert!(t.is_instance(&Value::Type(Type::Integer { from: None, to: None })));
    assert!(!t.is_instance(&Value::Type(Type::Boolean)));
}

// =============================================================================
// Specialization ordering
// =============================================================================

#[rstest]
#[case("Integer", "Numeric")]
#[case("Integer", "Scalar")]
#[case("Float", "Numeric")]
#[case("String", "Data")]
#[case("Array[Integer]", "Collection")]
#[case("Enum['a']", "String")]
#[case("Undef", "Optional[Integer]")]
#[case("Integer[2, 5]", "Integer[0, 10]")]
fn narrower_types_specialize_wider_ones(#[case] narrow: &str, #[case] wide: &str) {
    let narrow = Type::parse(narrow).unwrap();
    let wide = Type::parse(wide).unwrap();
    assert!(narrow.is_specialization_of(&wide));
    assert!(narrow.is_specialization_of(&Type::Any));
}

#[test]
fn variant_specializes_when_every_branch_does() {
    let variant = Type::parse("Variant[Integer, Float]").unwrap();
    assert!(variant.is_specialization_of(&Type::Numeric));
    let mixed = Type::parse("Variant[Integer, String]").unwrap();
    assert!(!mixed.is_specialization_of(&Type::Numeric));
}

#[test]
fn wider_ranges_do_not_specialize_narrower_ones() {
    let wide = Type::parse("Integer[0, 100]").unwrap();
    let narrow = Type::parse("Integer[10, 20]").unwrap();
    assert!(!wide.is_specialization_of(&narrow));
}

// =============================================================================
// get_type and the membership invariant
// =============================================================================

#[rstest]
#[case(Value::Undef)]
#[case(Value::Default)]
#[case(Value::Boolean(true))]
#[case(Value::Integer(-3))]
#[case(Value::Float(2.5))]
#[case(Value::string("hello"))]
#[case(Value::Regex("^a".to_string()))]
#[case(Value::Array(vec![Value::Integer(1), Value::Integer(2)]))]
#[case(Value::Hash(vec![(Value::string("k"), Value::Integer(1))]))]
fn every_value_is_an_instance_of_its_own_type(#[case] value: Value) {
    let t = value.get_type();
    assert!(t.is_instance(&value), "{:?} not in {:?}", value, t);
}

proptest! {
    #[test]
    fn integers_are_instances_of_their_inferred_type(n in any::<i64>()) {
        let value = Value::Integer(n);
        prop_assert!(value.get_type().is_instance(&value));
    }

    #[test]
    fn strings_are_instances_of_their_inferred_type(s in ".{0,40}") {
        let value = Value::string(s);
        prop_assert!(value.get_type().is_instance(&value));
    }

    #[test]
    fn arrays_of_integers_are_instances_of_their_inferred_type(items in prop::collection::vec(any::<i64>(), 0..8)) {
        let value = Value::Array(items.into_iter().map(Value::Integer).collect());
        prop_assert!(value.get_type().is_instance(&value));
    }
}
