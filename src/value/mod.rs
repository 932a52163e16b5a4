//! Runtime values.

pub mod types;

use std::fmt;
use std::rc::Rc;

use serde::{Serialize, Serializer};
use serde::ser::SerializeMap;

pub use types::Type;

/// An item produced while iterating a [`Value::Array`] or [`Value::Hash`].
///
/// Arrays yield a single value per step; hashes yield a key and a value.
#[derive(Debug, Clone)]
pub enum IterationItem {
    Single(Value),
    Pair(Value, Value),
}

#[derive(Debug, Clone)]
pub enum Value {
    Undef,
    Default,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Regex(String),
    Type(Type),
    Array(Vec<Value>),
    Hash(Vec<(Value, Value)>),
    /// An immutable handle to a value owned elsewhere (a scope variable).
    /// Every other operation on `Value` transparently dereferences this.
    VariableRef(Rc<Value>),
    /// An immutable view over the elements of an array or hash, produced by
    /// iteration builtins (`each`, `map`, `filter`, `reduce`).
    Iterator(Rc<Vec<IterationItem>>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    /// Follows `VariableRef` indirection to the underlying value.
    pub fn resolve(&self) -> &Value {
        match self {
            Value::VariableRef(inner) => inner.resolve(),
            other => other,
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self.resolve(), Value::Undef)
    }

    pub fn is_default(&self) -> bool {
        matches!(self.resolve(), Value::Default)
    }

    /// Puppet truthiness: everything is truthy except `undef` and `false`.
    pub fn is_truthy(&self) -> bool {
        match self.resolve() {
            Value::Undef => false,
            Value::Boolean(b) => *b,
            _ => true,
        }
    }

    pub fn get_type(&self) -> Type {
        match self.resolve() {
            Value::Undef => Type::Undef,
            Value::Default => Type::DefaultType,
            Value::Integer(n) => Type::Integer { from: Some(*n), to: Some(*n) },
            Value::Float(f) => Type::Float { from: Some(*f), to: Some(*f) },
            Value::Boolean(_) => Type::Boolean,
            Value::String(_) => Type::StringType { from: None, to: None },
            Value::Regex(_) => Type::Regexp(None),
            Value::Type(_) => Type::TypeOf(None),
            Value::Array(items) => Type::Array {
                element: Box::new(common_element_type(items.iter())),
                from: Some(items.len() as i64),
                to: Some(items.len() as i64),
            },
            Value::Hash(pairs) => Type::Hash {
                key: Box::new(common_element_type(pairs.iter().map(|(k, _)| k))),
                value: Box::new(common_element_type(pairs.iter().map(|(_, v)| v))),
                from: Some(pairs.len() as i64),
                to: Some(pairs.len() as i64),
            },
            Value::Iterator(_) => Type::Collection,
            Value::VariableRef(_) => unreachable!("resolve() strips VariableRef"),
        }
    }

    /// Puppet's `==`: numeric values compare across `Integer`/`Float` by
    /// magnitude, and strings compare case-insensitively.
    pub fn equals(&self, other: &Value) -> bool {
        use Value::*;
        match (self.resolve(), other.resolve()) {
            (Undef, Undef) => true,
            (Default, Default) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Integer(a), Float(b)) | (Float(b), Integer(a)) => *a as f64 == *b,
            (String(a), String(b)) => a.eq_ignore_ascii_case(b),
            (Regex(a), Regex(b)) => a == b,
            (Type(a), Type(b)) => a == b,
            (Array(a), Array(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y)),
            (Hash(a), Hash(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.iter().any(|(k2, v2)| k.equals(k2) && v.equals(v2)))
            }
            _ => false,
        }
    }

    /// Iterates an array (as single items) or hash (as key/value pairs).
    /// Returns `None` for scalar values, mirroring the builtins' requirement
    /// that `each`/`map`/`filter`/`reduce` only accept collections.
    pub fn iterate(&self) -> Option<Vec<IterationItem>> {
        match self.resolve() {
            Value::Array(items) => Some(items.iter().cloned().map(IterationItem::Single).collect()),
            Value::Hash(pairs) => Some(pairs.iter().cloned().map(|(k, v)| IterationItem::Pair(k, v)).collect()),
            Value::Iterator(items) => Some(items.as_ref().clone()),
            _ => None,
        }
    }

    /// The deterministic printed form used by string interpolation and the
    /// `notice`/`fail` family of builtins.
    pub fn to_display_string(&self) -> String {
        format!("{}", self)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.resolve() {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.resolve() {
            Value::Float(f) => Some(*f),
            Value::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.resolve() {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self.resolve() {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&[(Value, Value)]> {
        match self.resolve() {
            Value::Hash(pairs) => Some(pairs.as_slice()),
            _ => None,
        }
    }

    pub fn hash_get(&self, key: &Value) -> Option<Value> {
        self.as_hash()?.iter().find(|(k, _)| k.equals(key)).map(|(_, v)| v.clone())
    }

    /// Mutates the receiving array in place; the container passed as the
    /// receiver is the one that changes.
    pub fn array_set(&mut self, index: usize, value: Value) -> Result<(), String> {
        match self {
            Value::Array(items) => {
                if index >= items.len() {
                    items.resize(index + 1, Value::Undef);
                }
                items[index] = value;
                Ok(())
            }
            Value::VariableRef(_) | Value::Iterator(_) => Err("cannot mutate an immutable value".to_string()),
            _ => Err("array_set requires an array".to_string()),
        }
    }

    /// Mutates the receiving hash in place; see [`Value::array_set`].
    pub fn hash_set(&mut self, key: Value, value: Value) -> Result<(), String> {
        match self {
            Value::Hash(pairs) => {
                if let Some(entry) = pairs.iter_mut().find(|(k, _)| k.equals(&key)) {
                    entry.1 = value;
                } else {
                    pairs.push((key, value));
                }
                Ok(())
            }
            Value::VariableRef(_) | Value::Iterator(_) => Err("cannot mutate an immutable value".to_string()),
            _ => Err("hash_set requires a hash".to_string()),
        }
    }
}

fn common_element_type<'a>(mut values: impl Iterator<Item = &'a Value>) -> Type {
    let first = match values.next() {
        Some(v) => v.get_type(),
        None => return Type::Any,
    };
    let mut merged = first;
    for v in values {
        if merged != v.get_type() {
            return Type::Any;
        }
    }
    merged
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolve() {
            Value::Undef => write!(f, ""),
            Value::Default => write!(f, "default"),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Regex(p) => write!(f, "/{}/", p),
            Value::Type(t) => write!(f, "{}", t.name()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item.debug_quoted())?;
                }
                write!(f, "]")
            }
            Value::Hash(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", k.debug_quoted(), v.debug_quoted())?;
                }
                write!(f, "}}")
            }
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::VariableRef(_) => unreachable!("resolve() strips VariableRef"),
        }
    }
}

/// Catalog attributes carry values into JSON; hash keys are coerced to
/// strings via `to_string`
/// since JSON objects have no other key shape.
impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.resolve() {
            Value::Undef => serializer.serialize_none(),
            Value::Default => serializer.serialize_str("default"),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Float(x) => serializer.serialize_f64(*x),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::String(s) => serializer.serialize_str(s),
            Value::Regex(p) => serializer.serialize_str(&format!("/{}/", p)),
            Value::Type(t) => serializer.serialize_str(&t.name()),
            Value::Array(items) => items.serialize(serializer),
            Value::Hash(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(&k.to_display_string(), v)?;
                }
                map.end()
            }
            Value::Iterator(_) | Value::VariableRef(_) => unreachable!("resolve() strips these"),
        }
    }
}

impl Value {
    /// Same as `Display` except strings are quoted, for use inside
    /// array/hash renderings where bare text would be ambiguous.
    fn debug_quoted(&self) -> String {
        match self.resolve() {
            Value::String(s) => format!("'{}'", s),
            other => format!("{}", other),
        }
    }
}
