//! The Puppet type system: [`Type`], its instance/specialization
//! relations, and a small recursive-descent parser for textual type specs
//! (`Array[Integer, 1, 10]`, `Optional[String]`, and so on).

use regex::Regex;

use super::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Any,
    Undef,
    DefaultType,
    Boolean,
    Scalar,
    Numeric,
    Data,
    Collection,
    CatalogEntry,
    Runtime(Vec<String>),
    Integer { from: Option<i64>, to: Option<i64> },
    Float { from: Option<f64>, to: Option<f64> },
    StringType { from: Option<i64>, to: Option<i64> },
    Regexp(Option<String>),
    Pattern(Vec<String>),
    Enum(Vec<String>),
    Array { element: Box<Type>, from: Option<i64>, to: Option<i64> },
    Hash { key: Box<Type>, value: Box<Type>, from: Option<i64>, to: Option<i64> },
    Tuple { elements: Vec<Type>, from: Option<i64>, to: Option<i64> },
    Struct(Vec<(String, Type)>),
    Optional(Box<Type>),
    NotUndef(Box<Type>),
    Variant(Vec<Type>),
    Callable { params: Vec<Type>, min: Option<i64>, max: Option<i64> },
    TypeOf(Option<Box<Type>>),
    Resource { name: Option<String>, title: Option<String> },
    Class(Option<String>),
}

impl Type {
    pub fn name(&self) -> String {
        use Type::*;
        match self {
            Any => "Any".to_string(),
            Undef => "Undef".to_string(),
            DefaultType => "Default".to_string(),
            Boolean => "Boolean".to_string(),
            Scalar => "Scalar".to_string(),
            Numeric => "Numeric".to_string(),
            Data => "Data".to_string(),
            Collection => "Collection".to_string(),
            CatalogEntry => "CatalogEntry".to_string(),
            Runtime(_) => "Runtime".to_string(),
            Integer { .. } => "Integer".to_string(),
            Float { .. } => "Float".to_string(),
            StringType { .. } => "String".to_string(),
            Regexp(_) => "Regexp".to_string(),
            Pattern(_) => "Pattern".to_string(),
            Enum(_) => "Enum".to_string(),
            Array { .. } => "Array".to_string(),
            Hash { .. } => "Hash".to_string(),
            Tuple { .. } => "Tuple".to_string(),
            Struct(_) => "Struct".to_string(),
            Optional(_) => "Optional".to_string(),
            NotUndef(_) => "NotUndef".to_string(),
            Variant(_) => "Variant".to_string(),
            Callable { .. } => "Callable".to_string(),
            TypeOf(_) => "Type".to_string(),
            Resource { name, .. } => match name {
                Some(n) => n.clone(),
                None => "Resource".to_string(),
            },
            Class(_) => "Class".to_string(),
        }
    }

    /// Tests whether `value` belongs to this type.
    ///
    /// `Callable`, `Resource`, `Class`, `CatalogEntry`, and `Runtime` never
    /// match: this crate's [`Value`] has no closure, resource-reference, or
    /// foreign-runtime-object variant to test against, so those types are
    /// satisfiable only through `is_specialization_of` (e.g. as branches of
    /// a `Variant`), not through a live value.
    pub fn is_instance(&self, value: &Value) -> bool {
        use Type::*;
        match self {
            Any => true,
            Undef => value.is_undef(),
            DefaultType => value.is_default(),
            Boolean => matches!(value, Value::Boolean(_)),
            Scalar => matches!(value, Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::String(_) | Value::Regex(_)),
            Numeric => matches!(value, Value::Integer(_) | Value::Float(_)),
            Data => matches!(
                value,
                Value::Integer(_) | Value::Float(_) | Value::Boolean(_) | Value::String(_) | Value::Regex(_) | Value::Array(_) | Value::Hash(_) | Value::Undef
            ),
            Collection => matches!(value, Value::Array(_) | Value::Hash(_)),
            CatalogEntry | Runtime(_) | Callable { .. } | Resource { .. } | Class(_) => false,
            Integer { from, to } => match value {
                Value::Integer(n) => in_range_i64(*n, *from, *to),
                _ => false,
            },
            Float { from, to } => match value {
                Value::Float(f) => in_range_f64(*f, *from, *to),
                _ => false,
            },
            StringType { from, to } => match value {
                Value::String(s) => in_range_i64(s.chars().count() as i64, *from, *to),
                _ => false,
            },
            Regexp(pattern) => match value {
                Value::Regex(p) => pattern.as_deref().map(|expected| expected == p).unwrap_or(true),
                _ => false,
            },
            Pattern(patterns) => match value {
                Value::String(s) => patterns.iter().any(|p| Regex::new(p).map(|re| re.is_match(s)).unwrap_or(false)),
                _ => false,
            },
            Enum(values) => match value {
                Value::String(s) => values.iter().any(|v| v == s),
                _ => false,
            },
            Array { element, from, to } => match value {
                Value::Array(items) => in_range_i64(items.len() as i64, *from, *to) && items.iter().all(|i| element.is_instance(i)),
                _ => false,
            },
            Hash { key, value: vty, from, to } => match value {
                Value::Hash(pairs) => {
                    in_range_i64(pairs.len() as i64, *from, *to)
                        && pairs.iter().all(|(k, v)| key.is_instance(k) && vty.is_instance(v))
                }
                _ => false,
            },
            Tuple { elements, from, to } => match value {
                Value::Array(items) => {
                    let min = from.unwrap_or(elements.len() as i64);
                    let max = to.unwrap_or(elements.len() as i64);
                    if !in_range_i64(items.len() as i64, Some(min), Some(max)) {
                        return false;
                    }
                    items.iter().enumerate().all(|(i, item)| {
                        let ty = elements.get(i).or_else(|| elements.last());
                        ty.map(|t| t.is_instance(item)).unwrap_or(false)
                    })
                }
                _ => false,
            },
            Struct(fields) => match value {
                Value::Hash(pairs) => fields.iter().all(|(name, ty)| {
                    let found = pairs.iter().find(|(k, _)| matches!(k, Value::String(s) if s == name));
                    match found {
                        Some((_, v)) => ty.is_instance(v),
                        None => matches!(ty, Optional(_)),
                    }
                }),
                _ => false,
            },
            Optional(inner) => value.is_undef() || inner.is_instance(value),
            NotUndef(inner) => !value.is_undef() && inner.is_instance(value),
            Variant(types) => types.iter().any(|t| t.is_instance(value)),
            TypeOf(inner) => match value {
                Value::Type(t) => inner.as_ref().map(|expected| t.is_specialization_of(expected)).unwrap_or(true),
                _ => false,
            },
        }
    }

    /// Whether `self` is the same type or a narrower one than `other`
    /// (used to order types for comparison operators and `Type[T]`
    /// membership).
    pub fn is_specialization_of(&self, other: &Type) -> bool {
        use Type::*;
        if matches!(other, Any) {
            return true;
        }
        if self == other {
            return true;
        }
        match (self, other) {
            (_, Scalar) => matches!(self, Integer { .. } | Float { .. } | Boolean | StringType { .. } | Regexp(_) | Numeric),
            (_, Numeric) => matches!(self, Integer { .. } | Float { .. }),
            (_, Data) => matches!(
                self,
                Integer { .. } | Float { .. } | Boolean | StringType { .. } | Regexp(_) | Numeric | Array { .. } | Hash { .. } | Undef | Scalar | Collection
            ),
            (_, Collection) => matches!(self, Array { .. } | Hash { .. } | Tuple { .. } | Struct(_)),
            (Integer { from: f1, to: t1 }, Integer { from: f2, to: t2 }) => range_within_i64(*f1, *t1, *f2, *t2),
            (Float { from: f1, to: t1 }, Float { from: f2, to: t2 }) => range_within_f64(*f1, *t1, *f2, *t2),
            (StringType { from: f1, to: t1 }, StringType { from: f2, to: t2 }) => range_within_i64(*f1, *t1, *f2, *t2),
            (Enum(a), Enum(b)) => a.iter().all(|x| b.contains(x)),
            (Enum(_), StringType { .. }) => true,
            (Pattern(_), StringType { .. }) => true,
            (Array { element: e1, from: f1, to: t1 }, Array { element: e2, from: f2, to: t2 }) => {
                e1.is_specialization_of(e2) && range_within_i64(*f1, *t1, *f2, *t2)
            }
            (Hash { key: k1, value: v1, from: f1, to: t1 }, Hash { key: k2, value: v2, from: f2, to: t2 }) => {
                k1.is_specialization_of(k2) && v1.is_specialization_of(v2) && range_within_i64(*f1, *t1, *f2, *t2)
            }
            (Optional(a), Optional(b)) => a.is_specialization_of(b),
            (Undef, Optional(_)) => true,
            (t, Optional(inner)) => t.is_specialization_of(inner),
            (NotUndef(a), NotUndef(b)) => a.is_specialization_of(b),
            (Variant(types), _) => types.iter().all(|t| t.is_specialization_of(other)),
            (_, Variant(types)) => types.iter().any(|o| self.is_specialization_of(o)),
            _ => false,
        }
    }

    /// Parses a textual type specification such as `Array[Integer, 1, 10]`.
    pub fn parse(spec: &str) -> Result<Type, String> {
        let mut parser = TypeParser::new(spec);
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.peek().is_some() {
            return Err(format!("unexpected trailing text in type spec '{}'", spec));
        }
        Ok(ty)
    }
}

fn in_range_i64(n: i64, from: Option<i64>, to: Option<i64>) -> bool {
    from.map(|b| n >= b).unwrap_or(true) && to.map(|b| n <= b).unwrap_or(true)
}

fn in_range_f64(n: f64, from: Option<f64>, to: Option<f64>) -> bool {
    from.map(|b| n >= b).unwrap_or(true) && to.map(|b| n <= b).unwrap_or(true)
}

fn range_within_i64(f1: Option<i64>, t1: Option<i64>, f2: Option<i64>, t2: Option<i64>) -> bool {
    let lower_ok = match f2 {
        None => true,
        Some(b) => matches!(f1, Some(a) if a >= b),
    };
    let upper_ok = match t2 {
        None => true,
        Some(b) => matches!(t1, Some(a) if a <= b),
    };
    lower_ok && upper_ok
}

fn range_within_f64(f1: Option<f64>, t1: Option<f64>, f2: Option<f64>, t2: Option<f64>) -> bool {
    let lower_ok = match f2 {
        None => true,
        Some(b) => matches!(f1, Some(a) if a >= b),
    };
    let upper_ok = match t2 {
        None => true,
        Some(b) => matches!(t1, Some(a) if a <= b),
    };
    lower_ok && upper_ok
}

enum TypeArg {
    Ty(Type),
    Num(i64),
    Str(String),
    Default,
    Struct(Vec<(String, Type)>),
}

struct TypeParser {
    chars: Vec<char>,
    idx: usize,
}

impl TypeParser {
    fn new(src: &str) -> Self {
        TypeParser { chars: src.chars().collect(), idx: 0 }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.idx += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.idx).copied()
    }

    fn eat(&mut self, c: char) -> Result<(), String> {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.idx += 1;
            Ok(())
        } else {
            Err(format!("expected '{}'", c))
        }
    }

    fn at(&mut self, c: char) -> bool {
        self.skip_ws();
        self.peek() == Some(c)
    }

    fn parse_ident(&mut self) -> Result<String, String> {
        self.skip_ws();
        let start = self.idx;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == ':') {
            self.idx += 1;
        }
        if self.idx == start {
            return Err("expected a type name".to_string());
        }
        Ok(self.chars[start..self.idx].iter().collect())
    }

    fn parse_number(&mut self) -> Result<i64, String> {
        self.skip_ws();
        let start = self.idx;
        if self.peek() == Some('-') {
            self.idx += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.idx += 1;
        }
        if self.idx == start {
            return Err("expected a number".to_string());
        }
        let text: String = self.chars[start..self.idx].iter().collect();
        text.parse::<i64>().map_err(|_| format!("'{}' is not a valid integer bound", text))
    }

    fn parse_string(&mut self) -> Result<String, String> {
        self.skip_ws();
        let quote = self.peek().ok_or("expected a string literal")?;
        if quote != '\'' && quote != '"' {
            return Err("expected a string literal".to_string());
        }
        self.idx += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err("unterminated string in type spec".to_string()),
                Some(c) if c == quote => {
                    self.idx += 1;
                    break;
                }
                Some('\\') => {
                    self.idx += 1;
                    if let Some(c) = self.peek() {
                        out.push(c);
                        self.idx += 1;
                    }
                }
                Some(c) => {
                    out.push(c);
                    self.idx += 1;
                }
            }
        }
        Ok(out)
    }

    fn parse_type(&mut self) -> Result<Type, String> {
        let name = self.parse_ident()?;
        if self.at('[') {
            self.eat('[')?;
            let args = self.parse_args()?;
            self.eat(']')?;
            build_parameterized(&name, args)
        } else {
            build_bare(&name)
        }
    }

    fn parse_args(&mut self) -> Result<Vec<TypeArg>, String> {
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                break;
            }
            args.push(self.parse_arg()?);
            if self.at(',') {
                self.eat(',')?;
                continue;
            }
            break;
        }
        Ok(args)
    }

    fn parse_arg(&mut self) -> Result<TypeArg, String> {
        self.skip_ws();
        match self.peek() {
            Some('{') => Ok(TypeArg::Struct(self.parse_struct_body()?)),
            Some('\'') | Some('"') => Ok(TypeArg::Str(self.parse_string()?)),
            Some(c) if c.is_ascii_digit() || (c == '-' && matches!(self.chars.get(self.idx + 1), Some(d) if d.is_ascii_digit())) => {
                Ok(TypeArg::Num(self.parse_number()?))
            }
            _ => {
                let save = self.idx;
                let ident = self.parse_ident()?;
                if ident.eq_ignore_ascii_case("default") {
                    Ok(TypeArg::Default)
                } else {
                    self.idx = save;
                    Ok(TypeArg::Ty(self.parse_type()?))
                }
            }
        }
    }

    fn parse_struct_body(&mut self) -> Result<Vec<(String, Type)>, String> {
        self.eat('{')?;
        let mut fields = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                break;
            }
            let key = if matches!(self.peek(), Some('\'') | Some('"')) { self.parse_string()? } else { self.parse_ident()? };
            self.eat('=')?;
            self.eat('>')?;
            let value_type = self.parse_type()?;
            fields.push((key, value_type));
            if self.at(',') {
                self.eat(',')?;
                continue;
            }
            break;
        }
        self.eat('}')?;
        Ok(fields)
    }
}

fn as_type(arg: TypeArg) -> Result<Type, String> {
    match arg {
        TypeArg::Ty(t) => Ok(t),
        _ => Err("expected a type argument".to_string()),
    }
}

fn as_bound(arg: &TypeArg) -> Option<i64> {
    match arg {
        TypeArg::Num(n) => Some(*n),
        TypeArg::Default => None,
        _ => None,
    }
}

fn as_str(arg: TypeArg) -> Result<String, String> {
    match arg {
        TypeArg::Str(s) => Ok(s),
        _ => Err("expected a string argument".to_string()),
    }
}

fn build_bare(name: &str) -> Result<Type, String> {
    use Type::*;
    Ok(match name {
        "Any" => Any,
        "Undef" => Undef,
        "Default" => DefaultType,
        "Boolean" => Boolean,
        "Scalar" => Scalar,
        "Numeric" => Numeric,
        "Data" => Data,
        "Collection" => Collection,
        "CatalogEntry" => CatalogEntry,
        "Integer" => Integer { from: None, to: None },
        "Float" => Float { from: None, to: None },
        "String" => StringType { from: None, to: None },
        "Regexp" => Regexp(None),
        "Pattern" => Pattern(Vec::new()),
        "Enum" => Enum(Vec::new()),
        "Array" => Array { element: Box::new(Any), from: None, to: None },
        "Hash" => Hash { key: Box::new(Any), value: Box::new(Any), from: None, to: None },
        "Tuple" => Tuple { elements: Vec::new(), from: None, to: None },
        "Struct" => Struct(Vec::new()),
        "Optional" => Optional(Box::new(Any)),
        "NotUndef" => NotUndef(Box::new(Any)),
        "Variant" => Variant(Vec::new()),
        "Callable" => Callable { params: Vec::new(), min: None, max: None },
        "Type" => TypeOf(None),
        "Runtime" => Runtime(Vec::new()),
        "Resource" => Resource { name: None, title: None },
        "Class" => Class(None),
        other => Resource { name: Some(other.to_lowercase()), title: None },
    })
}

fn build_parameterized(name: &str, mut args: Vec<TypeArg>) -> Result<Type, String> {
    use Type::*;
    Ok(match name {
        "Integer" => {
            let from = args.first().and_then(as_bound);
            let to = args.get(1).and_then(as_bound);
            Integer { from, to }
        }
        "Float" => {
            let from = args.first().and_then(as_bound).map(|n| n as f64);
            let to = args.get(1).and_then(as_bound).map(|n| n as f64);
            Float { from, to }
        }
        "String" => {
            let from = args.first().and_then(as_bound);
            let to = args.get(1).and_then(as_bound);
            StringType { from, to }
        }
        "Regexp" => {
            let pattern = args.into_iter().next().map(as_str).transpose()?;
            Regexp(pattern)
        }
        "Pattern" => {
            let patterns = args.into_iter().map(as_str).collect::<Result<Vec<_>, _>>()?;
            Pattern(patterns)
        }
        "Enum" => {
            let values = args.into_iter().map(as_str).collect::<Result<Vec<_>, _>>()?;
            Enum(values)
        }
        "Array" => {
            let mut drained = args.drain(..);
            let element = match drained.next() {
                Some(TypeArg::Ty(t)) => t,
                Some(other) => {
                    let from = as_bound(&other);
                    return Ok(Array { element: Box::new(Any), from, to: drained.next().as_ref().and_then(as_bound) });
                }
                None => Any,
            };
            let rest: Vec<TypeArg> = drained.collect();
            let from = rest.first().and_then(as_bound);
            let to = rest.get(1).and_then(as_bound);
            Array { element: Box::new(element), from, to }
        }
        "Hash" => {
            let key = args.first().map(|a| match a {
                TypeArg::Ty(t) => t.clone(),
                _ => Any,
            }).unwrap_or(Any);
            let value = args.get(1).map(|a| match a {
                TypeArg::Ty(t) => t.clone(),
                _ => Any,
            }).unwrap_or(Any);
            let from = args.get(2).and_then(as_bound);
            let to = args.get(3).and_then(as_bound);
            Hash { key: Box::new(key), value: Box::new(value), from, to }
        }
        "Tuple" => {
            let mut elements = Vec::new();
            let mut bounds = Vec::new();
            for a in args {
                match a {
                    TypeArg::Ty(t) => elements.push(t),
                    other => bounds.push(as_bound(&other)),
                }
            }
            let from = bounds.first().copied().flatten();
            let to = bounds.get(1).copied().flatten();
            Tuple { elements, from, to }
        }
        "Struct" => match args.into_iter().next() {
            Some(TypeArg::Struct(fields)) => Struct(fields),
            _ => return Err("Struct[...] requires a hash of field types".to_string()),
        },
        "Optional" => Optional(Box::new(as_type(args.into_iter().next().ok_or("Optional[] requires a type")?)?)),
        "NotUndef" => match args.into_iter().next() {
            Some(a) => NotUndef(Box::new(as_type(a)?)),
            None => NotUndef(Box::new(Any)),
        },
        "Variant" => {
            let types = args.into_iter().map(as_type).collect::<Result<Vec<_>, _>>()?;
            Variant(types)
        }
        "Callable" => {
            let mut params = Vec::new();
            let mut bounds = Vec::new();
            for a in args {
                match a {
                    TypeArg::Ty(t) => params.push(t),
                    other => bounds.push(as_bound(&other)),
                }
            }
            Callable { params, min: bounds.first().copied().flatten(), max: bounds.get(1).copied().flatten() }
        }
        "Type" => TypeOf(Some(Box::new(as_type(args.into_iter().next().ok_or("Type[] requires a type")?)?))),
        "Runtime" => {
            let parts = args.into_iter().map(as_str).collect::<Result<Vec<_>, _>>()?;
            Runtime(parts)
        }
        "Resource" => {
            let mut it = args.into_iter();
            let name = it.next().map(as_str).transpose()?;
            let title = it.next().map(as_str).transpose()?;
            Resource { name, title }
        }
        "Class" => {
            let title = args.into_iter().next().map(as_str).transpose()?;
            Class(title)
        }
        other => return Err(format!("'{}' does not accept type parameters", other)),
    })
}
