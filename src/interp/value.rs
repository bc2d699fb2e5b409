//! Runtime values of the statement language

use std::fmt;

use super::ExecError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered mapping
    Dict(Vec<(Value, Value)>),
    /// A library or builtin function, looked up by name at call time
    Function(String),
    /// The `nt` namespace
    Module,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Module => "module",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(v) | Value::Tuple(v) => !v.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Function(_) | Value::Module => true,
        }
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, Value::List(_) | Value::Tuple(_))
    }

    /// Integer view; bools count as 0/1 like Python
    pub fn as_int(&self) -> Result<i128, ExecError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(i128::from(*b)),
            other => Err(ExecError::Type(format!(
                "expected int, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_float(&self) -> Result<f64, ExecError> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            other => Err(ExecError::Type(format!(
                "expected number, got {}",
                other.type_name()
            ))),
        }
    }

    /// Materialise anything iterable into its items
    pub fn iter_items(&self) -> Result<Vec<Value>, ExecError> {
        match self {
            Value::List(v) | Value::Tuple(v) => Ok(v.clone()),
            Value::Dict(d) => Ok(d.iter().map(|(k, _)| k.clone()).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            other => Err(ExecError::Type(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Python `repr`: strings quoted
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

/// Python `str`
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => write!(f, "[{}]", join_repr(items)),
            Value::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0].repr()),
            Value::Tuple(items) => write!(f, "({})", join_repr(items)),
            Value::Dict(pairs) => {
                let body = pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{{{}}}", body)
            }
            Value::Function(name) => write!(f, "<function {}>", name),
            Value::Module => write!(f, "<module 'numthy'>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_style_display() {
        let v = Value::List(vec![Value::Int(1), Value::Str("a".into()), Value::None]);
        assert_eq!(v.to_string(), "[1, 'a', None]");
        assert_eq!(Value::Tuple(vec![Value::Int(7)]).to_string(), "(7,)");
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
        let d = Value::Dict(vec![(Value::Int(2), Value::Int(3)), (Value::Int(5), Value::Int(1))]);
        assert_eq!(d.to_string(), "{2: 3, 5: 1}");
        assert_eq!(Value::Str("hi".into()).to_string(), "hi");
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::List(vec![]).truthy());
        assert!(Value::Int(-1).truthy());
        assert!(!Value::None.truthy());
    }
}
