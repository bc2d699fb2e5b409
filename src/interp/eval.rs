//! Tree-walking evaluator

use std::cmp::Ordering;
use std::collections::HashMap;

use super::library;
use super::parser::{parse, BinOp, CmpOp, CompClause, Expr, Stmt, Target, UnaryOp};
use super::value::Value;
use super::ExecError;

/// Cap on materialised sequences (range, repetition, comprehensions)
const MAX_ITEMS: usize = 10_000_000;

const BUILTINS: [&str; 25] = [
    "print", "len", "list", "tuple", "range", "sum", "min", "max", "abs", "sorted", "reversed",
    "str", "int", "float", "bool", "enumerate", "zip", "dict", "round", "any", "all", "map",
    "filter", "divmod", "repr",
];

const MODULE_NAMES: [&str; 3] = ["nt", "numthy", "math"];

/// Outcome of one `run`: the expression value (if the source was a single
/// expression that produced something) and whatever was printed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Execution {
    pub value: Option<Value>,
    pub stdout: String,
}

#[derive(Debug, Default)]
pub struct Interpreter {
    vars: HashMap<String, Value>,
    stdout: String,
}

enum CompOut<'a> {
    List(&'a Expr, Vec<Value>),
    Dict(&'a Expr, &'a Expr, Vec<(Value, Value)>),
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every binding
    pub fn reset(&mut self) {
        self.vars.clear();
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Parse and run a source snippet. A lone expression yields its value;
    /// anything else runs as statements and yields no value.
    pub fn run(&mut self, src: &str) -> Result<Execution, ExecError> {
        let stmts = parse(src)?;
        self.stdout.clear();

        let result = match stmts.as_slice() {
            [Stmt::Expr(expr)] => self.eval(expr).map(Some),
            _ => stmts.iter().try_for_each(|s| self.exec(s)).map(|_| None),
        };

        let stdout = std::mem::take(&mut self.stdout);
        let value = result?.filter(|v| *v != Value::None);
        Ok(Execution { value, stdout })
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), ExecError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Assign(targets, expr) => {
                let value = self.eval(expr)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            Stmt::AugAssign(target, op, expr) => {
                let current = self.eval(&target_expr(target))?;
                let rhs = self.eval(expr)?;
                let value = binary(*op, &current, &rhs)?;
                self.assign(target, value)?;
            }
            Stmt::Import(alias) => {
                self.vars.insert(alias.clone(), Value::Module);
            }
            Stmt::ImportFrom | Stmt::Pass => {}
        }
        Ok(())
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ExecError> {
        match target {
            Target::Name(name) => {
                self.vars.insert(name.clone(), value);
            }
            Target::Tuple(targets) => {
                let items = value.iter_items()?;
                if items.len() != targets.len() {
                    return Err(ExecError::Value(format!(
                        "cannot unpack {} values into {} names",
                        items.len(),
                        targets.len()
                    )));
                }
                for (t, v) in targets.iter().zip(items) {
                    self.assign(t, v)?;
                }
            }
            Target::Index(container, index) => {
                let Expr::Name(name) = container else {
                    return Err(ExecError::Type("only variables support item assignment".into()));
                };
                let key = self.eval(index)?;
                let mut current = self.lookup(name)?;
                match &mut current {
                    Value::List(items) => {
                        let i = normalize_index(key.as_int()?, items.len())?;
                        items[i] = value;
                    }
                    Value::Dict(pairs) => dict_set(pairs, key, value),
                    other => {
                        return Err(ExecError::Type(format!(
                            "'{}' object does not support item assignment",
                            other.type_name()
                        )))
                    }
                }
                self.vars.insert(name.clone(), current);
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, ExecError> {
        if let Some(v) = self.vars.get(name) {
            return Ok(v.clone());
        }
        if MODULE_NAMES.contains(&name) {
            return Ok(Value::Module);
        }
        if library::is_library(name) || BUILTINS.contains(&name) {
            return Ok(Value::Function(name.to_string()));
        }
        Err(ExecError::Name(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExecError> {
        match expr {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => Ok(Value::List(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::Tuple(self.eval_all(items)?)),
            Expr::Dict(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    let key = self.eval(k)?;
                    let value = self.eval(v)?;
                    dict_set(&mut out, key, value);
                }
                Ok(Value::Dict(out))
            }
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                match (op, v) {
                    (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
                    (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                    (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(f)),
                    (UnaryOp::Neg, v) => Ok(Value::Int(
                        v.as_int()
                            .map_err(|_| bad_operand("unary -", &v))?
                            .checked_neg()
                            .ok_or(ExecError::Overflow)?,
                    )),
                    (UnaryOp::Pos, v) => Ok(Value::Int(v.as_int().map_err(|_| bad_operand("unary +", &v))?)),
                }
            }
            Expr::Binary(op, l, r) => {
                let a = self.eval(l)?;
                let b = self.eval(r)?;
                binary(*op, &a, &b)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, r) in rest {
                    let right = self.eval(r)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(l, r) => {
                let a = self.eval(l)?;
                if !a.truthy() {
                    return Ok(a);
                }
                self.eval(r)
            }
            Expr::Or(l, r) => {
                let a = self.eval(l)?;
                if a.truthy() {
                    return Ok(a);
                }
                self.eval(r)
            }
            Expr::IfElse { cond, then, other } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(other)
                }
            }
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs),
            Expr::Attr(obj, name) => match self.eval(obj)? {
                Value::Module if library::is_library(name) => Ok(Value::Function(name.clone())),
                Value::Module => Err(ExecError::Type(format!(
                    "module 'numthy' has no attribute '{}'",
                    name
                ))),
                other => Err(ExecError::Type(format!(
                    "'{}' object has no attribute '{}'",
                    other.type_name(),
                    name
                ))),
            },
            Expr::Index(target, index) => {
                let container = self.eval(target)?;
                let key = self.eval(index)?;
                index_value(&container, &key)
            }
            Expr::Slice {
                target,
                lower,
                upper,
                step,
            } => {
                let container = self.eval(target)?;
                let lower = self.eval_opt_int(lower.as_deref())?;
                let upper = self.eval_opt_int(upper.as_deref())?;
                let step = self.eval_opt_int(step.as_deref())?;
                slice_value(&container, lower, upper, step)
            }
            Expr::ListComp { element, clauses } => {
                let mut out = CompOut::List(element, Vec::new());
                self.comprehend(clauses, &mut out)?;
                match out {
                    CompOut::List(_, items) => Ok(Value::List(items)),
                    CompOut::Dict(_, _, pairs) => Ok(Value::Dict(pairs)),
                }
            }
            Expr::DictComp { key, value, clauses } => {
                let mut out = CompOut::Dict(key, value, Vec::new());
                self.comprehend(clauses, &mut out)?;
                match out {
                    CompOut::List(_, items) => Ok(Value::List(items)),
                    CompOut::Dict(_, _, pairs) => Ok(Value::Dict(pairs)),
                }
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, ExecError> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval_opt_int(&mut self, expr: Option<&Expr>) -> Result<Option<i128>, ExecError> {
        match expr {
            None => Ok(None),
            Some(e) => match self.eval(e)? {
                Value::None => Ok(None),
                v => v.as_int().map(Some),
            },
        }
    }

    /// Comprehension variables do not leak into the enclosing scope
    fn comprehend(&mut self, clauses: &[CompClause], out: &mut CompOut) -> Result<(), ExecError> {
        let mut names = Vec::new();
        for c in clauses {
            target_names(&c.target, &mut names);
        }
        let saved: Vec<(String, Option<Value>)> = names
            .into_iter()
            .map(|n| {
                let prev = self.vars.get(&n).cloned();
                (n, prev)
            })
            .collect();

        let result = self.comp_loop(clauses, out);

        for (name, prev) in saved {
            match prev {
                Some(v) => self.vars.insert(name, v),
                None => self.vars.remove(&name),
            };
        }
        result
    }

    fn comp_loop(&mut self, clauses: &[CompClause], out: &mut CompOut) -> Result<(), ExecError> {
        let Some((first, rest)) = clauses.split_first() else {
            match out {
                CompOut::List(element, items) => {
                    let v = self.eval(element)?;
                    items.push(v);
                    if items.len() > MAX_ITEMS {
                        return Err(too_large());
                    }
                }
                CompOut::Dict(key, value, pairs) => {
                    let k = self.eval(key)?;
                    let v = self.eval(value)?;
                    dict_set(pairs, k, v);
                }
            }
            return Ok(());
        };

        for item in self.eval(&first.iter)?.iter_items()? {
            self.assign(&first.target, item)?;
            let mut keep = true;
            for cond in &first.conds {
                if !self.eval(cond)?.truthy() {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.comp_loop(rest, out)?;
            }
        }
        Ok(())
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
    ) -> Result<Value, ExecError> {
        let args = self.eval_all(args)?;
        let mut kw = Vec::with_capacity(kwargs.len());
        for (name, e) in kwargs {
            kw.push((name.clone(), self.eval(e)?));
        }

        if let Expr::Attr(obj, method) = func {
            // In-place list mutation needs the variable, not a copy
            if let (Expr::Name(var), "append" | "extend") = (obj.as_ref(), method.as_str()) {
                if let Some(Value::List(_)) = self.vars.get(var) {
                    return self.mutate_list(var, method, args);
                }
            }
            let receiver = self.eval(obj)?;
            if receiver != Value::Module {
                return call_method(&receiver, method, &args);
            }
        }

        match self.eval(func)? {
            Value::Function(name) => self.call_function(&name, args, kw),
            other => Err(ExecError::Type(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn mutate_list(&mut self, var: &str, method: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        let [arg]: [Value; 1] = args
            .try_into()
            .map_err(|_| ExecError::Type(format!("{}() takes exactly one argument", method)))?;
        let extra = if method == "extend" { arg.iter_items()? } else { vec![arg] };
        if let Some(Value::List(items)) = self.vars.get_mut(var) {
            items.extend(extra);
            if items.len() > MAX_ITEMS {
                return Err(too_large());
            }
        }
        Ok(Value::None)
    }

    fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ExecError> {
        if library::is_library(name) {
            if let Some((k, _)) = kwargs.first() {
                return Err(ExecError::Type(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    name, k
                )));
            }
            return library::call(name, &args);
        }

        let kwarg = |key: &str| kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());

        match name {
            "print" => {
                let sep = kwarg("sep").map(|v| v.to_string()).unwrap_or_else(|| " ".into());
                let end = kwarg("end").map(|v| v.to_string()).unwrap_or_else(|| "\n".into());
                let line = args.iter().map(Value::to_string).collect::<Vec<_>>().join(&sep);
                self.stdout.push_str(&line);
                self.stdout.push_str(&end);
                Ok(Value::None)
            }
            "len" => {
                let [v] = exactly::<1>(name, args)?;
                let n = match &v {
                    Value::List(items) | Value::Tuple(items) => items.len(),
                    Value::Dict(pairs) => pairs.len(),
                    Value::Str(s) => s.chars().count(),
                    other => {
                        return Err(ExecError::Type(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(n as i128))
            }
            "list" => match args.as_slice() {
                [] => Ok(Value::List(Vec::new())),
                [v] => Ok(Value::List(v.iter_items()?)),
                _ => Err(arg_count(name, args.len())),
            },
            "tuple" => match args.as_slice() {
                [] => Ok(Value::Tuple(Vec::new())),
                [v] => Ok(Value::Tuple(v.iter_items()?)),
                _ => Err(arg_count(name, args.len())),
            },
            "dict" => match args.as_slice() {
                [] => Ok(Value::Dict(Vec::new())),
                [Value::Dict(pairs)] => Ok(Value::Dict(pairs.clone())),
                [v] => {
                    let mut out = Vec::new();
                    for pair in v.iter_items()? {
                        let kv = pair.iter_items()?;
                        let [k, v]: [Value; 2] = kv.try_into().map_err(|_| {
                            ExecError::Value("dictionary update sequence element has wrong length".into())
                        })?;
                        dict_set(&mut out, k, v);
                    }
                    Ok(Value::Dict(out))
                }
                _ => Err(arg_count(name, args.len())),
            },
            "range" => {
                let ints = args.iter().map(Value::as_int).collect::<Result<Vec<_>, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(arg_count(name, args.len())),
                };
                Ok(Value::List(range(start, stop, step)?.into_iter().map(Value::Int).collect()))
            }
            "sum" => {
                let Some(iterable) = args.first() else {
                    return Err(arg_count(name, 0));
                };
                let mut total = args.get(1).cloned().or_else(|| kwarg("start")).unwrap_or(Value::Int(0));
                for item in iterable.iter_items()? {
                    total = binary(BinOp::Add, &total, &item)?;
                }
                Ok(total)
            }
            "min" | "max" => {
                let items = match args.as_slice() {
                    [single] => single.iter_items()?,
                    _ => args,
                };
                let want = if name == "min" { Ordering::Less } else { Ordering::Greater };
                let mut best: Option<Value> = None;
                for item in items {
                    best = match best {
                        None => Some(item),
                        Some(b) => {
                            if order(&item, &b)? == want {
                                Some(item)
                            } else {
                                Some(b)
                            }
                        }
                    };
                }
                best.ok_or_else(|| ExecError::Value(format!("{}() arg is an empty sequence", name)))
            }
            "abs" => {
                let [v] = exactly::<1>(name, args)?;
                match v {
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    v => Ok(Value::Int(v.as_int()?.checked_abs().ok_or(ExecError::Overflow)?)),
                }
            }
            "sorted" => {
                let [v] = exactly::<1>(name, args)?;
                let mut items = v.iter_items()?;
                if let Some(Value::Function(key)) = kwarg("key") {
                    let mut keyed = Vec::with_capacity(items.len());
                    for item in items {
                        let k = self.call_function(&key, vec![item.clone()], Vec::new())?;
                        keyed.push((k, item));
                    }
                    let keys = sort_values(keyed.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>())?;
                    let mut sorted = Vec::with_capacity(keyed.len());
                    for k in keys {
                        if let Some(pos) = keyed.iter().position(|(kk, _)| values_equal(kk, &k)) {
                            sorted.push(keyed.remove(pos).1);
                        }
                    }
                    items = sorted;
                } else {
                    items = sort_values(items)?;
                }
                if kwarg("reverse").is_some_and(|r| r.truthy()) {
                    items.reverse();
                }
                Ok(Value::List(items))
            }
            "reversed" => {
                let [v] = exactly::<1>(name, args)?;
                let mut items = v.iter_items()?;
                items.reverse();
                Ok(Value::List(items))
            }
            "str" => match args.as_slice() {
                [] => Ok(Value::Str(String::new())),
                [v] => Ok(Value::Str(v.to_string())),
                _ => Err(arg_count(name, args.len())),
            },
            "repr" => {
                let [v] = exactly::<1>(name, args)?;
                Ok(Value::Str(v.repr()))
            }
            "int" => {
                let [v] = exactly::<1>(name, args)?;
                match v {
                    Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i128)),
                    Value::Str(s) => s
                        .trim()
                        .replace('_', "")
                        .parse()
                        .map(Value::Int)
                        .map_err(|_| ExecError::Value(format!("invalid literal for int() with base 10: '{}'", s))),
                    v => Ok(Value::Int(v.as_int()?)),
                }
            }
            "float" => {
                let [v] = exactly::<1>(name, args)?;
                match v {
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map(Value::Float)
                        .map_err(|_| ExecError::Value(format!("could not convert string to float: '{}'", s))),
                    v => Ok(Value::Float(v.as_float()?)),
                }
            }
            "bool" => {
                let [v] = exactly::<1>(name, args)?;
                Ok(Value::Bool(v.truthy()))
            }
            "round" => match args.as_slice() {
                [Value::Float(f)] => Ok(Value::Int(f.round_ties_even() as i128)),
                [v] => Ok(Value::Int(v.as_int()?)),
                [v, digits] => {
                    let scale = 10f64.powi(digits.as_int()? as i32);
                    Ok(Value::Float((v.as_float()? * scale).round_ties_even() / scale))
                }
                _ => Err(arg_count(name, args.len())),
            },
            "divmod" => {
                let [a, b] = exactly::<2>(name, args)?;
                Ok(Value::Tuple(vec![
                    binary(BinOp::FloorDiv, &a, &b)?,
                    binary(BinOp::Mod, &a, &b)?,
                ]))
            }
            "enumerate" => {
                let Some(iterable) = args.first() else {
                    return Err(arg_count(name, 0));
                };
                let start = match args.get(1).cloned().or_else(|| kwarg("start")) {
                    Some(v) => v.as_int()?,
                    None => 0,
                };
                Ok(Value::List(
                    iterable
                        .iter_items()?
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::Tuple(vec![Value::Int(start + i as i128), v]))
                        .collect(),
                ))
            }
            "zip" => {
                let columns = args.iter().map(Value::iter_items).collect::<Result<Vec<_>, _>>()?;
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok(Value::List(
                    (0..len)
                        .map(|i| Value::Tuple(columns.iter().map(|c| c[i].clone()).collect()))
                        .collect(),
                ))
            }
            "any" | "all" => {
                let [v] = exactly::<1>(name, args)?;
                let items = v.iter_items()?;
                let result = if name == "any" {
                    items.iter().any(Value::truthy)
                } else {
                    items.iter().all(Value::truthy)
                };
                Ok(Value::Bool(result))
            }
            "map" | "filter" => {
                let [f, iterable] = exactly::<2>(name, args)?;
                let func = match f {
                    Value::Function(n) => Some(n),
                    Value::None if name == "filter" => None,
                    other => {
                        return Err(ExecError::Type(format!(
                            "'{}' object is not callable",
                            other.type_name()
                        )))
                    }
                };
                let mut out = Vec::new();
                for item in iterable.iter_items()? {
                    let mapped = match &func {
                        Some(f) => self.call_function(f, vec![item.clone()], Vec::new())?,
                        None => item.clone(),
                    };
                    if name == "map" {
                        out.push(mapped);
                    } else if mapped.truthy() {
                        out.push(item);
                    }
                }
                Ok(Value::List(out))
            }
            other => Err(ExecError::Name(other.to_string())),
        }
    }
}

fn target_expr(target: &Target) -> Expr {
    match target {
        Target::Name(n) => Expr::Name(n.clone()),
        Target::Tuple(items) => Expr::Tuple(items.iter().map(target_expr).collect()),
        Target::Index(c, i) => Expr::Index(Box::new(c.clone()), Box::new(i.clone())),
    }
}

fn target_names(target: &Target, out: &mut Vec<String>) {
    match target {
        Target::Name(n) => out.push(n.clone()),
        Target::Tuple(items) => items.iter().for_each(|t| target_names(t, out)),
        Target::Index(..) => {}
    }
}

fn exactly<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], ExecError> {
    let got = args.len();
    args.try_into().map_err(|_| {
        ExecError::Type(format!(
            "{}() takes exactly {} argument(s) ({} given)",
            name, N, got
        ))
    })
}

fn arg_count(name: &str, got: usize) -> ExecError {
    ExecError::Type(format!("{}() got an unexpected number of arguments ({})", name, got))
}

fn too_large() -> ExecError {
    ExecError::Value(format!("sequence larger than {} items", MAX_ITEMS))
}

fn bad_operand(op: &str, v: &Value) -> ExecError {
    ExecError::Type(format!("bad operand type for {}: '{}'", op, v.type_name()))
}

fn range(start: i128, stop: i128, step: i128) -> Result<Vec<i128>, ExecError> {
    if step == 0 {
        return Err(ExecError::Value("range() arg 3 must not be zero".into()));
    }
    let span = if step > 0 { stop.saturating_sub(start) } else { start.saturating_sub(stop) };
    let count = if span <= 0 {
        0
    } else {
        ((span - 1) as u128 / step.unsigned_abs()) as i128 + 1
    };
    if count > MAX_ITEMS as i128 {
        return Err(too_large());
    }
    Ok((0..count).map(|i| start + i * step).collect())
}

fn dict_set(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    match pairs.iter_mut().find(|(k, _)| values_equal(k, &key)) {
        Some(slot) => slot.1 = value,
        None => pairs.push((key, value)),
    }
}

fn normalize_index(i: i128, len: usize) -> Result<usize, ExecError> {
    let idx = if i < 0 { i + len as i128 } else { i };
    if idx < 0 || idx >= len as i128 {
        return Err(ExecError::Index("index out of range".into()));
    }
    Ok(idx as usize)
}

fn index_value(container: &Value, key: &Value) -> Result<Value, ExecError> {
    match container {
        Value::List(items) | Value::Tuple(items) => {
            Ok(items[normalize_index(key.as_int()?, items.len())?].clone())
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[normalize_index(key.as_int()?, chars.len())?].to_string()))
        }
        Value::Dict(pairs) => pairs
            .iter()
            .find(|(k, _)| values_equal(k, key))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ExecError::Index(format!("KeyError: {}", key.repr()))),
        other => Err(ExecError::Type(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn slice_indices(len: usize, lower: Option<i128>, upper: Option<i128>, step: i128) -> Vec<usize> {
    let len = len as i128;
    let clamp = |v: i128, lo: i128, hi: i128| v.max(lo).min(hi);
    let resolve = |v: i128| if v < 0 { v + len } else { v };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map_or(0, |v| clamp(resolve(v), 0, len));
        let stop = upper.map_or(len, |v| clamp(resolve(v), 0, len));
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    } else {
        let start = lower.map_or(len - 1, |v| clamp(resolve(v), -1, len - 1));
        let stop = upper.map_or(-1, |v| clamp(resolve(v), -1, len - 1));
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
    }
    out
}

fn slice_value(
    container: &Value,
    lower: Option<i128>,
    upper: Option<i128>,
    step: Option<i128>,
) -> Result<Value, ExecError> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(ExecError::Value("slice step cannot be zero".into()));
    }
    match container {
        Value::List(items) => Ok(Value::List(
            slice_indices(items.len(), lower, upper, step).into_iter().map(|i| items[i].clone()).collect(),
        )),
        Value::Tuple(items) => Ok(Value::Tuple(
            slice_indices(items.len(), lower, upper, step).into_iter().map(|i| items[i].clone()).collect(),
        )),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(
                slice_indices(chars.len(), lower, upper, step).into_iter().map(|i| chars[i]).collect(),
            ))
        }
        other => Err(ExecError::Type(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ExecError> {
    match (receiver, method, args) {
        (Value::Dict(pairs), "keys", []) => Ok(Value::List(pairs.iter().map(|(k, _)| k.clone()).collect())),
        (Value::Dict(pairs), "values", []) => Ok(Value::List(pairs.iter().map(|(_, v)| v.clone()).collect())),
        (Value::Dict(pairs), "items", []) => Ok(Value::List(
            pairs.iter().map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()])).collect(),
        )),
        (Value::Dict(pairs), "get", [key, rest @ ..]) if rest.len() <= 1 => Ok(pairs
            .iter()
            .find(|(k, _)| values_equal(k, key))
            .map(|(_, v)| v.clone())
            .or_else(|| rest.first().cloned())
            .unwrap_or(Value::None)),
        (Value::List(items) | Value::Tuple(items), "count", [x]) => Ok(Value::Int(
            items.iter().filter(|v| values_equal(v, x)).count() as i128,
        )),
        (Value::List(items) | Value::Tuple(items), "index", [x]) => items
            .iter()
            .position(|v| values_equal(v, x))
            .map(|i| Value::Int(i as i128))
            .ok_or_else(|| ExecError::Value(format!("{} is not in list", x.repr()))),
        (Value::Str(sep), "join", [items]) => {
            let parts = items
                .iter_items()?
                .into_iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s),
                    other => Err(ExecError::Type(format!(
                        "sequence item: expected str instance, {} found",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Str(parts.join(sep)))
        }
        (Value::Str(s), "upper", []) => Ok(Value::Str(s.to_uppercase())),
        (Value::Str(s), "lower", []) => Ok(Value::Str(s.to_lowercase())),
        (Value::Str(s), "strip", []) => Ok(Value::Str(s.trim().to_string())),
        (Value::Str(s), "split", []) => Ok(Value::List(
            s.split_whitespace().map(|p| Value::Str(p.to_string())).collect(),
        )),
        (Value::Str(s), "split", [Value::Str(sep)]) => Ok(Value::List(
            s.split(sep.as_str()).map(|p| Value::Str(p.to_string())).collect(),
        )),
        (Value::Int(i), "bit_length", []) => Ok(Value::Int(i128::from(128 - i.unsigned_abs().leading_zeros()))),
        (other, _, _) => Err(ExecError::Type(format!(
            "'{}' object has no attribute '{}'",
            other.type_name(),
            method
        ))),
    }
}

fn is_intlike(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Bool(_))
}

fn is_numeric(v: &Value) -> bool {
    matches!(v, Value::Int(_) | Value::Bool(_) | Value::Float(_))
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
    }
}

fn repeat<T: Clone>(items: &[T], n: i128) -> Result<Vec<T>, ExecError> {
    let n = n.max(0) as usize;
    if items.len().saturating_mul(n) > MAX_ITEMS {
        return Err(too_large());
    }
    Ok(items.iter().cloned().cycle().take(items.len() * n).collect())
}

pub(crate) fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, ExecError> {
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{}{}", x, y))),
        (BinOp::Add, Value::List(x), Value::List(y)) => Ok(Value::List([x.as_slice(), y.as_slice()].concat())),
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => Ok(Value::Tuple([x.as_slice(), y.as_slice()].concat())),
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if is_intlike(n) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(repeat(&chars, n.as_int()?)?.into_iter().collect()))
        }
        (BinOp::Mul, Value::List(v), n) | (BinOp::Mul, n, Value::List(v)) if is_intlike(n) => {
            Ok(Value::List(repeat(v, n.as_int()?)?))
        }
        (BinOp::Mul, Value::Tuple(v), n) | (BinOp::Mul, n, Value::Tuple(v)) if is_intlike(n) => {
            Ok(Value::Tuple(repeat(v, n.as_int()?)?))
        }
        (BinOp::Pow, _, _) if is_numeric(a) && is_numeric(b) => binary_pow(a, b),
        _ if is_intlike(a) && is_intlike(b) => int_binary(op, a.as_int()?, b.as_int()?),
        _ if is_numeric(a) && is_numeric(b) => float_binary(op, a.as_float()?, b.as_float()?),
        _ => Err(ExecError::Type(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op_symbol(op),
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn int_binary(op: BinOp, a: i128, b: i128) -> Result<Value, ExecError> {
    let checked = |r: Option<i128>| r.map(Value::Int).ok_or(ExecError::Overflow);
    match op {
        BinOp::Add => checked(a.checked_add(b)),
        BinOp::Sub => checked(a.checked_sub(b)),
        BinOp::Mul => checked(a.checked_mul(b)),
        BinOp::Div => {
            if b == 0 {
                return Err(ExecError::ZeroDivision);
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(ExecError::ZeroDivision);
            }
            let q = a.checked_div(b).ok_or(ExecError::Overflow)?;
            let floor = if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q };
            Ok(Value::Int(floor))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(ExecError::ZeroDivision);
            }
            let r = a.checked_rem(b).unwrap_or(0);
            Ok(Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
        }
        BinOp::Pow => binary_pow(&Value::Int(a), &Value::Int(b)),
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> Result<Value, ExecError> {
    let zero_check = || {
        if b == 0.0 {
            Err(ExecError::ZeroDivision)
        } else {
            Ok(())
        }
    };
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            zero_check()?;
            a / b
        }
        BinOp::FloorDiv => {
            zero_check()?;
            (a / b).floor()
        }
        BinOp::Mod => {
            zero_check()?;
            a - b * (a / b).floor()
        }
        BinOp::Pow => a.powf(b),
    }))
}

pub(crate) fn binary_pow(base: &Value, exp: &Value) -> Result<Value, ExecError> {
    if is_intlike(base) && is_intlike(exp) {
        let (b, e) = (base.as_int()?, exp.as_int()?);
        if e < 0 {
            if b == 0 {
                return Err(ExecError::ZeroDivision);
            }
            return Ok(Value::Float((b as f64).powf(e as f64)));
        }
        let e = u32::try_from(e).map_err(|_| ExecError::Overflow)?;
        return b.checked_pow(e).map(Value::Int).ok_or(ExecError::Overflow);
    }
    Ok(Value::Float(base.as_float()?.powf(exp.as_float()?)))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        _ if is_intlike(a) && is_intlike(b) => a.as_int().ok() == b.as_int().ok(),
        _ if is_numeric(a) && is_numeric(b) => a.as_float().ok() == b.as_float().ok(),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.iter().any(|(k2, v2)| values_equal(k, k2) && values_equal(v, v2))
                })
        }
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<Ordering, ExecError> {
    match (a, b) {
        _ if is_intlike(a) && is_intlike(b) => Ok(a.as_int()?.cmp(&b.as_int()?)),
        _ if is_numeric(a) && is_numeric(b) => a
            .as_float()?
            .partial_cmp(&b.as_float()?)
            .ok_or_else(|| ExecError::Value("cannot order nan".into())),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            for (p, q) in x.iter().zip(y) {
                let o = order(p, q)?;
                if o != Ordering::Equal {
                    return Ok(o);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(ExecError::Type(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn sort_values(mut items: Vec<Value>) -> Result<Vec<Value>, ExecError> {
    let mut failure = None;
    items.sort_by(|a, b| match order(a, b) {
        Ok(o) => o,
        Err(e) => {
            failure.get_or_insert(e);
            Ordering::Equal
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(items),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, ExecError> {
    match (container, item) {
        (Value::Str(s), Value::Str(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Str(_), other) => Err(ExecError::Type(format!(
            "'in <string>' requires string as left operand, not {}",
            other.type_name()
        ))),
        (Value::List(items) | Value::Tuple(items), _) => Ok(items.iter().any(|v| values_equal(v, item))),
        (Value::Dict(pairs), _) => Ok(pairs.iter().any(|(k, _)| values_equal(k, item))),
        (other, _) => Err(ExecError::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool, ExecError> {
    Ok(match op {
        CmpOp::Eq => values_equal(a, b),
        CmpOp::Ne => !values_equal(a, b),
        CmpOp::Lt => order(a, b)? == Ordering::Less,
        CmpOp::Le => order(a, b)? != Ordering::Greater,
        CmpOp::Gt => order(a, b)? == Ordering::Greater,
        CmpOp::Ge => order(a, b)? != Ordering::Less,
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
        CmpOp::Is => std::mem::discriminant(a) == std::mem::discriminant(b) && values_equal(a, b),
        CmpOp::IsNot => !(std::mem::discriminant(a) == std::mem::discriminant(b) && values_equal(a, b)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Value {
        Interpreter::new().run(src).unwrap().value.unwrap_or(Value::None)
    }

    fn fails(src: &str) -> ExecError {
        Interpreter::new().run(src).unwrap_err()
    }

    #[test]
    fn test_arithmetic_follows_python() {
        assert_eq!(eval("-7 // 2"), Value::Int(-4));
        assert_eq!(eval("-7 % 3"), Value::Int(2));
        assert_eq!(eval("7 / 2"), Value::Float(3.5));
        assert_eq!(eval("2 ** 10 - 1"), Value::Int(1023));
        assert_eq!(eval("-2 ** 2"), Value::Int(-4));
        assert_eq!(eval("True + True"), Value::Int(2));
        assert_eq!(eval("1 < 2 < 3"), Value::Bool(true));
        assert_eq!(eval("0 or 'x'"), Value::Str("x".into()));
    }

    #[test]
    fn test_overflow_is_an_error() {
        assert_eq!(fails("2 ** 127"), ExecError::Overflow);
        assert_eq!(fails("1 // 0"), ExecError::ZeroDivision);
        assert_eq!(fails("-2**126*2 // -1"), ExecError::Overflow);
        assert_eq!(fails("abs(-2**126*2)"), ExecError::Overflow);
    }

    #[test]
    fn test_extreme_steps_stay_in_bounds() {
        let huge = "2**126-1+2**126";
        assert_eq!(eval(&format!("'abc'[1::{}]", huge)), Value::Str("b".into()));
        assert_eq!(eval(&format!("'abc'[::-({})-1]", huge)), Value::Str("c".into()));
        assert_eq!(eval("list(range(10, 0, -2**126*2))"), Value::List(vec![Value::Int(10)]));
        assert_eq!(eval("list(range(0, 10, -2**126*2))"), Value::List(vec![]));
    }

    #[test]
    fn test_library_overflow_is_an_error() {
        assert_eq!(fails("lcm(-2**126*2, 1)"), ExecError::Overflow);
        assert_eq!(fails("gcd(-2**126*2, 0)"), ExecError::Overflow);
        assert_eq!(fails("next_prime(2**126-1+2**126)"), ExecError::Overflow);
        assert_eq!(eval("pow(3, 5, -2**126*2)"), Value::Int(243 + i128::MIN));
        assert_eq!(eval("pow(7, 3, -1)"), Value::Int(0));
        assert_eq!(eval("crt([2, 3], [3, 5])"), Value::Int(8));
    }

    #[test]
    fn test_state_persists_until_reset() {
        let mut interp = Interpreter::new();
        interp.run("n = 360").unwrap();
        let out = interp.run("nt.divisors(n)[:4]").unwrap();
        assert_eq!(out.value.unwrap().to_string(), "[1, 2, 3, 4]");
        interp.reset();
        assert_eq!(interp.run("n").unwrap_err(), ExecError::Name("n".into()));
    }

    #[test]
    fn test_statements_yield_no_value_but_capture_output() {
        let mut interp = Interpreter::new();
        let out = interp.run("x = 3; print('x is', x)").unwrap();
        assert_eq!(out.value, None);
        assert_eq!(out.stdout, "x is 3\n");
        // print returns None, so a lone call has no value either
        let out = interp.run("print(1, 2, sep=',')").unwrap();
        assert_eq!(out.value, None);
        assert_eq!(out.stdout, "1,2\n");
    }

    #[test]
    fn test_comprehensions_and_builtins() {
        assert_eq!(
            eval("[p for p in primes(50) if p % 4 == 1]").to_string(),
            "[5, 13, 17, 29, 37, 41]"
        );
        assert_eq!(eval("sum(x * x for x in range(4))"), Value::Int(14));
        assert_eq!(eval("{p: e for p, e in factor(72).items()}").to_string(), "{2: 3, 3: 2}");
        assert_eq!(eval("sorted([3, 1, 2], reverse=True)").to_string(), "[3, 2, 1]");
        assert_eq!(eval("', '.join(map(str, divisors(6)))"), Value::Str("1, 2, 3, 6".into()));
        assert_eq!(eval("list(zip([1, 2], 'ab'))").to_string(), "[(1, 'a'), (2, 'b')]");
        assert_eq!(eval("max(totient(n) for n in range(1, 11))"), Value::Int(6));
    }

    #[test]
    fn test_comprehension_variables_do_not_leak() {
        let mut interp = Interpreter::new();
        interp.run("p = 'kept'").unwrap();
        interp.run("[p for p in range(3)]").unwrap();
        assert_eq!(interp.get("p"), Some(&Value::Str("kept".into())));
    }

    #[test]
    fn test_unpacking_and_item_assignment() {
        let mut interp = Interpreter::new();
        interp.run("g, x, y = egcd(240, 46)").unwrap();
        assert_eq!(interp.get("g"), Some(&Value::Int(2)));
        interp.run("d = {}\nd['a'] = 1\nxs = [0, 0]\nxs[-1] = 5\nxs.append(7)").unwrap();
        assert_eq!(interp.run("d").unwrap().value.unwrap().to_string(), "{'a': 1}");
        assert_eq!(interp.run("xs").unwrap().value.unwrap().to_string(), "[0, 5, 7]");
        assert!(interp.run("a, b = [1, 2, 3]").is_err());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(fails("undefined_thing").to_string(), "name 'undefined_thing' is not defined");
        assert_eq!(fails("import numpy").to_string(), "No module named 'numpy'");
        assert!(fails("nt.nope(1)").to_string().contains("has no attribute 'nope'"));
        assert!(fails("'a' + 1").to_string().starts_with("unsupported operand type(s) for +"));
        assert!(fails("divisors(").to_string().starts_with("Syntax error"));
    }

    #[test]
    fn test_import_is_harmless() {
        let mut interp = Interpreter::new();
        assert_eq!(interp.run("import numthy as nt").unwrap().value, None);
        assert_eq!(eval("nt.is_prime(97)"), Value::Bool(true));
        assert_eq!(eval("None"), Value::None);
    }
}
