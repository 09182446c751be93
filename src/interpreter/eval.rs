//! Tree-walking evaluator with replay of answered external calls.

use super::EngineError;
use super::ast::{Expr, Program};
use super::checkpoint::JournalEntry;
use super::value::Value;
use crate::progress::{ExceptionInfo, Limits, PrintEmission, ResumeInstruction};
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Non-local exits from evaluation.
#[derive(Debug)]
pub(crate) enum Flow {
    /// A catchable script exception.
    Raise(ExceptionInfo),
    /// The script reached an unanswered external call.
    Suspend(Suspension),
    /// An uncatchable failure (limits, replay divergence, malformed forms).
    Fatal(EngineError),
}

/// An external call waiting for the host.
#[derive(Debug)]
pub(crate) struct Suspension {
    pub function_name: String,
    pub args: Vec<Json>,
    pub kwargs: Map<String, Json>,
}

type Eval<T> = Result<T, Flow>;
type Args = (Vec<Value>, Vec<(String, Value)>);

fn raise<T>(kind: &str, message: impl Into<String>) -> Eval<T> {
    Err(Flow::Raise(ExceptionInfo {
        kind: kind.to_string(),
        message: message.into(),
    }))
}

fn malformed<T>(form: &str, detail: &str) -> Eval<T> {
    Err(Flow::Fatal(EngineError::Syntax(format!(
        "malformed `{form}`: {detail}"
    ))))
}

fn limit<T>(detail: String) -> Eval<T> {
    Err(Flow::Fatal(EngineError::Limit(detail)))
}

const DEADLINE_CHECK_INTERVAL: u64 = 256;

pub(crate) struct Evaluator<'a> {
    externals: HashSet<&'a str>,
    journal: &'a [JournalEntry],
    cursor: usize,
    limits: Limits,
    deadline: Option<Instant>,
    live: bool,
    steps: u64,
    replay_steps: u64,
    depth: usize,
    skip_prints: usize,
    prints_seen: usize,
    prints: Vec<PrintEmission>,
    env: HashMap<String, Value>,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        externals: &'a [String],
        journal: &'a [JournalEntry],
        limits: Limits,
        skip_prints: usize,
    ) -> Self {
        Self {
            externals: externals.iter().map(String::as_str).collect(),
            journal,
            cursor: 0,
            limits,
            deadline: None,
            live: false,
            steps: 0,
            replay_steps: 0,
            depth: 0,
            skip_prints,
            prints_seen: 0,
            prints: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Evaluate every top-level form; the program value is the last one.
    pub fn run(&mut self, program: &Program) -> Eval<Value> {
        let mut last = Value::Nil;
        for form in &program.forms {
            last = self.eval(form)?;
        }
        if self.cursor < self.journal.len() {
            return Err(Flow::Fatal(EngineError::Checkpoint(format!(
                "script finished with {} unreplayed journal entries",
                self.journal.len() - self.cursor
            ))));
        }
        Ok(last)
    }

    pub fn prints_seen(&self) -> usize {
        self.prints_seen
    }

    pub fn take_prints(&mut self) -> Vec<PrintEmission> {
        std::mem::take(&mut self.prints)
    }

    /// Budgets cover only the work after the last answered call. Replay of
    /// answered segments is bounded by one step budget per segment.
    fn tick(&mut self) -> Eval<()> {
        if self.cursor < self.journal.len() {
            self.replay_steps += 1;
            let segments = u64::try_from(self.journal.len()).unwrap_or(u64::MAX);
            let replay_budget = self.limits.max_steps.saturating_mul(segments);
            if self.replay_steps > replay_budget {
                return Err(Flow::Fatal(EngineError::Checkpoint(format!(
                    "replay exceeded {replay_budget} steps"
                ))));
            }
            return Ok(());
        }
        if !self.live {
            self.live = true;
            self.deadline =
                Instant::now().checked_add(Duration::from_millis(self.limits.max_duration_ms));
        }
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return limit(format!(
                "step limit of {} exceeded",
                self.limits.max_steps
            ));
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0
            && self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
        {
            return limit(format!(
                "time limit of {} ms exceeded",
                self.limits.max_duration_ms
            ));
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        self.tick()?;
        match expr {
            Expr::Nil => Ok(Value::Nil),
            Expr::Boolean(flag) => Ok(Value::Bool(*flag)),
            Expr::Integer(num) => Ok(Value::Int(*num)),
            Expr::Float(num) => Ok(Value::Float(*num)),
            Expr::String(text) | Expr::Keyword(text) => Ok(Value::Str(text.clone())),
            Expr::Symbol(name) => match self.env.get(name) {
                Some(value) => Ok(value.clone()),
                None => raise("NameError", format!("name '{name}' is not defined")),
            },
            Expr::List(items) => {
                self.depth += 1;
                let result = if self.depth > self.limits.max_depth {
                    limit(format!(
                        "nesting depth limit of {} exceeded",
                        self.limits.max_depth
                    ))
                } else {
                    self.eval_list(items)
                };
                self.depth -= 1;
                result
            }
        }
    }

    fn eval_body(&mut self, body: &[Expr]) -> Eval<Value> {
        let mut last = Value::Nil;
        for expr in body {
            last = self.eval(expr)?;
        }
        Ok(last)
    }

    fn eval_list(&mut self, items: &[Expr]) -> Eval<Value> {
        let Some((head, rest)) = items.split_first() else {
            return Ok(Value::Nil);
        };
        let Some(name) = head.as_symbol() else {
            return raise("TypeError", "list head is not callable");
        };
        match name {
            "do" => self.eval_body(rest),
            "let" => self.eval_let(rest),
            "if" => self.eval_if(rest),
            "while" => self.eval_while(rest),
            "for" => self.eval_for(rest),
            "and" => self.eval_and(rest),
            "or" => self.eval_or(rest),
            "try" => self.eval_try(rest),
            "raise" => self.eval_raise(rest),
            _ => {
                let args = self.eval_args(rest)?;
                if self.externals.contains(name) {
                    return self.call_external(name, args);
                }
                match self.call_builtin(name, args) {
                    Some(result) => result,
                    None => raise("NameError", format!("name '{name}' is not defined")),
                }
            }
        }
    }

    fn eval_args(&mut self, exprs: &[Expr]) -> Eval<Args> {
        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        let mut iter = exprs.iter();
        while let Some(expr) = iter.next() {
            if let Expr::Keyword(key) = expr {
                let Some(value_expr) = iter.next() else {
                    return raise(
                        "TypeError",
                        format!("keyword argument ':{key}' is missing a value"),
                    );
                };
                let value = self.eval(value_expr)?;
                if keywords.iter().any(|(existing, _)| existing == key) {
                    return raise(
                        "TypeError",
                        format!("keyword argument ':{key}' given more than once"),
                    );
                }
                keywords.push((key.clone(), value));
            } else {
                positional.push(self.eval(expr)?);
            }
        }
        Ok((positional, keywords))
    }

    fn call_external(&mut self, name: &str, (args, kwargs): Args) -> Eval<Value> {
        let Some(entry) = self.journal.get(self.cursor) else {
            return Err(Flow::Suspend(Suspension {
                function_name: name.to_string(),
                args: args.iter().map(Value::to_json).collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            }));
        };
        if entry.function_name != name {
            return Err(Flow::Fatal(EngineError::Checkpoint(format!(
                "replay diverged: journal answers '{}' but script called '{name}'",
                entry.function_name
            ))));
        }
        self.cursor += 1;
        match &entry.instruction {
            ResumeInstruction::ReturnValue(value) => Ok(Value::from_json(value)),
            ResumeInstruction::Exception(info) => Err(Flow::Raise(info.clone())),
        }
    }

    fn emit(&mut self, emission: PrintEmission) {
        self.prints_seen += 1;
        if self.prints_seen > self.skip_prints {
            self.prints.push(emission);
        }
    }

    fn eval_let(&mut self, rest: &[Expr]) -> Eval<Value> {
        if rest.is_empty() || rest.len() % 2 != 0 {
            return malformed("let", "expected name/value pairs");
        }
        let mut last = Value::Nil;
        for pair in rest.chunks(2) {
            let Some(name) = pair[0].as_symbol() else {
                return malformed("let", "binding name must be a symbol");
            };
            last = self.eval(&pair[1])?;
            self.env.insert(name.to_string(), last.clone());
        }
        Ok(last)
    }

    fn eval_if(&mut self, rest: &[Expr]) -> Eval<Value> {
        match rest {
            [cond, then] => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    Ok(Value::Nil)
                }
            }
            [cond, then, otherwise] => {
                if self.eval(cond)?.is_truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            _ => malformed("if", "expected a condition and one or two branches"),
        }
    }

    fn eval_while(&mut self, rest: &[Expr]) -> Eval<Value> {
        let Some((cond, body)) = rest.split_first() else {
            return malformed("while", "missing condition");
        };
        while self.eval(cond)?.is_truthy() {
            self.eval_body(body)?;
        }
        Ok(Value::Nil)
    }

    fn eval_for(&mut self, rest: &[Expr]) -> Eval<Value> {
        let [binding, iterable, body @ ..] = rest else {
            return malformed("for", "expected a name and an iterable");
        };
        let Some(name) = binding.as_symbol() else {
            return malformed("for", "loop variable must be a symbol");
        };
        let items = match self.eval(iterable)? {
            Value::List(items) => items,
            Value::Dict(entries) => entries.into_keys().map(Value::Str).collect(),
            Value::Str(text) => text.chars().map(|ch| Value::Str(ch.to_string())).collect(),
            other => {
                return raise(
                    "TypeError",
                    format!("'{}' object is not iterable", other.type_name()),
                );
            }
        };
        for item in items {
            self.env.insert(name.to_string(), item);
            self.eval_body(body)?;
        }
        Ok(Value::Nil)
    }

    fn eval_and(&mut self, rest: &[Expr]) -> Eval<Value> {
        let mut last = Value::Bool(true);
        for expr in rest {
            last = self.eval(expr)?;
            if !last.is_truthy() {
                break;
            }
        }
        Ok(last)
    }

    fn eval_or(&mut self, rest: &[Expr]) -> Eval<Value> {
        let mut last = Value::Bool(false);
        for expr in rest {
            last = self.eval(expr)?;
            if last.is_truthy() {
                break;
            }
        }
        Ok(last)
    }

    fn eval_try(&mut self, rest: &[Expr]) -> Eval<Value> {
        let split = rest.iter().position(is_except_clause).unwrap_or(rest.len());
        let (body, clause_forms) = rest.split_at(split);
        let mut clauses = Vec::with_capacity(clause_forms.len());
        for form in clause_forms {
            let Some(items) = form.as_list().filter(|_| is_except_clause(form)) else {
                return malformed("try", "body forms may not follow except clauses");
            };
            clauses.push(ExceptClause::parse(&items[1..]));
        }

        match self.eval_body(body) {
            Err(Flow::Raise(info)) => {
                for clause in &clauses {
                    if !clause.matches(&info.kind) {
                        continue;
                    }
                    if let Some(binding) = clause.binding {
                        self.env.insert(binding.to_string(), exception_value(&info));
                    }
                    return self.eval_body(clause.body);
                }
                Err(Flow::Raise(info))
            }
            other => other,
        }
    }

    fn eval_raise(&mut self, rest: &[Expr]) -> Eval<Value> {
        let (kind, message_expr) = match rest {
            [] => ("RuntimeError", None),
            [Expr::Keyword(kind)] => (kind.as_str(), None),
            [Expr::Keyword(kind), message] => (kind.as_str(), Some(message)),
            [message] => ("RuntimeError", Some(message)),
            _ => return malformed("raise", "expected an optional :Kind and a message"),
        };
        let message = match message_expr {
            Some(expr) => self.eval(expr)?,
            None => Value::Str(String::new()),
        };
        // Re-raising a caught exception keeps its kind.
        let explicit_kind = matches!(rest.first(), Some(Expr::Keyword(_)));
        if let (false, Value::Dict(entries)) = (explicit_kind, &message) {
            if let (Some(Value::Str(kind)), Some(Value::Str(text))) =
                (entries.get("kind"), entries.get("message"))
            {
                return raise(kind, text.clone());
            }
        }
        raise(kind, message.to_string())
    }

    fn call_builtin(&mut self, name: &str, (args, kwargs): Args) -> Option<Eval<Value>> {
        let result = match name {
            "print" | "write" => {
                let default_end = if name == "print" { "\n" } else { "" };
                let mut end = default_end.to_string();
                for (key, value) in kwargs {
                    match (key.as_str(), value) {
                        ("end", Value::Str(text)) => end = text,
                        ("end", other) => end = other.to_string(),
                        (other, _) => {
                            return Some(raise(
                                "TypeError",
                                format!("`{name}` got an unexpected keyword argument ':{other}'"),
                            ));
                        }
                    }
                }
                self.emit(PrintEmission {
                    values: args.iter().map(Value::to_json).collect(),
                    end,
                });
                Ok(Value::Nil)
            }
            "dict" => build_dict(args, kwargs),
            _ => {
                if !kwargs.is_empty() && is_builtin(name) {
                    return Some(raise(
                        "TypeError",
                        format!("`{name}` takes no keyword arguments"),
                    ));
                }
                return pure_builtin(name, args);
            }
        };
        Some(result)
    }
}

fn is_except_clause(expr: &Expr) -> bool {
    expr.as_list()
        .and_then(|items| items.first())
        .and_then(Expr::as_symbol)
        == Some("except")
}

struct ExceptClause<'e> {
    kind: Option<&'e str>,
    binding: Option<&'e str>,
    body: &'e [Expr],
}

impl<'e> ExceptClause<'e> {
    fn parse(mut items: &'e [Expr]) -> Self {
        let mut kind = None;
        if let Some(Expr::Keyword(name)) = items.first() {
            kind = Some(name.as_str());
            items = &items[1..];
        }
        let mut binding = None;
        if let Some(Expr::Symbol(name)) = items.first() {
            binding = Some(name.as_str());
            items = &items[1..];
        }
        Self {
            kind,
            binding,
            body: items,
        }
    }

    fn matches(&self, raised: &str) -> bool {
        match self.kind {
            None | Some("Exception") => true,
            Some(kind) => canonical_kind(kind) == canonical_kind(raised),
        }
    }
}

fn canonical_kind(kind: &str) -> &str {
    match kind {
        "ToolError" => "RuntimeError",
        other => other,
    }
}

fn exception_value(info: &ExceptionInfo) -> Value {
    let mut entries = BTreeMap::new();
    entries.insert("kind".to_string(), Value::Str(info.kind.clone()));
    entries.insert("message".to_string(), Value::Str(info.message.clone()));
    Value::Dict(entries)
}

const BUILTINS: &[&str] = &[
    "list", "get", "len", "str", "append", "keys", "not", "type", "+", "-", "*", "/", "%", "=",
    "!=", "<", ">", "<=", ">=",
];

fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn pure_builtin(name: &str, args: Vec<Value>) -> Option<Eval<Value>> {
    let result = match name {
        "list" => Ok(Value::List(args)),
        "get" => builtin_get(args),
        "len" => unary(name, args).and_then(|value| match value {
            Value::Str(text) => Ok(Value::Int(text.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            Value::Dict(entries) => Ok(Value::Int(entries.len() as i64)),
            other => raise(
                "TypeError",
                format!("object of type '{}' has no len()", other.type_name()),
            ),
        }),
        "str" => Ok(Value::Str(
            args.iter().map(Value::to_string).collect::<String>(),
        )),
        "append" => {
            let mut iter = args.into_iter();
            match iter.next() {
                Some(Value::List(mut items)) => {
                    items.extend(iter);
                    Ok(Value::List(items))
                }
                Some(other) => raise(
                    "TypeError",
                    format!("cannot append to '{}'", other.type_name()),
                ),
                None => raise("TypeError", "`append` expects a list"),
            }
        }
        "keys" => unary(name, args).and_then(|value| match value {
            Value::Dict(entries) => Ok(Value::List(entries.into_keys().map(Value::Str).collect())),
            other => raise(
                "TypeError",
                format!("'{}' object has no keys", other.type_name()),
            ),
        }),
        "not" => unary(name, args).map(|value| Value::Bool(!value.is_truthy())),
        "type" => unary(name, args).map(|value| Value::Str(value.type_name().to_string())),
        "+" => fold_numeric(args, Value::Int(0), add),
        "*" => fold_numeric(args, Value::Int(1), mul),
        "-" => subtract(args),
        "/" => divide(args),
        "%" => modulo(args),
        "=" => pairwise(&args, |a, b| Ok(a.loose_eq(b))).map(Value::Bool),
        "!=" => binary(name, &args).map(|(a, b)| Value::Bool(!a.loose_eq(b))),
        "<" => compare_chain(&args, "<", Ordering::is_lt),
        ">" => compare_chain(&args, ">", Ordering::is_gt),
        "<=" => compare_chain(&args, "<=", Ordering::is_le),
        ">=" => compare_chain(&args, ">=", Ordering::is_ge),
        _ => return None,
    };
    Some(result)
}

fn unary(name: &str, args: Vec<Value>) -> Eval<Value> {
    let count = args.len();
    let mut iter = args.into_iter();
    match (iter.next(), count) {
        (Some(value), 1) => Ok(value),
        _ => raise(
            "TypeError",
            format!("`{name}` expects 1 argument, got {count}"),
        ),
    }
}

fn binary<'v>(name: &str, args: &'v [Value]) -> Eval<(&'v Value, &'v Value)> {
    match args {
        [a, b] => Ok((a, b)),
        _ => raise(
            "TypeError",
            format!("`{name}` expects 2 arguments, got {}", args.len()),
        ),
    }
}

fn builtin_get(args: Vec<Value>) -> Eval<Value> {
    let (collection, key, default) = match args.as_slice() {
        [collection, key] => (collection, key, Value::Nil),
        [collection, key, default] => (collection, key, default.clone()),
        _ => {
            return raise(
                "TypeError",
                format!("`get` expects 2 or 3 arguments, got {}", args.len()),
            );
        }
    };
    let found = match (collection, key) {
        (Value::Dict(entries), Value::Str(key)) => entries.get(key).cloned(),
        (Value::List(items), Value::Int(index)) => {
            normalize_index(*index, items.len()).map(|at| items[at].clone())
        }
        (Value::Str(text), Value::Int(index)) => {
            let chars: Vec<char> = text.chars().collect();
            normalize_index(*index, chars.len()).map(|at| Value::Str(chars[at].to_string()))
        }
        (collection, key) => {
            return raise(
                "TypeError",
                format!(
                    "cannot index '{}' with '{}'",
                    collection.type_name(),
                    key.type_name()
                ),
            );
        }
    };
    Ok(found.unwrap_or(default))
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

fn build_dict(args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Eval<Value> {
    if args.len() % 2 != 0 {
        return raise("TypeError", "`dict` expects key/value pairs");
    }
    let mut entries = BTreeMap::new();
    let mut iter = args.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let Value::Str(key) = key else {
            return raise(
                "TypeError",
                format!("dict keys must be str, not '{}'", key.type_name()),
            );
        };
        entries.insert(key, value);
    }
    entries.extend(kwargs);
    Ok(Value::Dict(entries))
}

fn operand_error<T>(op: &str, a: &Value, b: &Value) -> Eval<T> {
    raise(
        "TypeError",
        format!(
            "unsupported operand types for {op}: '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ),
    )
}

fn overflow<T>() -> Eval<T> {
    raise("OverflowError", "integer overflow")
}

fn fold_numeric(
    args: Vec<Value>,
    identity: Value,
    op: fn(Value, Value) -> Eval<Value>,
) -> Eval<Value> {
    let mut iter = args.into_iter();
    let Some(first) = iter.next() else {
        return Ok(identity);
    };
    iter.try_fold(first, op)
}

fn add(a: Value, b: Value) -> Eval<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.checked_add(y).map(Value::Int).map_or_else(overflow, Ok),
        (Value::Str(x), y) => Ok(Value::Str(format!("{x}{y}"))),
        (Value::List(mut x), Value::List(y)) => {
            x.extend(y);
            Ok(Value::List(x))
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Float(x + y)),
            _ => operand_error("+", &a, &b),
        },
    }
}

fn mul(a: Value, b: Value) -> Eval<Value> {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => x.checked_mul(*y).map(Value::Int).map_or_else(overflow, Ok),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(Value::Float(x * y)),
            _ => operand_error("*", &a, &b),
        },
    }
}

fn subtract(args: Vec<Value>) -> Eval<Value> {
    match args.as_slice() {
        [] => raise("TypeError", "`-` expects at least 1 argument"),
        [Value::Int(x)] => x.checked_neg().map(Value::Int).map_or_else(overflow, Ok),
        [Value::Float(x)] => Ok(Value::Float(-x)),
        [other] => raise(
            "TypeError",
            format!("bad operand type for unary -: '{}'", other.type_name()),
        ),
        [first, rest @ ..] => {
            let mut acc = first.clone();
            for item in rest {
                acc = match (&acc, item) {
                    (Value::Int(x), Value::Int(y)) => {
                        x.checked_sub(*y).map(Value::Int).map_or_else(overflow, Ok)?
                    }
                    _ => match (acc.as_f64(), item.as_f64()) {
                        (Some(x), Some(y)) => Value::Float(x - y),
                        _ => return operand_error("-", &acc, item),
                    },
                };
            }
            Ok(acc)
        }
    }
}

fn divide(args: Vec<Value>) -> Eval<Value> {
    let (a, b) = binary("/", &args)?;
    match (a.as_f64(), b.as_f64()) {
        (Some(_), Some(y)) if y == 0.0 => raise("ZeroDivisionError", "division by zero"),
        (Some(x), Some(y)) => Ok(Value::Float(x / y)),
        _ => operand_error("/", a, b),
    }
}

fn modulo(args: Vec<Value>) -> Eval<Value> {
    let (a, b) = binary("%", &args)?;
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => raise("ZeroDivisionError", "modulo by zero"),
        (Value::Int(x), Value::Int(y)) => {
            let rem = x.checked_rem(*y).map_or_else(overflow, Ok)?;
            // Result takes the sign of the divisor.
            Ok(Value::Int(if rem != 0 && (rem < 0) != (*y < 0) {
                rem + y
            } else {
                rem
            }))
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(_), Some(y)) if y == 0.0 => raise("ZeroDivisionError", "modulo by zero"),
            (Some(x), Some(y)) => Ok(Value::Float(x - y * (x / y).floor())),
            _ => operand_error("%", a, b),
        },
    }
}

fn pairwise(args: &[Value], mut test: impl FnMut(&Value, &Value) -> Eval<bool>) -> Eval<bool> {
    if args.len() < 2 {
        return raise(
            "TypeError",
            format!("comparison expects at least 2 arguments, got {}", args.len()),
        );
    }
    for window in args.windows(2) {
        if !test(&window[0], &window[1])? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compare_chain(args: &[Value], op: &str, accept: fn(Ordering) -> bool) -> Eval<Value> {
    pairwise(args, |a, b| {
        let ordering = match (a, b) {
            (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => {
                    return raise(
                        "TypeError",
                        format!(
                            "'{op}' not supported between '{}' and '{}'",
                            a.type_name(),
                            b.type_name()
                        ),
                    );
                }
            },
        };
        Ok(ordering.is_some_and(accept))
    })
    .map(Value::Bool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::parser::parse_program;

    fn eval_source(source: &str) -> Eval<Value> {
        let program = parse_program(source).expect("parse");
        let mut evaluator = Evaluator::new(&[], &[], Limits::default(), 0);
        evaluator.run(&program)
    }

    fn value_of(source: &str) -> Value {
        match eval_source(source) {
            Ok(value) => value,
            Err(flow) => panic!("evaluation failed: {flow:?}"),
        }
    }

    fn raised_kind(source: &str) -> String {
        match eval_source(source) {
            Err(Flow::Raise(info)) => info.kind,
            other => panic!("expected an exception, got {other:?}"),
        }
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(value_of("(+ 1 2 3)"), Value::Int(6));
        assert_eq!(value_of("(- 10 4 1)"), Value::Int(5));
        assert_eq!(value_of("(- 3)"), Value::Int(-3));
        assert_eq!(value_of("(* 2 2.5)"), Value::Float(5.0));
        assert_eq!(value_of("(/ 7 2)"), Value::Float(3.5));
        assert_eq!(value_of("(% -7 3)"), Value::Int(2));
        assert_eq!(value_of("(< 1 2 3)"), Value::Bool(true));
        assert_eq!(value_of("(>= 2 3)"), Value::Bool(false));
        assert_eq!(value_of("(= 2 2.0)"), Value::Bool(true));
        assert_eq!(value_of("(+ \"n=\" 4)"), Value::Str("n=4".into()));
    }

    #[test]
    fn control_flow_and_bindings() {
        let source = r#"
            (let total 0 i 0)
            (while (< i 5)
              (let total (+ total i))
              (let i (+ i 1)))
            (for x (list 10 20) (let total (+ total x)))
            total
        "#;
        assert_eq!(value_of(source), Value::Int(40));
        assert_eq!(value_of("(if nil 1 2)"), Value::Int(2));
        assert_eq!(value_of("(and 1 0 2)"), Value::Int(0));
        assert_eq!(value_of("(or nil \"x\")"), Value::Str("x".into()));
    }

    #[test]
    fn collections() {
        assert_eq!(value_of("(len (list 1 2 3))"), Value::Int(3));
        assert_eq!(value_of("(get (list 1 2 3) -1)"), Value::Int(3));
        assert_eq!(value_of("(get (dict :a 1) \"b\" 9)"), Value::Int(9));
        assert_eq!(
            value_of("(keys (dict \"b\" 1 :a 2))"),
            Value::List(vec![Value::Str("a".into()), Value::Str("b".into())])
        );
        assert_eq!(
            value_of("(append (list 1) 2 3)"),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(value_of("(type 1.5)"), Value::Str("float".into()));
    }

    #[test]
    fn exceptions_are_catchable_by_kind() {
        let source = r#"
            (try
              (raise :ValueError "bad")
              (except :KeyError e "wrong")
              (except :ValueError e (get e "message")))
        "#;
        assert_eq!(value_of(source), Value::Str("bad".into()));

        let source = r#"(try (raise "boom") (except :ToolError e (get e "kind")))"#;
        assert_eq!(value_of(source), Value::Str("RuntimeError".into()));

        assert_eq!(raised_kind("(try (/ 1 0) (except :KeyError 1))"), "ZeroDivisionError");
        assert_eq!(raised_kind("(undefined 1)"), "NameError");
        assert_eq!(raised_kind("missing"), "NameError");
    }

    #[test]
    fn reraise_keeps_the_original_kind() {
        let source = r#"(try (raise :KeyError "k") (except e (raise e)))"#;
        match eval_source(source) {
            Err(Flow::Raise(info)) => {
                assert_eq!(info.kind, "KeyError");
                assert_eq!(info.message, "k");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn limits_are_not_catchable() {
        let program = parse_program("(try (while true 1) (except e 0))").unwrap();
        let limits = Limits {
            max_steps: 500,
            ..Limits::default()
        };
        let mut evaluator = Evaluator::new(&[], &[], limits, 0);
        assert!(matches!(
            evaluator.run(&program),
            Err(Flow::Fatal(EngineError::Limit(_)))
        ));

        let program = parse_program("(+ 1 (+ 1 (+ 1 (+ 1 1))))").unwrap();
        let limits = Limits {
            max_depth: 3,
            ..Limits::default()
        };
        let mut evaluator = Evaluator::new(&[], &[], limits, 0);
        assert!(matches!(
            evaluator.run(&program),
            Err(Flow::Fatal(EngineError::Limit(_)))
        ));
    }

    #[test]
    fn external_calls_suspend_then_replay_from_the_journal() {
        let externals = vec!["echo".to_string()];
        let program = parse_program("(print \"a\") (let r (echo :x 1)) (print \"b\") r").unwrap();

        let mut evaluator = Evaluator::new(&externals, &[], Limits::default(), 0);
        match evaluator.run(&program) {
            Err(Flow::Suspend(suspension)) => {
                assert_eq!(suspension.function_name, "echo");
                assert_eq!(suspension.kwargs.get("x"), Some(&serde_json::json!(1)));
            }
            other => panic!("expected suspension, got {other:?}"),
        }
        assert_eq!(evaluator.take_prints().len(), 1);

        let journal = vec![JournalEntry {
            function_name: "echo".into(),
            instruction: ResumeInstruction::ReturnValue(serde_json::json!({"y": 2})),
        }];
        let mut evaluator = Evaluator::new(&externals, &journal, Limits::default(), 1);
        let value = evaluator.run(&program).unwrap();
        assert_eq!(value.to_json(), serde_json::json!({"y": 2}));
        let prints = evaluator.take_prints();
        assert_eq!(prints.len(), 1);
        assert_eq!(prints[0].values, vec![serde_json::json!("b")]);
    }

    #[test]
    fn replayed_segments_do_not_count_against_the_step_budget() {
        let externals = vec!["echo".to_string()];
        let program = parse_program(
            "(let i 0) (while (< i 50) (let i (+ i 1))) (echo) \
             (let i 0) (while (< i 50) (let i (+ i 1))) i",
        )
        .unwrap();
        let limits = Limits {
            max_steps: 400,
            ..Limits::default()
        };

        let mut evaluator = Evaluator::new(&externals, &[], limits, 0);
        assert!(matches!(evaluator.run(&program), Err(Flow::Suspend(_))));
        let first_segment = evaluator.steps;
        assert!(first_segment > 200 && first_segment <= 400);

        let journal = vec![JournalEntry {
            function_name: "echo".into(),
            instruction: ResumeInstruction::ReturnValue(Json::Null),
        }];
        let mut evaluator = Evaluator::new(&externals, &journal, limits, 0);
        assert_eq!(evaluator.run(&program).unwrap(), Value::Int(50));
        assert_eq!(evaluator.replay_steps, first_segment);
        assert!(evaluator.steps < first_segment + 10);
    }

    #[test]
    fn replay_divergence_is_a_checkpoint_error() {
        let externals = vec!["echo".to_string(), "other".to_string()];
        let program = parse_program("(other)").unwrap();
        let journal = vec![JournalEntry {
            function_name: "echo".into(),
            instruction: ResumeInstruction::ReturnValue(Json::Null),
        }];
        let mut evaluator = Evaluator::new(&externals, &journal, Limits::default(), 0);
        assert!(matches!(
            evaluator.run(&program),
            Err(Flow::Fatal(EngineError::Checkpoint(_)))
        ));
    }
}
