use serde::{Deserialize, Serialize};

/// S-expression nodes of the script language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Expr {
    /// A bare symbol (variable, special form, builtin or external function).
    Symbol(String),
    /// Keyword tokens (leading colon), used for keyword arguments and exception kinds.
    Keyword(String),
    /// String literal.
    String(String),
    /// Signed integer literal.
    Integer(i64),
    /// Floating-point literal.
    Float(f64),
    /// Boolean literal.
    Boolean(bool),
    /// `nil` literal.
    Nil,
    /// Nested list.
    List(Vec<Expr>),
}

impl Expr {
    /// Symbol text, if this node is a symbol.
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Expr::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    /// List items, if this node is a list.
    pub fn as_list(&self) -> Option<&[Expr]> {
        match self {
            Expr::List(items) => Some(items),
            _ => None,
        }
    }
}

/// A parsed script: the ordered top-level forms plus the original text.
#[derive(Debug, Clone)]
pub struct Program {
    /// Parsed forms.
    pub forms: Vec<Expr>,
    /// Original source text, retained for error reporting.
    pub source: String,
}

impl Program {
    /// Construct a program from parsed forms.
    pub fn new(source: impl Into<String>, forms: Vec<Expr>) -> Self {
        Self {
            source: source.into(),
            forms,
        }
    }
}
