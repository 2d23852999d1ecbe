//! Structural validation of dynamically supplied cost calculators.
//!
//! A calculator is called with two positional arguments (the op type and its
//! input descriptors) plus every context entry as a keyword argument. Its
//! declared parameter list must be able to accept exactly that:
//!
//! - at least two positional slots (or a variadic positional parameter)
//! - no required positional parameter beyond the second
//! - no required keyword-only parameter
//! - a keyword-capture (`VarKeyword`) parameter, so new context keys never
//!   break an existing calculator

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::cost::OpType;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Positional { has_default: bool },
    VarPositional,
    KeywordOnly { has_default: bool },
    VarKeyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    /// Declared type. On the first positional parameter this names the op
    /// type the calculator is written for.
    #[serde(default)]
    pub annotation: Option<String>,
}

impl Parameter {
    pub fn positional(name: &str) -> Self {
        Self::with_kind(name, ParamKind::Positional { has_default: false })
    }

    pub fn optional(name: &str) -> Self {
        Self::with_kind(name, ParamKind::Positional { has_default: true })
    }

    pub fn var_positional(name: &str) -> Self {
        Self::with_kind(name, ParamKind::VarPositional)
    }

    pub fn keyword_only(name: &str, has_default: bool) -> Self {
        Self::with_kind(name, ParamKind::KeywordOnly { has_default })
    }

    pub fn var_keyword(name: &str) -> Self {
        Self::with_kind(name, ParamKind::VarKeyword)
    }

    pub fn annotated(mut self, ty: &str) -> Self {
        self.annotation = Some(ty.to_string());
        self
    }

    fn with_kind(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            annotation: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Parameter>,
}

impl Signature {
    pub fn new(params: Vec<Parameter>) -> Self {
        Self { params }
    }

    /// Op type named by the first positional parameter's annotation.
    pub fn target(&self) -> Option<OpType> {
        self.params
            .iter()
            .find(|p| matches!(p.kind, ParamKind::Positional { .. }))
            .and_then(|p| p.annotation.as_deref())
            .map(OpType::from)
    }
}

pub fn validate(sig: &Signature) -> Result<()> {
    let mut seen = HashSet::new();
    for p in &sig.params {
        if !seen.insert(p.name.as_str()) {
            return Err(Error::Signature(format!("duplicate parameter '{}'", p.name)));
        }
    }

    let mut positional = 0usize;
    let mut variadic = false;
    let mut kwargs = false;
    for p in &sig.params {
        match p.kind {
            ParamKind::Positional { has_default } => {
                positional += 1;
                if positional > 2 && !has_default {
                    return Err(Error::Signature(format!(
                        "positional parameter '{}' is required but only two arguments are passed",
                        p.name
                    )));
                }
            }
            ParamKind::VarPositional => variadic = true,
            ParamKind::KeywordOnly { has_default: false } => {
                return Err(Error::Signature(format!(
                    "keyword-only parameter '{}' has no default",
                    p.name
                )));
            }
            ParamKind::KeywordOnly { has_default: true } => {}
            ParamKind::VarKeyword => kwargs = true,
        }
    }

    if positional < 2 && !variadic {
        return Err(Error::Signature(format!(
            "expected at least 2 positional parameters (op, inputs), found {positional}"
        )));
    }
    if !kwargs {
        return Err(Error::Signature(
            "missing keyword-capture parameter for context".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<Parameter> {
        vec![
            Parameter::positional("func").annotated("AddConstant"),
            Parameter::positional("in_data"),
        ]
    }

    #[test]
    fn accepts_op_inputs_kwargs() {
        let mut params = base();
        params.push(Parameter::var_keyword("kwargs"));
        let sig = Signature::new(params);
        validate(&sig).unwrap();
        assert_eq!(sig.target(), Some(OpType::from("AddConstant")));
    }

    #[test]
    fn accepts_variadic_positional_and_defaults() {
        let sig = Signature::new(vec![
            Parameter::var_positional("args"),
            Parameter::keyword_only("scale", true),
            Parameter::var_keyword("kwargs"),
        ]);
        validate(&sig).unwrap();
        assert_eq!(sig.target(), None);

        let mut params = base();
        params.push(Parameter::optional("extra"));
        params.push(Parameter::var_keyword("kw"));
        validate(&Signature::new(params)).unwrap();
    }

    #[test]
    fn rejects_missing_kwargs() {
        let err = validate(&Signature::new(base())).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn rejects_too_few_positional() {
        let sig = Signature::new(vec![
            Parameter::positional("func"),
            Parameter::var_keyword("kwargs"),
        ]);
        assert!(matches!(validate(&sig), Err(Error::Signature(_))));
    }

    #[test]
    fn rejects_required_third_positional() {
        let mut params = base();
        params.push(Parameter::positional("out_data"));
        params.push(Parameter::var_keyword("kwargs"));
        assert!(matches!(
            validate(&Signature::new(params)),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn rejects_required_keyword_only() {
        let mut params = base();
        params.push(Parameter::keyword_only("mode", false));
        params.push(Parameter::var_keyword("kwargs"));
        assert!(matches!(
            validate(&Signature::new(params)),
            Err(Error::Signature(_))
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let sig = Signature::new(vec![
            Parameter::positional("x"),
            Parameter::positional("x"),
            Parameter::var_keyword("kwargs"),
        ]);
        assert!(matches!(validate(&sig), Err(Error::Signature(_))));
    }

    #[test]
    fn signature_from_json() {
        let sig: Signature = serde_json::from_str(
            r#"{"params": [
                {"name": "func", "kind": {"positional": {"has_default": false}}, "annotation": "ReLU"},
                {"name": "in_data", "kind": {"positional": {"has_default": false}}},
                {"name": "kwargs", "kind": "var_keyword"}
            ]}"#,
        )
        .unwrap();
        validate(&sig).unwrap();
        assert_eq!(sig.target().unwrap().as_str(), "ReLU");
    }
}
