//! Covariate formulas describing the biology to preserve.

use crate::error::{BatchError, Result};
use serde::{Deserialize, Serialize};

/// A parsed additive model formula.
///
/// Supported syntax:
/// - `~ group` - intercept + group
/// - `~ group + age` - intercept + group + age
/// - `~ 0 + group` or `~ group - 1` - no intercept
/// - `~ 1` - intercept only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    /// Whether to include an intercept column.
    pub intercept: bool,
    /// Covariate names, in order of appearance, without duplicates.
    pub covariates: Vec<String>,
}

impl Formula {
    /// Parse a formula string.
    ///
    /// ```
    /// use composable_batch::data::Formula;
    /// let f = Formula::parse("~ group + age").unwrap();
    /// assert!(f.intercept);
    /// assert_eq!(f.covariates, vec!["group", "age"]);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let rhs = formula
            .trim()
            .strip_prefix('~')
            .ok_or_else(|| BatchError::FormulaParse("Formula must start with '~'".to_string()))?
            .trim();
        if rhs.is_empty() {
            return Err(BatchError::FormulaParse(
                "Formula right-hand side is empty".to_string(),
            ));
        }

        let mut intercept = true;
        let mut covariates: Vec<String> = Vec::new();
        let mut negate = false;
        let mut expect_term = true;

        for token in tokenize(rhs) {
            match token.as_str() {
                "+" | "-" => {
                    if expect_term {
                        // leading "-" as in "~ -1 + group"
                        if token == "-" && covariates.is_empty() {
                            negate = true;
                            continue;
                        }
                        return Err(BatchError::FormulaParse(format!(
                            "Unexpected '{}' in '{}'",
                            token, formula
                        )));
                    }
                    negate = token == "-";
                    expect_term = true;
                }
                "0" => {
                    intercept = false;
                    expect_term = false;
                }
                "1" => {
                    intercept = !negate;
                    expect_term = false;
                }
                name => {
                    if negate {
                        return Err(BatchError::FormulaParse(format!(
                            "Removing covariate '{}' is not supported",
                            name
                        )));
                    }
                    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
                        return Err(BatchError::FormulaParse(format!(
                            "Invalid covariate name '{}'",
                            name
                        )));
                    }
                    if !covariates.iter().any(|c| c == name) {
                        covariates.push(name.to_string());
                    }
                    expect_term = false;
                }
            }
            if !expect_term {
                negate = false;
            }
        }

        if expect_term {
            return Err(BatchError::FormulaParse(format!(
                "Formula '{}' ends with an operator",
                formula
            )));
        }
        if !intercept && covariates.is_empty() {
            return Err(BatchError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        }

        Ok(Self {
            intercept,
            covariates,
        })
    }

    /// Intercept-only formula (`~ 1`).
    pub fn intercept_only() -> Self {
        Self {
            intercept: true,
            covariates: Vec::new(),
        }
    }
}

fn tokenize(rhs: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in rhs.chars() {
        match c {
            '+' | '-' => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut terms: Vec<&str> = Vec::new();
        if !self.intercept {
            terms.push("0");
        } else if self.covariates.is_empty() {
            terms.push("1");
        }
        terms.extend(self.covariates.iter().map(String::as_str));
        write!(f, "~ {}", terms.join(" + "))
    }
}
