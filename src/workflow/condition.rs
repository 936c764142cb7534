//! Condition Language
//!
//! Jobs and steps may carry an `if` expression over other jobs' outcomes:
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := JOB | 'JOB' | "JOB" | true | false | "(" expr ")"
//! ```
//!
//! A job token is true iff that job finished with `success`. Expressions are
//! parsed once at load time; evaluation is pure over a [`RunState`].

use std::fmt;

use log::debug;

use crate::error::{ConditionError, ConditionSyntaxError};
use crate::execution::state::{JobOutcome, RunState};

/// Parsed boolean expression over job outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Literal(bool),
    Job(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, is_success: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Expr::Literal(value) => *value,
            Expr::Job(id) => is_success(id),
            Expr::Not(inner) => !inner.eval(is_success),
            Expr::And(left, right) => left.eval(is_success) & right.eval(is_success),
            Expr::Or(left, right) => left.eval(is_success) | right.eval(is_success),
        }
    }

    fn collect_jobs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Job(id) => {
                if !out.contains(&id.as_str()) {
                    out.push(id);
                }
            }
            Expr::Not(inner) => inner.collect_jobs(out),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_jobs(out);
                right.collect_jobs(out);
            }
        }
    }

    fn rename(&mut self, map: &dyn Fn(&str) -> Option<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Job(id) => {
                if let Some(renamed) = map(id) {
                    *id = renamed;
                }
            }
            Expr::Not(inner) => inner.rename(map),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.rename(map);
                right.rename(map);
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Job(id) => f.write_str(id),
            Expr::Not(inner) => write!(f, "not {}", inner),
            Expr::And(left, right) => write!(f, "({} and {})", left, right),
            Expr::Or(left, right) => write!(f, "({} or {})", left, right),
        }
    }
}

/// A job or step guard: the source text, its parsed form, and any extra
/// jobs the guard declares it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    source: String,
    expr: Expr,
    needs: Vec<String>,
}

impl Condition {
    /// Parses an expression.
    ///
    /// # Example
    ///
    /// ```
    /// use localflow::workflow::Condition;
    ///
    /// let condition = Condition::parse("build and not 'lint'").unwrap();
    /// assert_eq!(condition.references(), vec!["build", "lint"]);
    /// assert!(Condition::parse("build and").is_err());
    /// ```
    pub fn parse(source: &str) -> Result<Self, ConditionSyntaxError> {
        let expr = Parser::new(source)?.parse()?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
            needs: Vec::new(),
        })
    }

    /// Condition that is always true.
    pub fn always() -> Self {
        Self {
            source: "true".to_string(),
            expr: Expr::Literal(true),
            needs: Vec::new(),
        }
    }

    /// Adds jobs the condition needs evaluated beforehand.
    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for need in needs {
            let need = need.into();
            if !self.needs.contains(&need) {
                self.needs.push(need);
            }
        }
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn needs(&self) -> &[String] {
        &self.needs
    }

    /// Job ids referenced by the expression, in order of appearance.
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.expr.collect_jobs(&mut out);
        out
    }

    /// Referenced jobs plus the declared `needs`, without duplicates.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut out = self.references();
        for need in &self.needs {
            if !out.contains(&need.as_str()) {
                out.push(need);
            }
        }
        out
    }

    /// Rewrites job references, e.g. to turn job keys into job ids.
    pub fn rename_references(&mut self, map: impl Fn(&str) -> Option<String>) {
        self.expr.rename(&map);
        for need in &mut self.needs {
            if let Some(renamed) = map(need) {
                *need = renamed;
            }
        }
    }

    /// Evaluates the condition against the outcomes recorded so far.
    ///
    /// Every referenced job must be part of the run and terminal; a pending
    /// or running reference is an error, never a silent `false`.
    pub fn evaluate(&self, state: &RunState) -> Result<bool, ConditionError> {
        let references = self.references();
        let mut values = Vec::with_capacity(references.len());

        for job in &references {
            match state.outcome(job) {
                None => return Err(ConditionError::UnknownJob(job.to_string())),
                Some(outcome) if !outcome.is_terminal() => {
                    return Err(ConditionError::UnresolvedJob {
                        job: job.to_string(),
                        outcome: outcome.to_string(),
                    })
                }
                Some(outcome) => values.push(format!("{}={}", job, outcome)),
            }
        }

        let result = self
            .expr
            .eval(&|job| state.outcome(job) == Some(JobOutcome::Success));

        debug!(
            "Condition '{}' evaluated to {} [{}]",
            self.source,
            result,
            values.join(", ")
        );

        Ok(result)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parses and evaluates an expression in one go.
pub fn evaluate(expression: &str, state: &RunState) -> Result<bool, ConditionError> {
    Condition::parse(expression)?.evaluate(state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    LParen,
    RParen,
    And,
    Or,
    Not,
    True,
    False,
    Ident(String),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn tokenize(source: &str) -> Result<Vec<Token>, ConditionSyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '(' || c == ')' {
            chars.next();
            tokens.push(Token {
                kind: if c == '(' {
                    TokenKind::LParen
                } else {
                    TokenKind::RParen
                },
                start,
                end: start + 1,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let mut value = String::new();
            let mut end = None;
            for (i, ch) in chars.by_ref() {
                if ch == c {
                    end = Some(i + 1);
                    break;
                }
                value.push(ch);
            }
            let end = end.ok_or_else(|| syntax_error(source, &source[start..], "unterminated quote"))?;
            if value.trim().is_empty() {
                return Err(syntax_error(source, &source[start..end], "empty job id"));
            }
            tokens.push(Token {
                kind: TokenKind::Ident(value.trim().to_string()),
                start,
                end,
            });
            continue;
        }

        if is_ident_char(c) {
            let mut end = start;
            while let Some(&(i, ch)) = chars.peek() {
                if !is_ident_char(ch) {
                    break;
                }
                end = i + ch.len_utf8();
                chars.next();
            }
            let word = &source[start..end];
            let kind = match word {
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "not" => TokenKind::Not,
                "true" => TokenKind::True,
                "false" => TokenKind::False,
                _ => TokenKind::Ident(word.to_string()),
            };
            tokens.push(Token { kind, start, end });
            continue;
        }

        let end = start + c.len_utf8();
        return Err(syntax_error(
            source,
            &source[start..end],
            &format!("unexpected character '{}'", c),
        ));
    }

    Ok(tokens)
}

fn syntax_error(source: &str, fragment: &str, message: &str) -> ConditionSyntaxError {
    ConditionSyntaxError {
        expression: source.to_string(),
        fragment: fragment.trim().to_string(),
        message: message.to_string(),
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self, ConditionSyntaxError> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn parse(mut self) -> Result<Expr, ConditionSyntaxError> {
        if self.tokens.is_empty() {
            return Err(syntax_error(self.source, "", "empty expression"));
        }
        let expr = self.parse_or()?;
        if let Some(token) = self.tokens.get(self.pos) {
            return Err(self.error_at(token, "unexpected trailing input"));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionSyntaxError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionSyntaxError> {
        let mut left = self.parse_unary()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionSyntaxError> {
        if self.eat(&TokenKind::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionSyntaxError> {
        let token = match self.tokens.get(self.pos) {
            Some(token) => token.clone(),
            None => return Err(self.error_at_end("expected a job id")),
        };
        self.pos += 1;

        match token.kind {
            TokenKind::Ident(id) => Ok(Expr::Job(id)),
            TokenKind::True => Ok(Expr::Literal(true)),
            TokenKind::False => Ok(Expr::Literal(false)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                match self.tokens.get(self.pos) {
                    Some(t) if t.kind == TokenKind::RParen => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    Some(t) => Err(self.error_at(t, "expected ')'")),
                    None => Err(syntax_error(
                        self.source,
                        &self.source[token.start..],
                        "unclosed '('",
                    )),
                }
            }
            _ => Err(self.error_at(&token, "expected a job id")),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        match self.tokens.get(self.pos) {
            Some(token) if &token.kind == kind => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn error_at(&self, token: &Token, message: &str) -> ConditionSyntaxError {
        syntax_error(self.source, &self.source[token.start..], message)
    }

    fn error_at_end(&self, message: &str) -> ConditionSyntaxError {
        let fragment = self
            .tokens
            .last()
            .map(|t| &self.source[t.start..t.end])
            .unwrap_or("");
        syntax_error(self.source, fragment, &format!("{} at end of expression", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pairs: &[(&str, JobOutcome)]) -> RunState {
        let mut state = RunState::new(pairs.iter().map(|(id, _)| *id));
        for (id, outcome) in pairs {
            state.set(*id, *outcome);
        }
        state
    }

    #[test]
    fn test_single_token() {
        let s = state(&[("build", JobOutcome::Success), ("lint", JobOutcome::Failed)]);
        assert!(evaluate("build", &s).unwrap());
        assert!(!evaluate("lint", &s).unwrap());
    }

    #[test]
    fn test_skipped_job_is_not_success() {
        let s = state(&[("build", JobOutcome::Skipped)]);
        assert!(!evaluate("build", &s).unwrap());
        assert!(evaluate("not build", &s).unwrap());
    }

    #[test]
    fn test_truth_table() {
        let cases = [
            (JobOutcome::Success, JobOutcome::Success, true, true),
            (JobOutcome::Success, JobOutcome::Failed, false, true),
            (JobOutcome::Failed, JobOutcome::Success, false, true),
            (JobOutcome::Failed, JobOutcome::Failed, false, false),
        ];
        for (a, b, and, or) in cases {
            let s = state(&[("a", a), ("b", b)]);
            assert_eq!(evaluate("a and b", &s).unwrap(), and, "{:?} and {:?}", a, b);
            assert_eq!(evaluate("a or b", &s).unwrap(), or, "{:?} or {:?}", a, b);
        }
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let s = state(&[
            ("a", JobOutcome::Success),
            ("b", JobOutcome::Failed),
            ("c", JobOutcome::Failed),
        ]);
        // a or (b and c)
        assert!(evaluate("a or b and c", &s).unwrap());
        // (b and c) or a
        assert!(evaluate("b and c or a", &s).unwrap());
        assert!(!evaluate("(a or b) and c", &s).unwrap());
    }

    #[test]
    fn test_not_and_parentheses() {
        let s = state(&[("a", JobOutcome::Success), ("b", JobOutcome::Failed)]);
        assert!(evaluate("not b", &s).unwrap());
        assert!(!evaluate("not (a or b)", &s).unwrap());
        assert!(evaluate("not not a", &s).unwrap());
        assert!(evaluate("((a))", &s).unwrap());
    }

    #[test]
    fn test_quoted_tokens() {
        let s = state(&[("job-1", JobOutcome::Success), ("and", JobOutcome::Success)]);
        assert!(evaluate("'job-1' and \"and\"", &s).unwrap());

        let condition = Condition::parse("'job-1' or other").unwrap();
        assert_eq!(condition.references(), vec!["job-1", "other"]);
    }

    #[test]
    fn test_literals() {
        let s = RunState::default();
        assert!(evaluate("true", &s).unwrap());
        assert!(!evaluate("false", &s).unwrap());
        assert!(Condition::always().evaluate(&s).unwrap());
    }

    #[test]
    fn test_pending_reference_is_error() {
        let s = state(&[("a", JobOutcome::Success), ("b", JobOutcome::Pending)]);
        let err = evaluate("a or b", &s).unwrap_err();
        assert_eq!(
            err,
            ConditionError::UnresolvedJob {
                job: "b".to_string(),
                outcome: "pending".to_string()
            }
        );

        let s = state(&[("b", JobOutcome::Running)]);
        assert!(matches!(
            evaluate("b", &s),
            Err(ConditionError::UnresolvedJob { .. })
        ));
    }

    #[test]
    fn test_unknown_reference_is_error() {
        let s = state(&[("a", JobOutcome::Success)]);
        assert_eq!(
            evaluate("a and ghost", &s).unwrap_err(),
            ConditionError::UnknownJob("ghost".to_string())
        );
    }

    #[test]
    fn test_syntax_errors_name_fragment() {
        let cases = [
            ("", ""),
            ("   ", ""),
            ("a and", "and"),
            ("a b", "b"),
            ("(a or b", "(a or b"),
            ("a)", ")"),
            ("and a", "and a"),
            ("a & b", "&"),
            ("'a", "'a"),
            ("not", "not"),
        ];

        for (expression, fragment) in cases {
            let err = Condition::parse(expression).unwrap_err();
            assert_eq!(err.fragment, fragment, "expression {:?}", expression);
            assert_eq!(err.expression, expression);
        }
    }

    #[test]
    fn test_dependencies_include_needs() {
        let condition = Condition::parse("a or b")
            .unwrap()
            .with_needs(["c", "a"]);
        assert_eq!(condition.dependencies(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rename_references() {
        let mut condition = Condition::parse("build and not test")
            .unwrap()
            .with_needs(["deploy"]);
        condition.rename_references(|name| match name {
            "build" => Some("job_1".to_string()),
            "deploy" => Some("job_3".to_string()),
            _ => None,
        });
        assert_eq!(condition.references(), vec!["job_1", "test"]);
        assert_eq!(condition.needs(), &["job_3".to_string()]);
        assert_eq!(condition.source(), "build and not test");
    }

    #[test]
    fn test_display_shows_structure() {
        let condition = Condition::parse("a or b and not c").unwrap();
        assert_eq!(condition.expr().to_string(), "(a or (b and not c))");
    }
}
