//! JEXL expression evaluation for match conditions, concurrency keys and step
//! expressions.
//!
//! Expressions see named inputs only (`input`, `output`, `additional_metadata`)
//! passed as a context object. Payloads are NEVER interpolated into
//! expression strings.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::cache::TtlCache;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression compile failed: {0}")]
    CompileFailed(String),

    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression did not evaluate to a boolean: got {result}")]
    NotBoolean { result: Value },

    #[error("expression did not evaluate to a string: got {result}")]
    NotString { result: Value },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// Evaluator port
// ---------------------------------------------------------------------------

/// A compiled expression, cheap to clone and share across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledExpression {
    source: Arc<str>,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }
}

pub trait ExpressionEvaluator: Send + Sync {
    fn compile(&self, expression: &str) -> Result<CompiledExpression, ExpressionError>;

    /// Evaluate against a context object and return the raw value.
    fn evaluate(
        &self,
        program: &CompiledExpression,
        context: &Value,
    ) -> Result<Value, ExpressionError>;
}

// ---------------------------------------------------------------------------
// JEXL implementation
// ---------------------------------------------------------------------------

thread_local! {
    static JEXL: jexl_eval::Evaluator<'static> = build_evaluator();
}

fn build_evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_uppercase()))
        })
        .with_transform("string", |args: &[Value]| {
            let rendered = match args.first() {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            Ok(json!(rendered))
        })
        .with_transform("contains", |args: &[Value]| {
            let found = match (args.first(), args.get(1)) {
                (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                _ => false,
            };
            Ok(json!(found))
        })
        .with_transform("startsWith", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.starts_with(prefix)))
        })
        .with_transform("endsWith", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.ends_with(suffix)))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("exists", |args: &[Value]| {
            Ok(json!(!matches!(args.first(), None | Some(Value::Null))))
        })
}

/// Compiling parses the source, so syntax errors surface from `compile`.
/// `jexl-eval` only evaluates source text, which is what a compiled
/// expression keeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct JexlEvaluator;

impl ExpressionEvaluator for JexlEvaluator {
    fn compile(&self, expression: &str) -> Result<CompiledExpression, ExpressionError> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(ExpressionError::CompileFailed("empty expression".to_string()));
        }
        jexl_parser::Parser::parse(trimmed).map_err(|e| {
            ExpressionError::CompileFailed(jexl_eval::error::EvaluationError::from(e).to_string())
        })?;
        Ok(CompiledExpression {
            source: Arc::from(trimmed),
        })
    }

    fn evaluate(
        &self,
        program: &CompiledExpression,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        JEXL.with(|evaluator| {
            evaluator
                .eval_in_context(program.source(), context)
                .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
        })
    }
}

// ---------------------------------------------------------------------------
// Compile cache
// ---------------------------------------------------------------------------

/// Evaluator front with a compile cache. Compile failures are cached too so a
/// broken expression is not recompiled for every candidate event.
pub struct CachedEvaluator {
    inner: Arc<dyn ExpressionEvaluator>,
    programs: TtlCache<String, Result<CompiledExpression, ExpressionError>>,
}

impl CachedEvaluator {
    pub fn new(inner: Arc<dyn ExpressionEvaluator>, ttl: Duration) -> Self {
        Self {
            inner,
            programs: TtlCache::new(ttl),
        }
    }

    pub fn jexl(ttl: Duration) -> Self {
        Self::new(Arc::new(JexlEvaluator), ttl)
    }

    pub fn compile(&self, expression: &str) -> Result<CompiledExpression, ExpressionError> {
        if let Some(cached) = self.programs.get(expression) {
            return cached;
        }
        let compiled = self.inner.compile(expression);
        self.programs.insert(expression.to_string(), compiled.clone());
        compiled
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        let program = self.compile(expression)?;
        self.inner.evaluate(&program, context)
    }

    /// Strict boolean evaluation: any non-boolean result is an error.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        match self.evaluate_value(expression, context)? {
            Value::Bool(b) => Ok(b),
            result => Err(ExpressionError::NotBoolean { result }),
        }
    }

    /// Evaluation for concurrency keys. Numbers and booleans are rendered;
    /// anything else is an error.
    pub fn evaluate_string(&self, expression: &str, context: &Value) -> Result<String, ExpressionError> {
        match self.evaluate_value(expression, context)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            result => Err(ExpressionError::NotString { result }),
        }
    }
}

impl std::fmt::Debug for CachedEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEvaluator")
            .field("programs", &self.programs)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn evaluator() -> CachedEvaluator {
        CachedEvaluator::jexl(Duration::from_secs(60))
    }

    #[test]
    fn test_true_literal() {
        assert!(evaluator().evaluate_bool("true", &json!({})).unwrap());
    }

    #[test]
    fn test_output_field_comparison() {
        let ctx = json!({"input": {}, "output": {"skipped": true}});
        assert!(evaluator().evaluate_bool("output.skipped == true", &ctx).unwrap());

        let ctx = json!({"input": {}, "output": {"value": 3}});
        assert!(!evaluator().evaluate_bool("output.skipped == true", &ctx).unwrap());
    }

    #[test]
    fn test_input_scope() {
        let ctx = json!({"input": {"amount": 150}, "output": {}});
        assert!(evaluator().evaluate_bool("input.amount > 100", &ctx).unwrap());
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({"input": {"name": "ACME", "tags": ["a", "b"]}});
        let eval = evaluator();
        assert!(eval.evaluate_bool("input.name|lower == 'acme'", &ctx).unwrap());
        assert!(eval.evaluate_bool("input.tags|length == 2", &ctx).unwrap());
        assert!(eval.evaluate_bool("input.tags|contains('b')", &ctx).unwrap());
    }

    #[test]
    fn test_non_boolean_is_an_error() {
        let err = evaluator()
            .evaluate_bool("input.amount", &json!({"input": {"amount": 1}}))
            .unwrap_err();
        assert!(matches!(err, ExpressionError::NotBoolean { .. }));
    }

    #[test]
    fn test_syntax_error_fails_compile() {
        let err = evaluator().compile("input.amount >").unwrap_err();
        assert!(matches!(err, ExpressionError::CompileFailed(_)));

        let result = evaluator().evaluate_bool("input.amount >", &json!({"input": {}}));
        assert!(matches!(result, Err(ExpressionError::CompileFailed(_))));
    }

    #[test]
    fn test_empty_expression_fails_compile() {
        let err = evaluator().compile("   ").unwrap_err();
        assert!(matches!(err, ExpressionError::CompileFailed(_)));
    }

    #[test]
    fn test_evaluate_string_for_concurrency_keys() {
        let ctx = json!({"input": {"user": "u1", "n": 4}});
        let eval = evaluator();
        assert_eq!(eval.evaluate_string("input.user", &ctx).unwrap(), "u1");
        assert_eq!(eval.evaluate_string("input.n", &ctx).unwrap(), "4");
        assert!(eval.evaluate_string("input.missing", &ctx).is_err());
    }

    #[test]
    fn test_context_must_be_object() {
        let result = evaluator().evaluate_value("true", &json!([1]));
        assert!(matches!(result, Err(ExpressionError::InvalidContext(_))));
    }

    struct CountingEvaluator {
        compiles: AtomicUsize,
    }

    impl ExpressionEvaluator for CountingEvaluator {
        fn compile(&self, expression: &str) -> Result<CompiledExpression, ExpressionError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            JexlEvaluator.compile(expression)
        }

        fn evaluate(
            &self,
            program: &CompiledExpression,
            context: &Value,
        ) -> Result<Value, ExpressionError> {
            JexlEvaluator.evaluate(program, context)
        }
    }

    #[test]
    fn test_compile_results_are_cached_including_failures() {
        let inner = Arc::new(CountingEvaluator {
            compiles: AtomicUsize::new(0),
        });
        let eval = CachedEvaluator::new(inner.clone(), Duration::from_secs(60));

        eval.evaluate_bool("true", &json!({})).unwrap();
        eval.evaluate_bool("true", &json!({})).unwrap();
        assert!(eval.compile("").is_err());
        assert!(eval.compile("").is_err());
        assert!(eval.compile("input.a ==").is_err());
        assert!(eval.compile("input.a ==").is_err());

        assert_eq!(inner.compiles.load(Ordering::SeqCst), 3);
    }
}
