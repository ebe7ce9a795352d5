//! Rhai engine for bound expressions
//!
//! ## Scope
//!
//! - `src` - data of the bound source (unit when the expression is unbound)
//! - `alt` - the expression's literal fallback
//!
//! Sources map to script values as follows: numbers to floats, text to
//! strings, tables to (nested) float arrays, documents to maps and arrays,
//! images to a map with `width`, `height`, `channels` and a `pixels` blob.

use crate::config::ScriptConfig;
use crate::error::{DashError, Result, ResultExt};
use crate::scripting::expression::{FALLBACK_VAR, SOURCE_VAR};
use crate::scripting::{create_shared_cache, CompiledExpression, SharedExpressionCache};
use rhai::{Array, Dynamic, Engine, Scope};

/// Collect every number in a (possibly nested) array
fn numbers(values: &Array) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    fn walk(value: &Dynamic, out: &mut Vec<f64>) {
        if let Ok(x) = value.as_float() {
            out.push(x);
        } else if let Ok(i) = value.as_int() {
            out.push(i as f64);
        } else if let Some(inner) = value.read_lock::<Array>() {
            for v in inner.iter() {
                walk(v, out);
            }
        }
    }
    for v in values {
        walk(v, &mut out);
    }
    out
}

/// Apply `f` to every number in `value`, keeping the array shape.
/// Non-numeric elements are left untouched.
fn map_numeric(value: &Dynamic, f: &dyn Fn(f64) -> f64) -> Dynamic {
    if let Ok(x) = value.as_float() {
        return Dynamic::from_float(f(x));
    }
    if let Ok(i) = value.as_int() {
        return Dynamic::from_float(f(i as f64));
    }
    if let Some(inner) = value.read_lock::<Array>() {
        return Dynamic::from_array(inner.iter().map(|v| map_numeric(v, f)).collect());
    }
    value.clone()
}

fn map_array(values: Array, f: &dyn Fn(f64) -> f64) -> Array {
    values.iter().map(|v| map_numeric(v, f)).collect()
}

/// Register `op` between numbers and arrays in both operand orders
macro_rules! register_elementwise {
    ($engine:expr, $op:literal, |$a:ident, $b:ident| $body:expr) => {
        $engine.register_fn($op, |x: f64, values: Array| -> Array {
            map_array(values, &|$b| {
                let $a = x;
                $body
            })
        });
        $engine.register_fn($op, |values: Array, y: f64| -> Array {
            map_array(values, &|$a| {
                let $b = y;
                $body
            })
        });
        $engine.register_fn($op, |x: rhai::INT, values: Array| -> Array {
            let x = x as f64;
            map_array(values, &|$b| {
                let $a = x;
                $body
            })
        });
        $engine.register_fn($op, |values: Array, y: rhai::INT| -> Array {
            let y = y as f64;
            map_array(values, &|$a| {
                let $b = y;
                $body
            })
        });
    };
}

/// Expression engine: a restricted Rhai engine plus a compile cache
pub struct ExpressionEngine {
    engine: Engine,
    cache: SharedExpressionCache,
}

impl ExpressionEngine {
    /// Create an engine with the given limits
    pub fn new(config: &ScriptConfig) -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, config);

        Self {
            engine,
            cache: create_shared_cache(config.cache_capacity),
        }
    }

    /// Create an engine sharing an existing compile cache
    pub fn with_cache(config: &ScriptConfig, cache: SharedExpressionCache) -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, config);
        Self { engine, cache }
    }

    /// Configure the Rhai engine with built-in functions and safety limits
    fn configure_engine(engine: &mut Engine, config: &ScriptConfig) {
        // Set safety limits
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
        engine.set_max_call_levels(32);
        engine.set_max_operations(config.max_operations);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(config.max_array_size);
        engine.set_max_map_size(10_000);

        engine.disable_symbol("eval");

        engine.on_print(|text| tracing::info!(target: "imdash_core::expression", "{}", text));
        engine.on_debug(|text, _source, pos| {
            tracing::debug!(target: "imdash_core::expression", "{} @ {}", text, pos)
        });

        // ===== Mathematical Functions =====

        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("sqrt", |x: f64| x.sqrt());
        engine.register_fn("pow", |x: f64, y: f64| x.powf(y));
        engine.register_fn("exp", |x: f64| x.exp());
        engine.register_fn("ln", |x: f64| x.ln());
        engine.register_fn("log", |x: f64| x.ln()); // Alias for natural log
        engine.register_fn("log10", |x: f64| x.log10());
        engine.register_fn("log2", |x: f64| x.log2());
        engine.register_fn("sin", |x: f64| x.sin());
        engine.register_fn("cos", |x: f64| x.cos());
        engine.register_fn("tan", |x: f64| x.tan());
        engine.register_fn("asin", |x: f64| x.asin());
        engine.register_fn("acos", |x: f64| x.acos());
        engine.register_fn("atan", |x: f64| x.atan());
        engine.register_fn("atan2", |y: f64, x: f64| y.atan2(x));
        engine.register_fn("hypot", |x: f64, y: f64| x.hypot(y));
        engine.register_fn("degrees", |x: f64| x.to_degrees());
        engine.register_fn("radians", |x: f64| x.to_radians());

        // Rounding functions
        engine.register_fn("floor", |x: f64| x.floor());
        engine.register_fn("ceil", |x: f64| x.ceil());
        engine.register_fn("round", |x: f64| x.round());
        engine.register_fn("trunc", |x: f64| x.trunc());
        engine.register_fn("fract", |x: f64| x.fract());

        // Clamping and limiting
        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.clamp(min, max));
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));

        // Type conversions
        engine.register_fn("to_int", |x: f64| x as rhai::INT);
        engine.register_fn("to_float", |x: rhai::INT| x as f64);

        // Constants
        engine.register_fn("pi", || std::f64::consts::PI);
        engine.register_fn("e", || std::f64::consts::E);

        // Utility functions
        engine.register_fn("is_nan", |x: f64| x.is_nan());
        engine.register_fn("is_finite", |x: f64| x.is_finite());
        engine.register_fn("sign", |x: f64| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        });
        engine.register_fn("lerp", |a: f64, b: f64, t: f64| a + (b - a) * t);
        engine.register_fn(
            "map_range",
            |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| {
                (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
            },
        );

        // ===== Array Functions =====

        engine.register_fn("sum", |values: Array| numbers(&values).iter().sum::<f64>());
        engine.register_fn("mean", |values: Array| -> f64 {
            let n = numbers(&values);
            if n.is_empty() {
                f64::NAN
            } else {
                n.iter().sum::<f64>() / n.len() as f64
            }
        });
        engine.register_fn("std", |values: Array| -> f64 {
            let n = numbers(&values);
            if n.is_empty() {
                return f64::NAN;
            }
            let mean = n.iter().sum::<f64>() / n.len() as f64;
            (n.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n.len() as f64).sqrt()
        });
        engine.register_fn("min", |values: Array| {
            numbers(&values).into_iter().fold(f64::NAN, f64::min)
        });
        engine.register_fn("max", |values: Array| {
            numbers(&values).into_iter().fold(f64::NAN, f64::max)
        });
        engine.register_fn("norm", |values: Array| {
            numbers(&values).iter().map(|x| x * x).sum::<f64>().sqrt()
        });
        engine.register_fn("flatten", |values: Array| -> Array {
            numbers(&values).into_iter().map(Dynamic::from_float).collect()
        });
        engine.register_fn("abs", |values: Array| map_array(values, &f64::abs));
        engine.register_fn("linspace", |start: f64, end: f64, n: rhai::INT| -> Array {
            match n {
                n if n <= 0 => Array::new(),
                1 => vec![Dynamic::from_float(start)],
                n => {
                    let step = (end - start) / (n - 1) as f64;
                    (0..n)
                        .map(|i| Dynamic::from_float(start + step * i as f64))
                        .collect()
                }
            }
        });

        // Elementwise arithmetic between numbers and arrays
        register_elementwise!(engine, "*", |a, b| a * b);
        register_elementwise!(engine, "/", |a, b| a / b);
        register_elementwise!(engine, "+", |a, b| a + b);
        register_elementwise!(engine, "-", |a, b| a - b);
    }

    /// Compile host text, using the cache
    pub fn compile(&self, host: &str) -> Result<CompiledExpression> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| DashError::Script(format!("Failed to acquire cache lock: {}", e)))?;

        cache.get_or_compile(&self.engine, host)
    }

    /// Run a compiled expression with `src` and `alt` bound
    pub fn execute(
        &self,
        compiled: &CompiledExpression,
        src: Dynamic,
        alt: Dynamic,
    ) -> Result<Dynamic> {
        let mut scope = Scope::new();
        scope.push_dynamic(SOURCE_VAR, src);
        scope.push_dynamic(FALLBACK_VAR, alt);

        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, compiled.ast())
            .with_context(|| format!("Execution error in '{}'", compiled.host()))
    }

    /// Compile and execute host text in one step
    pub fn eval(&self, host: &str, src: Dynamic) -> Result<Dynamic> {
        let compiled = self.compile(host)?;
        self.execute(&compiled, src, Dynamic::UNIT)
    }

    /// Evaluate host text to a number
    pub fn eval_f64(&self, host: &str, src: Dynamic) -> Result<f64> {
        let value = self.eval(host, src)?;
        if let Ok(f) = value.as_float() {
            Ok(f)
        } else if let Ok(i) = value.as_int() {
            Ok(i as f64)
        } else {
            Err(DashError::Script(format!(
                "'{}' returned {} instead of a number",
                host,
                value.type_name()
            )))
        }
    }

    /// Check host text without executing it
    pub fn validate(&self, host: &str) -> Result<()> {
        self.engine
            .compile_expression(host)
            .map(|_| ())
            .map_err(|e| DashError::Script(format!("Validation error: {}", e)))
    }

    /// Clear the compile cache
    pub fn clear_cache(&self) -> Result<()> {
        let mut cache = self
            .cache
            .write()
            .map_err(|e| DashError::Script(format!("Failed to acquire cache lock: {}", e)))?;
        cache.clear();
        Ok(())
    }

    /// Get a reference to the underlying Rhai engine
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get a reference to the shared cache
    pub fn cache(&self) -> &SharedExpressionCache {
        &self.cache
    }
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new(&ScriptConfig::default())
    }
}

impl std::fmt::Debug for ExpressionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionEngine")
            .field("cache_size", &self.cache.read().map(|c| c.len()).ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: &[f64]) -> Dynamic {
        Dynamic::from_array(values.iter().map(|v| Dynamic::from_float(*v)).collect())
    }

    fn as_floats(value: Dynamic) -> Vec<f64> {
        value
            .into_array()
            .unwrap()
            .into_iter()
            .map(|v| v.as_float().unwrap())
            .collect()
    }

    #[test]
    fn test_engine_creation() {
        let engine = ExpressionEngine::default();
        assert!(engine.cache.read().unwrap().is_empty());
    }

    #[test]
    fn test_scalar_expression() {
        let engine = ExpressionEngine::default();
        assert_eq!(engine.eval_f64("src * 2.0", Dynamic::from_float(5.0)).unwrap(), 10.0);
        assert_eq!(engine.eval_f64("src + 1", Dynamic::from_int(2)).unwrap(), 3.0);
    }

    #[test]
    fn test_math_functions() {
        let engine = ExpressionEngine::default();
        assert_eq!(engine.eval_f64("sqrt(16.0)", Dynamic::UNIT).unwrap(), 4.0);
        assert_eq!(engine.eval_f64("pow(2.0, 3.0)", Dynamic::UNIT).unwrap(), 8.0);
        assert_eq!(
            engine.eval_f64("clamp(src, 0.0, 100.0)", Dynamic::from_float(150.0)).unwrap(),
            100.0
        );
        assert!(engine.eval_f64("sin(0.0)", Dynamic::UNIT).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_array_functions() {
        let engine = ExpressionEngine::default();
        let data = floats(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(engine.eval_f64("sum(src)", data.clone()).unwrap(), 10.0);
        assert_eq!(engine.eval_f64("mean(src)", data.clone()).unwrap(), 2.5);
        assert_eq!(engine.eval_f64("min(src)", data.clone()).unwrap(), 1.0);
        assert_eq!(engine.eval_f64("max(src)", data.clone()).unwrap(), 4.0);
        assert_eq!(engine.eval_f64("src.len()", data).unwrap(), 4.0);
        assert!(engine.eval_f64("mean(src)", floats(&[])).unwrap().is_nan());

        let lin = engine.eval("linspace(0.0, 1.0, 3)", Dynamic::UNIT).unwrap();
        assert_eq!(as_floats(lin), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_elementwise_operators() {
        let engine = ExpressionEngine::default();
        let data = floats(&[1.0, 2.0, 3.0]);
        assert_eq!(as_floats(engine.eval("5 * src", data.clone()).unwrap()), vec![5.0, 10.0, 15.0]);
        assert_eq!(as_floats(engine.eval("src * 0.5", data.clone()).unwrap()), vec![0.5, 1.0, 1.5]);
        assert_eq!(as_floats(engine.eval("src - 1", data.clone()).unwrap()), vec![0.0, 1.0, 2.0]);
        assert_eq!(as_floats(engine.eval("6.0 / src", data).unwrap()), vec![6.0, 3.0, 2.0]);

        // Nested arrays keep their shape
        let nested = Dynamic::from_array(vec![floats(&[1.0, 2.0]), floats(&[3.0, 4.0])]);
        let scaled = engine.eval("2 * src", nested).unwrap().into_array().unwrap();
        assert_eq!(as_floats(scaled[1].clone()), vec![6.0, 8.0]);
    }

    #[test]
    fn test_alt_in_scope() {
        let engine = ExpressionEngine::default();
        let compiled = engine.compile("src + alt").unwrap();
        let out = engine
            .execute(&compiled, Dynamic::from_float(1.0), Dynamic::from_float(2.0))
            .unwrap();
        assert_eq!(out.as_float().unwrap(), 3.0);
    }

    #[test]
    fn test_restricted_environment() {
        let engine = ExpressionEngine::default();
        assert!(engine.validate("eval(\"1\")").is_err());
        assert!(engine.validate("src * ").is_err());
        assert!(engine.validate("src * 2").is_ok());
    }

    #[test]
    fn test_operation_limit() {
        let config = ScriptConfig {
            max_operations: 10,
            ..Default::default()
        };
        let engine = ExpressionEngine::new(&config);
        let long = vec!["src"; 40].join(" + ");
        assert!(engine.eval(&long, Dynamic::from_float(1.0)).is_err());
        assert!(engine.eval("src + src", Dynamic::from_float(1.0)).is_ok());
    }

    #[test]
    fn test_caching() {
        let engine = ExpressionEngine::default();
        engine.compile("src * 2.0").unwrap();
        engine.compile("src * 2.0").unwrap();
        assert_eq!(engine.cache.read().unwrap().len(), 1);
        engine.clear_cache().unwrap();
        assert!(engine.cache.read().unwrap().is_empty());
    }
}
