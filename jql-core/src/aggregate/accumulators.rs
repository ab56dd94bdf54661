//! Streaming accumulators for the aggregate functions.

use serde_json::{json, Value};

use crate::ast::FieldPath;
use crate::value::{coerce_number, lookup, number_from_f64};

use super::AggregateFunction;

/// One aggregate function computed over a stream of documents.
pub trait Accumulator: Send {
    fn accumulate(&mut self, document: &Value);

    fn compute(&self) -> Value;
}

/// Power sums of one or two variables.
///
/// Univariate functions only use the `x` sums. The same moments back the
/// SQL functions registered by the relational backend, so both backends
/// share every formula.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub n: u64,
    pub sum_x: f64,
    pub sum_xx: f64,
    pub sum_y: f64,
    pub sum_yy: f64,
    pub sum_xy: f64,
}

impl Moments {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        self.sum_x += x;
        self.sum_xx += x * x;
    }

    pub fn push_pair(&mut self, y: f64, x: f64) {
        self.push(x);
        self.sum_y += y;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
    }

    fn count(&self) -> f64 {
        self.n as f64
    }

    /// Sum / n, 0 when empty
    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum_x / self.count()
    }

    fn mean_y(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum_y / self.count()
    }

    /// Population variance of x: Σx²/n − (Σx/n)²
    pub fn variance(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_xx / self.count() - mean * mean).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    fn variance_y(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.mean_y();
        (self.sum_yy / self.count() - mean * mean).max(0.0)
    }

    /// Population covariance of y and x.
    pub fn covariance(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum_xy / self.count() - self.mean() * self.mean_y()
    }

    /// Pearson correlation; 0 when either side has no spread.
    pub fn correlation(&self) -> f64 {
        let sd_x = self.stddev();
        let sd_y = self.variance_y().sqrt();
        if self.n == 0 || sd_x == 0.0 || sd_y == 0.0 {
            return 0.0;
        }
        self.covariance() / (sd_y * sd_x)
    }

    /// Least-squares fit `y = a·x + b`, returned as `(a, b)`.
    pub fn regression(&self) -> (f64, f64) {
        if self.n == 0 {
            return (0.0, 0.0);
        }
        let n = self.count();
        let denominator = n * self.sum_xx - self.sum_x * self.sum_x;
        if denominator == 0.0 {
            return (0.0, self.mean_y());
        }
        let slope = (n * self.sum_xy - self.sum_x * self.sum_y) / denominator;
        let intercept = (self.sum_y - slope * self.sum_x) / n;
        (slope, intercept)
    }
}

/// `count(*)` and `count(path)`.
pub struct CountAccumulator {
    path: Option<FieldPath>,
    n: u64,
}

impl CountAccumulator {
    pub fn new(path: Option<FieldPath>) -> Self {
        Self { path, n: 0 }
    }
}

impl Accumulator for CountAccumulator {
    fn accumulate(&mut self, document: &Value) {
        let counted = match &self.path {
            None => true,
            Some(path) => lookup(document, &path.segments).is_some(),
        };
        if counted {
            self.n += 1;
        }
    }

    fn compute(&self) -> Value {
        json!(self.n)
    }
}

/// Functions of a single numeric path: sum, avg, var, stddev, min, max.
pub struct UnivariateAccumulator {
    function: AggregateFunction,
    path: FieldPath,
    moments: Moments,
    min: Option<f64>,
    max: Option<f64>,
}

impl UnivariateAccumulator {
    pub fn new(function: AggregateFunction, path: FieldPath) -> Self {
        Self {
            function,
            path,
            moments: Moments::default(),
            min: None,
            max: None,
        }
    }
}

impl Accumulator for UnivariateAccumulator {
    fn accumulate(&mut self, document: &Value) {
        let Some(x) = lookup(document, &self.path.segments).and_then(coerce_number) else {
            return;
        };
        self.moments.push(x);
        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = Some(self.max.map_or(x, |m| m.max(x)));
    }

    fn compute(&self) -> Value {
        match self.function {
            AggregateFunction::Sum => number_from_f64(self.moments.sum_x),
            AggregateFunction::Avg => number_from_f64(self.moments.mean()),
            AggregateFunction::Var => number_from_f64(self.moments.variance()),
            AggregateFunction::Stddev => number_from_f64(self.moments.stddev()),
            AggregateFunction::Min => self.min.map(number_from_f64).unwrap_or(Value::Null),
            AggregateFunction::Max => self.max.map(number_from_f64).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

/// Functions of two paths `(y, x)`: cov, corr, regr.
///
/// Documents where either side is not numeric are skipped.
pub struct BivariateAccumulator {
    function: AggregateFunction,
    y: FieldPath,
    x: FieldPath,
    moments: Moments,
}

impl BivariateAccumulator {
    pub fn new(function: AggregateFunction, y: FieldPath, x: FieldPath) -> Self {
        Self {
            function,
            y,
            x,
            moments: Moments::default(),
        }
    }
}

impl Accumulator for BivariateAccumulator {
    fn accumulate(&mut self, document: &Value) {
        let y = lookup(document, &self.y.segments).and_then(coerce_number);
        let x = lookup(document, &self.x.segments).and_then(coerce_number);
        if let (Some(y), Some(x)) = (y, x) {
            self.moments.push_pair(y, x);
        }
    }

    fn compute(&self) -> Value {
        match self.function {
            AggregateFunction::Cov => number_from_f64(self.moments.covariance()),
            AggregateFunction::Corr => number_from_f64(self.moments.correlation()),
            AggregateFunction::Regr => {
                let (a, b) = self.moments.regression();
                json!({ "a": number_from_f64(a), "b": number_from_f64(b) })
            }
            _ => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_empty_moments() {
        let m = Moments::default();
        assert_eq!(m.mean(), 0.0);
        assert_eq!(m.variance(), 0.0);
        assert_eq!(m.covariance(), 0.0);
        assert_eq!(m.correlation(), 0.0);
        assert_eq!(m.regression(), (0.0, 0.0));
    }

    #[test]
    fn test_univariate_moments() {
        let mut m = Moments::default();
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            m.push(x);
        }
        assert!(close(m.mean(), 5.0));
        assert!(close(m.variance(), 4.0));
        assert!(close(m.stddev(), 2.0));
    }

    #[test]
    fn test_perfect_line() {
        let mut m = Moments::default();
        for x in [1.0, 2.0, 3.0, 4.0] {
            m.push_pair(2.0 * x + 1.0, x);
        }
        let (a, b) = m.regression();
        assert!(close(a, 2.0));
        assert!(close(b, 1.0));
        assert!(close(m.correlation(), 1.0));
        assert!(close(m.covariance(), 2.5));
    }

    #[test]
    fn test_flat_x_has_no_slope() {
        let mut m = Moments::default();
        m.push_pair(1.0, 3.0);
        m.push_pair(5.0, 3.0);
        assert_eq!(m.correlation(), 0.0);
        assert_eq!(m.regression(), (0.0, 3.0));
    }

    #[test]
    fn test_count_accumulator() {
        let docs = [json!({"a": 1}), json!({"a": null}), json!({"b": 2})];

        let mut all = CountAccumulator::new(None);
        let mut some = CountAccumulator::new(Some(FieldPath::new(["a"])));
        for doc in &docs {
            all.accumulate(doc);
            some.accumulate(doc);
        }
        assert_eq!(all.compute(), json!(3));
        assert_eq!(some.compute(), json!(2));
    }

    #[test]
    fn test_univariate_coercion() {
        let docs = [
            json!({"v": 1}),
            json!({"v": "2.5"}),
            json!({"v": true}),
            json!({"v": "n/a"}),
            json!({"v": [4]}),
            json!({}),
        ];

        let mut sum = UnivariateAccumulator::new(AggregateFunction::Sum, FieldPath::new(["v"]));
        let mut max = UnivariateAccumulator::new(AggregateFunction::Max, FieldPath::new(["v"]));
        for doc in &docs {
            sum.accumulate(doc);
            max.accumulate(doc);
        }
        assert_eq!(sum.compute(), json!(4.5));
        assert_eq!(max.compute(), json!(2.5));
    }

    #[test]
    fn test_min_max_empty() {
        let min = UnivariateAccumulator::new(AggregateFunction::Min, FieldPath::new(["v"]));
        assert_eq!(min.compute(), Value::Null);
        let sum = UnivariateAccumulator::new(AggregateFunction::Sum, FieldPath::new(["v"]));
        assert_eq!(sum.compute(), json!(0.0));
    }

    #[test]
    fn test_bivariate_skips_partial_pairs() {
        let mut regr = BivariateAccumulator::new(
            AggregateFunction::Regr,
            FieldPath::new(["y"]),
            FieldPath::new(["x"]),
        );
        for doc in [
            json!({"x": 0, "y": 1}),
            json!({"x": 1, "y": 3}),
            json!({"x": 2}),
            json!({"x": 2, "y": 5}),
        ] {
            regr.accumulate(&doc);
        }
        assert_eq!(regr.compute(), json!({"a": 2.0, "b": 1.0}));
    }
}
