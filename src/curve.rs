//! Piecewise-linear control curves.
//!
//! A curve maps a sensor reading to an actuator output by linear
//! interpolation between validated data points. Curves are plain serde data
//! so they can be persisted alongside the cooling mode that carries them.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Numeric types usable as curve inputs and outputs.
///
/// Conversions go through `f64`; converting back saturates with an `as` cast,
/// which is what actuator outputs want (a curve evaluating slightly above
/// `u8::MAX` pins to 255 rather than wrapping).
pub trait CurveValue: Copy + PartialOrd {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_curve_value {
    ($($ty:ty),*) => {
        $(
            impl CurveValue for $ty {
                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_curve_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// One data point of a control curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint<I, O> {
    pub x: I,
    pub y: O,
}

impl<I, O> CurvePoint<I, O> {
    pub fn new(x: I, y: O) -> Self {
        Self { x, y }
    }
}

/// Ordering constraint a curve's points must satisfy.
///
/// Inputs must always be strictly increasing; the monotonicity here
/// constrains the outputs. Cooling curves are typically
/// `IncreasingUpTo100` so that hotter never means slower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Monotonicity {
    /// No output constraint.
    Any,
    Increasing,
    StrictlyIncreasing,
    Decreasing,
    StrictlyDecreasing,
    /// Non-decreasing outputs, all within `0..=100`.
    IncreasingUpTo100,
    /// Strictly increasing outputs, all within `0..=100`.
    StrictlyIncreasingUpTo100,
}

/// A validated piecewise-linear curve from `I` readings to `O` outputs.
///
/// Inputs below the first point evaluate to the initial value; inputs above
/// the last point clamp to the last point's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCurve<I, O> {
    points: Vec<CurvePoint<I, O>>,
    initial: O,
}

/// Curve from a normalized `f64` sensor reading to a 0-100 power value.
pub type PowerCurve = ControlCurve<f64, u8>;

impl<I: CurveValue, O: CurveValue> ControlCurve<I, O> {
    /// Validates `points` against `monotonicity` and builds a curve whose
    /// initial value is the first point's output.
    pub fn new(points: Vec<CurvePoint<I, O>>, monotonicity: Monotonicity) -> Result<Self> {
        let Some(first) = points.first() else {
            bail!("a control curve requires at least one point");
        };
        let initial = first.y;
        Self::with_initial_value(points, initial, monotonicity)
    }

    /// Like [`ControlCurve::new`] but with an explicit output for inputs
    /// below the first point.
    pub fn with_initial_value(
        points: Vec<CurvePoint<I, O>>,
        initial: O,
        monotonicity: Monotonicity,
    ) -> Result<Self> {
        if points.is_empty() {
            bail!("a control curve requires at least one point");
        }
        for pair in points.windows(2) {
            if pair[1].x.to_f64() <= pair[0].x.to_f64() {
                bail!("curve inputs must be strictly increasing");
            }
            let previous = pair[0].y.to_f64();
            let current = pair[1].y.to_f64();
            let ok = match monotonicity {
                Monotonicity::Any => true,
                Monotonicity::Increasing | Monotonicity::IncreasingUpTo100 => current >= previous,
                Monotonicity::StrictlyIncreasing | Monotonicity::StrictlyIncreasingUpTo100 => {
                    current > previous
                }
                Monotonicity::Decreasing => current <= previous,
                Monotonicity::StrictlyDecreasing => current < previous,
            };
            if !ok {
                bail!("curve outputs violate {monotonicity:?}");
            }
        }
        if matches!(
            monotonicity,
            Monotonicity::IncreasingUpTo100 | Monotonicity::StrictlyIncreasingUpTo100
        ) {
            for point in &points {
                let y = point.y.to_f64();
                if !(0.0..=100.0).contains(&y) {
                    bail!("curve outputs must lie within 0..=100");
                }
            }
        }
        Ok(Self { points, initial })
    }

    /// Evaluates the curve at `input`.
    pub fn evaluate(&self, input: I) -> O {
        let x = input.to_f64();
        let Some((first, last)) = self.points.first().zip(self.points.last()) else {
            // Unreachable through the constructors; a hand-deserialized empty
            // curve still answers with its initial value.
            return self.initial;
        };
        if x < first.x.to_f64() {
            return self.initial;
        }
        if x >= last.x.to_f64() {
            return last.y;
        }
        // x lies within [first, last); find the enclosing segment.
        for pair in self.points.windows(2) {
            let x0 = pair[0].x.to_f64();
            let x1 = pair[1].x.to_f64();
            if x < x1 {
                let y0 = pair[0].y.to_f64();
                let y1 = pair[1].y.to_f64();
                let t = (x - x0) / (x1 - x0);
                return O::from_f64(y0 + t * (y1 - y0));
            }
        }
        last.y
    }

    pub fn points(&self) -> &[CurvePoint<I, O>] {
        &self.points
    }

    pub fn initial_value(&self) -> O {
        self.initial
    }
}
