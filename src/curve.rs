//! Controller Curve Module
//!
//! 129-point lookup tables mapping a normalized controller position to a
//! response value. A curve is evaluated by linear interpolation between
//! table points. The engine ships the conventional default curve set;
//! `<curve>` blocks append user curves after it.

use crate::config::CURVE_POINTS;
use crate::opcode::Opcode;
use crate::range::Range;

/// One lookup curve.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    points: [f32; CURVE_POINTS],
}

impl Curve {
    /// Identity curve from 0 to 1.
    pub fn linear() -> Self {
        Self::from_fn(|x| x)
    }

    /// Bipolar curve from -1 to +1.
    pub fn bipolar() -> Self {
        Self::from_fn(|x| 2.0 * x - 1.0)
    }

    /// Inverted curve from 1 to 0.
    pub fn inverted() -> Self {
        Self::from_fn(|x| 1.0 - x)
    }

    /// Inverted bipolar curve from +1 to -1.
    pub fn inverted_bipolar() -> Self {
        Self::from_fn(|x| 1.0 - 2.0 * x)
    }

    /// Squared response, the conventional soft velocity feel.
    pub fn squared() -> Self {
        Self::from_fn(|x| x * x)
    }

    /// Square-root response.
    pub fn square_root() -> Self {
        Self::from_fn(|x| x.sqrt())
    }

    fn from_fn(f: impl Fn(f32) -> f32) -> Self {
        let mut points = [0.0; CURVE_POINTS];
        for (index, point) in points.iter_mut().enumerate() {
            *point = f(index as f32 / (CURVE_POINTS - 1) as f32);
        }
        Self { points }
    }

    /// Builds a curve from sparse `(position, value)` anchors.
    ///
    /// Positions are table indices in `[0, 128]`. Gaps are filled by
    /// linear interpolation; the range before the first anchor holds its
    /// value, likewise after the last.
    pub fn from_anchors(anchors: &[(u8, f32)]) -> Self {
        let mut sorted: Vec<(usize, f32)> = anchors
            .iter()
            .filter(|(position, _)| (*position as usize) < CURVE_POINTS)
            .map(|&(position, value)| (position as usize, value))
            .collect();
        sorted.sort_by_key(|&(position, _)| position);
        sorted.dedup_by_key(|&mut (position, _)| position);

        let mut points = [0.0; CURVE_POINTS];
        if sorted.is_empty() {
            return Self::linear();
        }

        let (first_position, first_value) = sorted[0];
        for point in points.iter_mut().take(first_position + 1) {
            *point = first_value;
        }

        for window in sorted.windows(2) {
            let (from, from_value) = window[0];
            let (to, to_value) = window[1];
            let span = (to - from) as f32;
            for index in from..=to {
                let t = (index - from) as f32 / span;
                points[index] = from_value + t * (to_value - from_value);
            }
        }

        let (last_position, last_value) = sorted[sorted.len() - 1];
        for point in points.iter_mut().skip(last_position) {
            *point = last_value;
        }

        Self { points }
    }

    /// Builds a curve from the `vNNN=value` opcodes of a `<curve>` block.
    pub fn from_opcodes(opcodes: &[Opcode]) -> Self {
        let mut anchors = Vec::new();
        for opcode in opcodes {
            if opcode.name != "v" {
                continue;
            }
            let Some(position) = opcode.parameter else {
                continue;
            };
            if position as usize >= CURVE_POINTS {
                continue;
            }
            if let Some(value) = opcode.read(Range::new(-1.0f32, 1.0)) {
                anchors.push((position as u8, value));
            }
        }
        Self::from_anchors(&anchors)
    }

    /// Evaluates the curve at a normalized position in `[0, 1]`.
    pub fn eval_normalized(&self, position: f32) -> f32 {
        let scaled = position.clamp(0.0, 1.0) * (CURVE_POINTS - 1) as f32;
        let index = scaled as usize;
        if index >= CURVE_POINTS - 1 {
            return self.points[CURVE_POINTS - 1];
        }
        let frac = scaled - index as f32;
        self.points[index] * (1.0 - frac) + self.points[index + 1] * frac
    }

    /// Evaluates the curve at a table index.
    pub fn eval_at(&self, index: usize) -> f32 {
        self.points[index.min(CURVE_POINTS - 1)]
    }
}

/// The engine's curve table: defaults first, user curves appended.
#[derive(Debug, Clone)]
pub struct CurveSet {
    curves: Vec<Curve>,
}

impl CurveSet {
    /// The conventional default curves, at indices 0 through 5.
    pub fn with_defaults() -> Self {
        Self {
            curves: vec![
                Curve::linear(),
                Curve::bipolar(),
                Curve::inverted(),
                Curve::inverted_bipolar(),
                Curve::squared(),
                Curve::square_root(),
            ],
        }
    }

    /// Appends a curve and returns its index.
    pub fn add(&mut self, curve: Curve) -> usize {
        self.curves.push(curve);
        self.curves.len() - 1
    }

    /// Looks up a curve, falling back to the linear default.
    pub fn get(&self, index: usize) -> &Curve {
        self.curves.get(index).unwrap_or(&self.curves[0])
    }

    /// Number of curves, defaults included.
    pub fn len(&self) -> usize {
        self.curves.len()
    }

    /// A curve set is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for CurveSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}
