//! Position/scale interpolation used when the platform view-transition
//! primitive is unavailable.
//!
//! The fallback animates an element from where it was on the outgoing page to
//! where its counterpart sits on the incoming one (the usual FLIP technique):
//! the element is placed at its final position, offset and scaled back to its
//! first position, then the offset is eased away frame by frame.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A 2D translate + scale, applied relative to the element's final box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Transform {
    pub dx: f64,
    pub dy: f64,
    pub sx: f64,
    pub sy: f64,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        dx: 0.0,
        dy: 0.0,
        sx: 1.0,
        sy: 1.0,
    };

    pub fn to_css(&self) -> String {
        format!(
            "translate({:.2}px, {:.2}px) scale({:.4}, {:.4})",
            self.dx, self.dy, self.sx, self.sy
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    /// Element the transforms are applied to.
    pub target: String,
    pub from: Rect,
    pub to: Rect,
    pub duration: Duration,
}

impl Motion {
    /// The inverted transform at the start of the animation, it places the
    /// element (laid out at `to`) visually over `from`.
    pub fn inverted(&self) -> Transform {
        let sx = ratio(self.from.width, self.to.width);
        let sy = ratio(self.from.height, self.to.height);

        Transform {
            dx: self.from.x - self.to.x,
            dy: self.from.y - self.to.y,
            sx,
            sy,
        }
    }

    /// Transform at linear progress `t` in `[0, 1]`, eased out.
    pub fn sample(&self, t: f64) -> Transform {
        let p = ease_out_cubic(t.clamp(0.0, 1.0));
        let start = self.inverted();

        Transform {
            dx: lerp(start.dx, 0.0, p),
            dy: lerp(start.dy, 0.0, p),
            sx: lerp(start.sx, 1.0, p),
            sy: lerp(start.sy, 1.0, p),
        }
    }
}

fn ratio(a: f64, b: f64) -> f64 {
    if b.abs() < f64::EPSILON { 1.0 } else { a / b }
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

pub fn ease_out_cubic(t: f64) -> f64 {
    1.0 - (1.0 - t).powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion() -> Motion {
        Motion {
            target: ".post-cover".into(),
            from: Rect::new(10.0, 200.0, 100.0, 50.0),
            to: Rect::new(0.0, 0.0, 400.0, 200.0),
            duration: Duration::from_millis(300),
        }
    }

    #[test]
    fn test_sample_endpoints() {
        let motion = motion();

        let start = motion.sample(0.0);
        assert_eq!(start.dx, 10.0);
        assert_eq!(start.dy, 200.0);
        assert_eq!(start.sx, 0.25);
        assert_eq!(start.sy, 0.25);

        assert_eq!(motion.sample(1.0), Transform::IDENTITY);
        // out of range input is clamped
        assert_eq!(motion.sample(7.0), Transform::IDENTITY);
    }

    #[test]
    fn test_sample_is_monotonic() {
        let motion = motion();
        let mut last = motion.sample(0.0).dy;
        for step in 1..=10 {
            let dy = motion.sample(step as f64 / 10.0).dy;
            assert!(dy <= last);
            last = dy;
        }
    }

    #[test]
    fn test_zero_sized_target() {
        let mut motion = motion();
        motion.to = Rect::default();
        assert_eq!(motion.inverted().sx, 1.0);
    }

    #[test]
    fn test_to_css() {
        assert_eq!(
            Transform::IDENTITY.to_css(),
            "translate(0.00px, 0.00px) scale(1.0000, 1.0000)"
        );
    }
}
