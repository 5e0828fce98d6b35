//! Minimum enclosing circle of a point set.
//!
//! Incremental (Welzl-style) construction. Points are visited in a fixed
//! stride permutation instead of a random shuffle so the result is
//! reproducible while still avoiding the worst case for points that arrive in
//! contour order.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnclosingCircle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

const EPS: f64 = 1e-7;

impl EnclosingCircle {
    fn contains(&self, p: (f64, f64)) -> bool {
        let dx = p.0 - self.x;
        let dy = p.1 - self.y;
        (dx * dx + dy * dy).sqrt() <= self.radius + EPS * self.radius.max(1.0)
    }

    fn from_two(a: (f64, f64), b: (f64, f64)) -> Self {
        let x = (a.0 + b.0) / 2.0;
        let y = (a.1 + b.1) / 2.0;
        let radius = ((a.0 - x).powi(2) + (a.1 - y).powi(2)).sqrt();
        Self { x, y, radius }
    }

    fn from_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Self {
        let bx = b.0 - a.0;
        let by = b.1 - a.1;
        let cx = c.0 - a.0;
        let cy = c.1 - a.1;
        let d = 2.0 * (bx * cy - by * cx);
        if d.abs() < EPS {
            // Collinear: the circle through the two farthest points covers all three.
            let candidates = [Self::from_two(a, b), Self::from_two(a, c), Self::from_two(b, c)];
            return candidates
                .into_iter()
                .fold(candidates[0], |best, c| if c.radius > best.radius { c } else { best });
        }
        let b2 = bx * bx + by * by;
        let c2 = cx * cx + cy * cy;
        let ux = (cy * b2 - by * c2) / d;
        let uy = (bx * c2 - cx * b2) / d;
        Self {
            x: ux + a.0,
            y: uy + a.1,
            radius: (ux * ux + uy * uy).sqrt(),
        }
    }
}

/// Smallest circle containing every point, or `None` for an empty slice.
pub fn min_enclosing_circle(points: &[(f64, f64)]) -> Option<EnclosingCircle> {
    let ordered = stride_order(points);
    let first = *ordered.first()?;

    let mut circle = EnclosingCircle { x: first.0, y: first.1, radius: 0.0 };
    for i in 1..ordered.len() {
        let p = ordered[i];
        if circle.contains(p) {
            continue;
        }
        circle = EnclosingCircle { x: p.0, y: p.1, radius: 0.0 };
        for j in 0..i {
            let q = ordered[j];
            if circle.contains(q) {
                continue;
            }
            circle = EnclosingCircle::from_two(p, q);
            for k in 0..j {
                let r = ordered[k];
                if !circle.contains(r) {
                    circle = EnclosingCircle::from_three(p, q, r);
                }
            }
        }
    }
    Some(circle)
}

fn stride_order(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }
    // A step near n/golden-ratio that is coprime to n visits every index once.
    let mut step = ((n as f64) * 0.618_033_988_7) as usize;
    step = step.max(1);
    while gcd(step, n) != 1 {
        step += 1;
    }
    (0..n).map(|i| points[(i * step) % n]).collect()
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
