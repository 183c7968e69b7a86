//! Douglas-Peucker simplification of closed pixel chains.

type Point = (i64, i64);

/// Simplifies a closed chain. The chain is split at point 0 and at the point
/// farthest from it, and each half is reduced independently.
pub fn simplify_closed(points: &[Point], epsilon: f64) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let origin = points[0];
    let far = points
        .iter()
        .enumerate()
        .skip(1)
        .fold((0usize, -1.0f64), |best, (i, &p)| {
            let d = distance(origin, p);
            if d > best.1 {
                (i, d)
            } else {
                best
            }
        })
        .0;
    if far == 0 {
        return vec![origin];
    }

    // Second half wraps back to the origin.
    let first: Vec<Point> = points[..=far].to_vec();
    let mut second: Vec<Point> = points[far..].to_vec();
    second.push(origin);

    let mut out = simplify_open(&first, epsilon);
    let tail = simplify_open(&second, epsilon);
    out.pop();
    out.extend(tail);
    // Last element is the origin again.
    out.pop();
    out
}

/// Classic open-chain Douglas-Peucker; endpoints are always kept.
pub fn simplify_open(points: &[Point], epsilon: f64) -> Vec<Point> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    let mut stack = vec![(0usize, points.len() - 1)];
    while let Some((lo, hi)) = stack.pop() {
        if hi <= lo + 1 {
            continue;
        }
        let mut split = lo;
        let mut max_dist = -1.0;
        for i in lo + 1..hi {
            let d = line_distance(points[i], points[lo], points[hi]);
            if d > max_dist {
                max_dist = d;
                split = i;
            }
        }
        if max_dist > epsilon {
            keep[split] = true;
            stack.push((lo, split));
            stack.push((split, hi));
        }
    }
    points
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

fn distance(a: Point, b: Point) -> f64 {
    let (dx, dy) = ((b.0 - a.0) as f64, (b.1 - a.1) as f64);
    (dx * dx + dy * dy).sqrt()
}

/// Perpendicular distance from `p` to the line through `a` and `b`.
fn line_distance(p: Point, a: Point, b: Point) -> f64 {
    let length = distance(a, b);
    if length == 0.0 {
        return distance(a, p);
    }
    let cross = (b.0 - a.0) as f64 * (p.1 - a.1) as f64 - (b.1 - a.1) as f64 * (p.0 - a.0) as f64;
    cross.abs() / length
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_outline(side: i64) -> Vec<Point> {
        let mut pts = Vec::new();
        for x in 0..side {
            pts.push((x, 0));
        }
        for y in 1..side {
            pts.push((side - 1, y));
        }
        for x in (0..side - 1).rev() {
            pts.push((x, side - 1));
        }
        for y in (1..side - 1).rev() {
            pts.push((0, y));
        }
        pts
    }

    #[test]
    fn square_outline_reduces_to_corners() {
        let simplified = simplify_closed(&square_outline(10), 1.0);
        assert_eq!(simplified.len(), 4);
        for corner in [(0, 0), (9, 0), (9, 9), (0, 9)] {
            assert!(simplified.contains(&corner), "missing {corner:?}");
        }
    }

    #[test]
    fn collinear_points_collapse() {
        let line: Vec<Point> = (0..6).map(|x| (x, 0)).collect();
        assert_eq!(simplify_open(&line, 0.5), vec![(0, 0), (5, 0)]);
    }

    #[test]
    fn short_chains_pass_through() {
        assert_eq!(simplify_closed(&[(1, 1), (2, 2)], 1.0), vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn bumps_above_epsilon_survive() {
        let chain = vec![(0, 0), (5, 0), (10, 0), (10, 4), (5, 6), (0, 4)];
        let simplified = simplify_closed(&chain, 1.0);
        assert!(simplified.contains(&(5, 6)));
        assert!(!simplified.contains(&(5, 0)));
    }
}
