//! Position along a route path, advanced by a distance budget per tick.

use geo_core::{
    Coordinate,
    geodesy::{haversine_m, lerp},
};

#[derive(Clone, Debug)]
pub struct RouteCursor {
    path: Vec<Coordinate>,
    index: usize,
    reversing: bool,
}

impl RouteCursor {
    /// A cursor at the start of `path`; `None` when the path has fewer than
    /// two points.
    pub fn new(path: Vec<Coordinate>) -> Option<Self> {
        if path.len() < 2 {
            return None;
        }
        Some(Self {
            path,
            index: 0,
            reversing: false,
        })
    }

    pub fn position(&self) -> Coordinate {
        self.path[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.path.len()
    }

    fn last(&self) -> usize {
        self.path.len() - 1
    }

    pub fn at_end(&self) -> bool {
        self.index == self.last()
    }

    pub fn is_reversing(&self) -> bool {
        self.reversing
    }

    /// Whole percent of the path's points already passed.
    pub fn progress(&self) -> u8 {
        (self.index * 100 / self.last()) as u8
    }

    /// Move `budget_m` metres along the path and return the new position.
    ///
    /// Whole segments are consumed while the budget lasts; a segment that is
    /// only partly covered replaces the current point with the interpolated
    /// one. With `looping`, a tick that starts at either end turns around.
    pub fn advance(&mut self, budget_m: f64, looping: bool) -> Coordinate {
        if looping {
            if !self.reversing && self.index == self.last() {
                self.reversing = true;
            } else if self.reversing && self.index == 0 {
                self.reversing = false;
            }
        }

        let mut budget = budget_m;
        while budget > 0.0 {
            let Some(next) = self.next_index() else {
                break;
            };
            let from = self.path[self.index];
            let to = self.path[next];
            let segment = haversine_m(from, to);
            if segment <= budget {
                budget -= segment;
                self.index = next;
            } else {
                self.path[self.index] = lerp(from, to, budget / segment);
                budget = 0.0;
            }
        }
        self.position()
    }

    fn next_index(&self) -> Option<usize> {
        if self.reversing {
            self.index.checked_sub(1)
        } else if self.index < self.last() {
            Some(self.index + 1)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `n` points due north of the equator, `step` degrees apart.
    fn meridian(n: usize, step: f64) -> Vec<Coordinate> {
        (0..n)
            .map(|i| Coordinate::new(i as f64 * step, 0.0))
            .collect()
    }

    #[test]
    fn short_paths_are_refused() {
        assert!(RouteCursor::new(vec![]).is_none());
        assert!(RouteCursor::new(meridian(1, 0.001)).is_none());
        assert!(RouteCursor::new(meridian(2, 0.001)).is_some());
    }

    #[test]
    fn partial_segment_is_interpolated_in_place() {
        let path = meridian(5, 0.001);
        let start = path[0];
        let mut cursor = RouteCursor::new(path).unwrap();
        let position = cursor.advance(10.0, false);
        assert_eq!(cursor.index(), 0);
        assert!((haversine_m(start, position) - 10.0).abs() < 1e-6);
        assert_eq!(cursor.position(), position);

        // The next tick continues from the interpolated point.
        let position = cursor.advance(10.0, false);
        assert!((haversine_m(start, position) - 20.0).abs() < 1e-6);
    }

    #[test]
    fn budget_spans_several_segments() {
        let path = meridian(5, 0.001);
        let segment = haversine_m(path[0], path[1]);
        let mut cursor = RouteCursor::new(path.clone()).unwrap();
        let position = cursor.advance(segment * 2.5, false);
        assert_eq!(cursor.index(), 2);
        assert!((haversine_m(path[2], position) - segment * 0.5).abs() < 1e-6);
        assert_eq!(cursor.progress(), 50);

        cursor.advance(segment * 10.0, false);
        assert!(cursor.at_end());
        assert_eq!(cursor.progress(), 100);
        assert_eq!(cursor.position(), path[4]);
    }

    #[test]
    fn progress_is_floored() {
        let mut cursor = RouteCursor::new(meridian(4, 0.001)).unwrap();
        let segment = haversine_m(Coordinate::new(0.0, 0.0), Coordinate::new(0.001, 0.0));
        cursor.advance(segment * 1.01, false);
        assert_eq!(cursor.index(), 1);
        assert_eq!(cursor.progress(), 33);
    }

    #[test]
    fn zero_budget_stays_put() {
        let mut cursor = RouteCursor::new(meridian(3, 0.001)).unwrap();
        assert_eq!(cursor.advance(0.0, false), Coordinate::new(0.0, 0.0));
        assert_eq!(cursor.index(), 0);
    }

    #[test]
    fn loop_turns_around_at_both_ends() {
        // Three points roughly 11.1 m apart, 25 m per tick.
        let mut cursor = RouteCursor::new(meridian(3, 0.0001)).unwrap();
        let budget = 90.0 * 1000.0 / 3600.0;

        cursor.advance(budget, true);
        assert_eq!(cursor.index(), 2);
        assert!(!cursor.is_reversing());

        cursor.advance(budget, true);
        assert!(cursor.is_reversing());
        assert!(cursor.index() < 2);
        assert_eq!(cursor.index(), 0);

        cursor.advance(budget, true);
        assert!(!cursor.is_reversing());
        assert_eq!(cursor.index(), 2);
    }
}
