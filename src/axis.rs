use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Ids with this bit set are synthetic axes minted while merging layouts.
const SYNTHETIC_BIT: u32 = 1 << 31;

/// A named logical dimension, equal only to itself.
///
/// Two [Variable](crate::graph::Variable)s sharing an `Axis` value declare
/// that dimension semantically identical. Frontend axes are minted through
/// [AxisGen]; synthetic axes come from merging adjacent dimensions and live
/// in a disjoint id space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Deserialize, Serialize)]
pub struct Axis(u32);

impl Axis {
    /// Sentinel axis assigned to variables whose every dimension has been
    /// simplified away. Keeps the "at least one axis" invariant for loop
    /// generation.
    pub const SCALAR: Axis = Axis(u32::MAX);

    pub(crate) fn synthetic(n: u32) -> Axis {
        debug_assert!(n < SYNTHETIC_BIT - 1);
        Axis(SYNTHETIC_BIT | n)
    }

    pub fn is_synthetic(self) -> bool {
        self != Axis::SCALAR && self.0 & SYNTHETIC_BIT != 0
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Axis::SCALAR {
            write!(f, "Scalar")
        } else if self.is_synthetic() {
            write!(f, "X{}", self.0 & !SYNTHETIC_BIT)
        } else {
            write!(f, "a{}", self.0)
        }
    }
}

/// Mints frontend [Axis] values. Threaded explicitly through graph
/// construction so repeated runs assign identical ids.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct AxisGen {
    next: u32,
}

impl AxisGen {
    pub fn new() -> Self {
        AxisGen::default()
    }

    pub fn fresh(&mut self) -> Axis {
        let axis = Axis(self.next);
        self.next += 1;
        axis
    }
}

/// An ordered sequence of distinct axes; defines how a variable's flat shape
/// maps to named dimensions.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Deserialize, Serialize)]
pub struct Order(SmallVec<[Axis; 4]>);

impl Order {
    /// Panics if any axis repeats.
    pub fn new(axes: impl IntoIterator<Item = Axis>) -> Order {
        let axes: SmallVec<[Axis; 4]> = axes.into_iter().collect();
        assert!(axes.iter().all_unique(), "duplicate axis in order");
        Order(axes)
    }

    pub fn axes(&self) -> &[Axis] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, axis: Axis) -> bool {
        self.0.contains(&axis)
    }

    pub fn position(&self, axis: Axis) -> Option<usize> {
        self.0.iter().position(|&a| a == axis)
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.iter().map(|a| a.to_string()).join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axisgen_mints_distinct_axes() {
        let mut gen = AxisGen::new();
        let a = gen.fresh();
        let b = gen.fresh();
        assert_ne!(a, b);
        assert!(!a.is_synthetic());
    }

    #[test]
    fn test_synthetic_ids_are_disjoint_from_frontend_ids() {
        let mut gen = AxisGen::new();
        let a = gen.fresh();
        let s = Axis::synthetic(0);
        assert_ne!(a, s);
        assert!(s.is_synthetic());
        assert_eq!(s.to_string(), "X0");
    }

    #[test]
    #[should_panic(expected = "duplicate axis")]
    fn test_order_rejects_duplicates() {
        let mut gen = AxisGen::new();
        let a = gen.fresh();
        let _ = Order::new([a, a]);
    }

    #[test]
    fn test_order_position() {
        let mut gen = AxisGen::new();
        let a = gen.fresh();
        let b = gen.fresh();
        let order = Order::new([a, b]);
        assert_eq!(order.position(a), Some(0));
        assert_eq!(order.position(b), Some(1));
        assert_eq!(order.position(Axis::SCALAR), None);
    }
}
