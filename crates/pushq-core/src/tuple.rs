//! Immutable, cheaply cloned tuples.

use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::Scalar;

/// A fixed-width array of bound values.
///
/// Cloning shares the backing storage, so tuples can be handed to many
/// concurrent tasks without copying.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Arc<[Scalar]>);

impl Tuple {
    pub fn new(values: Vec<Scalar>) -> Self {
        Tuple(values.into())
    }

    pub fn empty() -> Self {
        Tuple(Arc::from(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Scalar> {
        self.0.get(i)
    }

    pub fn array(&self) -> &[Scalar] {
        &self.0
    }

    /// A new tuple holding these columns followed by `tail`.
    pub fn concat(&self, tail: &[Scalar]) -> Tuple {
        let mut v = Vec::with_capacity(self.0.len() + tail.len());
        v.extend_from_slice(&self.0);
        v.extend_from_slice(tail);
        Tuple::new(v)
    }
}

impl Index<usize> for Tuple {
    type Output = Scalar;

    fn index(&self, i: usize) -> &Scalar {
        &self.0[i]
    }
}

impl From<Vec<Scalar>> for Tuple {
    fn from(v: Vec<Scalar>) -> Self {
        Tuple::new(v)
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, s) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{s}")?;
        }
        f.write_str("]")
    }
}

/// Build a tuple from anything convertible into scalars.
#[macro_export]
macro_rules! tuple {
    ($($v:expr),* $(,)?) => {
        $crate::tuple::Tuple::new(vec![$($crate::types::Scalar::from($v)),*])
    };
}
