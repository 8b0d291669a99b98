//! Expression collaborator.
//!
//! Operators treat expressions as opaque: given a tuple they produce a lazy,
//! possibly failing sequence of scalars.

use std::fmt;
use std::sync::Arc;

use pushq_core::{Error, Result, Scalar, Tuple};

use crate::context::QueryContext;

pub type Items = Box<dyn Iterator<Item = Result<Scalar>> + Send>;

pub trait Expr: Send + Sync + 'static {
    fn evaluate(&self, ctx: &QueryContext, t: &Tuple) -> Result<Items>;

    /// The single item of the result, `None` for the empty sequence.
    fn evaluate_to_item(&self, ctx: &QueryContext, t: &Tuple) -> Result<Option<Scalar>> {
        let mut it = self.evaluate(ctx, t)?;
        let first = match it.next() {
            None => return Ok(None),
            Some(v) => v?,
        };
        if it.next().is_some() {
            return Err(Error::eval("expected at most one item, got a sequence"));
        }
        Ok(Some(first))
    }
}

/// Reads one column; a `Null` column is the empty sequence.
#[derive(Debug, Clone, Copy)]
pub struct Column(pub usize);

impl Expr for Column {
    fn evaluate(&self, _ctx: &QueryContext, t: &Tuple) -> Result<Items> {
        let v = t
            .get(self.0)
            .cloned()
            .ok_or_else(|| Error::eval(format!("column {} out of range for width {}", self.0, t.len())))?;
        if v.is_null() {
            Ok(Box::new(std::iter::empty::<Result<Scalar>>()))
        } else {
            Ok(Box::new(std::iter::once(Ok::<Scalar, Error>(v))))
        }
    }
}

/// The same sequence for every tuple.
#[derive(Debug, Clone)]
pub struct Literal(pub Arc<[Scalar]>);

impl Literal {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        Literal(items.into_iter().map(Into::into).collect::<Vec<_>>().into())
    }
}

impl Expr for Literal {
    fn evaluate(&self, _ctx: &QueryContext, _t: &Tuple) -> Result<Items> {
        let items = Arc::clone(&self.0);
        let n = items.len();
        Ok(Box::new((0..n).map(move |i| Ok::<Scalar, Error>(items[i].clone()))))
    }
}

type ItemsFn = dyn Fn(&Tuple) -> Result<Items> + Send + Sync;

/// Closure-backed expression.
#[derive(Clone)]
pub struct FnExpr(Arc<ItemsFn>);

impl FnExpr {
    /// A closure producing a lazy sequence.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Tuple) -> Result<Items> + Send + Sync + 'static,
    {
        FnExpr(Arc::new(f))
    }

    /// A closure producing a materialized sequence.
    pub fn values<F>(f: F) -> Self
    where
        F: Fn(&Tuple) -> Result<Vec<Scalar>> + Send + Sync + 'static,
    {
        FnExpr(Arc::new(move |t: &Tuple| {
            let v = f(t)?;
            Ok(Box::new(v.into_iter().map(Ok::<Scalar, Error>)) as Items)
        }))
    }
}

impl fmt::Debug for FnExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnExpr")
    }
}

impl Expr for FnExpr {
    fn evaluate(&self, _ctx: &QueryContext, t: &Tuple) -> Result<Items> {
        (self.0)(t)
    }
}
