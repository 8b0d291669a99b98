//! Block protocol: stage factories that wrap a downstream sink.
//!
//! `create` only wires sinks together; nothing runs until a producer pushes
//! into the returned sink.

use std::sync::Arc;

use pushq_core::Result;

use crate::context::QueryContext;
use crate::sink::Sink;

pub trait Block: Send + Sync + 'static {
    /// Width of the tuples this block emits for inputs of width `input_width`.
    fn output_width(&self, input_width: usize) -> usize;

    fn create(&self, ctx: &Arc<QueryContext>, sink: Box<dyn Sink>) -> Result<Box<dyn Sink>>;
}

/// Blocks applied one after the other. The empty chain passes tuples
/// through unchanged.
#[derive(Clone, Default)]
pub struct BlockChain {
    blocks: Vec<Arc<dyn Block>>,
}

impl BlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, block: impl Block) -> Self {
        self.blocks.push(Arc::new(block));
        self
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Block for BlockChain {
    fn output_width(&self, input_width: usize) -> usize {
        self.blocks.iter().fold(input_width, |w, b| b.output_width(w))
    }

    fn create(&self, ctx: &Arc<QueryContext>, sink: Box<dyn Sink>) -> Result<Box<dyn Sink>> {
        self.blocks
            .iter()
            .rev()
            .try_fold(sink, |downstream, b| b.create(ctx, downstream))
    }
}
