//! Pipeline driver.

use std::sync::Arc;

use pushq_core::{Error, Result, Tuple};
use pushq_exec::{Permits, Task};
use tracing::debug;

use crate::block::Block;
use crate::context::QueryContext;
use crate::sink::ResultSink;

/// Push `batches` through `block` on the context's pool and collect the
/// ordered output at the root.
///
/// Callable from any thread, including pool workers. The first error wins:
/// the producer's own error if it saw one, otherwise the root's failure.
pub fn execute(ctx: &Arc<QueryContext>, block: Arc<dyn Block>, batches: Vec<Vec<Tuple>>) -> Result<Vec<Tuple>> {
    let (root, handle) = ResultSink::with_limit(Permits::new(ctx.output_permits), ctx.buffer_limit());
    let input_width = batches.iter().flatten().next().map_or(0, Tuple::len);
    let expected = block.output_width(input_width);

    let driver = {
        let ctx = Arc::clone(ctx);
        let block = Arc::clone(&block);
        Task::new(move || {
            let mut sink = block.create(&ctx, root)?;
            if let Err(e) = sink.begin() {
                sink.fail();
                return Err(e);
            }
            for batch in &batches {
                if let Err(e) = sink.output(batch) {
                    sink.fail();
                    return Err(e);
                }
            }
            sink.end()
        })
    };
    ctx.pool.submit(driver.clone());
    driver.join()?;

    let rows = handle.take()?;
    if let Some(bad) = rows.iter().find(|t| t.len() != expected) {
        return Err(Error::Invariant(format!(
            "output tuple of width {} where {} was expected",
            bad.len(),
            expected
        )));
    }
    debug!(rows = rows.len(), width = expected, "pipeline finished");
    Ok(rows)
}
