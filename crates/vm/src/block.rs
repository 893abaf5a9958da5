//! Code blocks: ordered operation sequences bound to a scope.

use crate::machine::ExecutionContext;
use crate::ops::Op;
use crate::scope::ScopeId;
use crate::value::RuntimeError;

/// Non-local control token reported by every operation. Loops and
/// functions interpret these instead of unwinding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowSignal {
    Normal,
    /// Exit the innermost loop.
    Break,
    /// Exit the enclosing function.
    Return,
    /// A taken if/else-if branch finished; skip the rest of the chain.
    ExitIfChain,
}

/// An ordered sequence of operations plus the scope it activates.
/// Anonymous sub-expression blocks carry no scope of their own.
pub struct Block {
    pub scope: Option<ScopeId>,
    pub ops: Vec<Op>,
}

impl Block {
    pub fn new() -> Self {
        Block {
            scope: None,
            ops: Vec::new(),
        }
    }

    pub fn bind_to_scope(&mut self, scope: ScopeId) {
        self.scope = Some(scope);
    }

    pub fn add_operation(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn pop_tail_operation(&mut self) -> Option<Op> {
        self.ops.pop()
    }

    /// Execute the block: activate the bound scope (if any), run the
    /// operations in order, deactivate. Any non-`Normal` signal stops
    /// iteration and is forwarded to the caller.
    pub fn execute(&self, ctx: &mut ExecutionContext) -> Result<FlowSignal, RuntimeError> {
        match self.scope {
            Some(scope) => {
                ctx.enter_scope(scope)?;
                let result = self.run_ops(ctx);
                ctx.exit_scope();
                result
            }
            None => self.run_ops(ctx),
        }
    }

    /// Run the operations without touching scope activation. Used by
    /// callers that manage the activation themselves (global init,
    /// parallel-for counter binding).
    pub fn run_ops(&self, ctx: &mut ExecutionContext) -> Result<FlowSignal, RuntimeError> {
        for op in &self.ops {
            let signal = op.execute(ctx)?;
            if signal != FlowSignal::Normal {
                return Ok(signal);
            }
        }
        Ok(FlowSignal::Normal)
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}
