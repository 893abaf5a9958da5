//! Fugue Virtual Machine
//!
//! A stack-based VM for a small imperative language:
//! - Tagged values over interned handle pools
//! - Lexical scope descriptors with activation frames
//! - A monomorphic operation tree dispatched by match
//! - Cooperative tasks with mailboxes, response maps and futures
//! - Opaque extension hooks for native libraries

pub mod block;
pub mod machine;
pub mod ops;
pub mod pool;
pub mod program;
pub mod scope;
pub mod stack;
pub mod task;
pub mod value;

pub use block::{Block, FlowSignal};
pub use machine::{invoke_function, Console, ExecutionContext, Machine};
pub use ops::{ArithmeticKind, ArithmeticOp, CompareKind, IfOp, Op};
pub use pool::{ArrayPool, BufferPool, StringPool};
pub use program::{Function, Program, ENTRYPOINT_NAME};
pub use scope::{
    Frame, FutureDecl, ResponseMap, ResponseMapEntry, ScopeArena, ScopeDescription, ScopeId, Slot,
    VariableDecl,
};
pub use stack::OperandStack;
pub use task::{FutureCell, Mailbox, Message, TaskRuntime, ThreadPool};
pub use value::{
    ArrayHandle, BufferHandle, CompositeHint, CompositeLayout, FunctionId, FunctionSignature,
    MemberInfo, RuntimeError, StrId, StructTypeId, StructValue, TaskId, TupleTypeId, TupleValue,
    Value, VmType, PARAM_FLAG_REFERENCE,
};
