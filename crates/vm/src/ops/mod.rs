//! The operation tree.
//!
//! `Op` is a single monomorphic enum with one variant per bytecode
//! opcode. Every operation honours three contracts:
//!
//! - `result_type`: the static type the operation produces, computed
//!   against a scope without executing anything. Member-access chains
//!   walk backwards through prior operation indices in the enclosing
//!   block.
//! - `execute`: run for effect, reporting a `FlowSignal` that loops and
//!   functions interpret (no host-language unwinding).
//! - `execute_rvalue`: run and hand back the produced value without a
//!   stack round-trip.
//!
//! Nested blocks and sub-operations are owned; chained indirect reads
//! store indices, never pointers, so the tree stays cycle-free.

pub mod arith;
pub mod cast;
pub mod composite;
pub mod container;
pub mod flow;
pub mod task_ops;
pub mod vars;

use std::sync::Arc;

use crate::block::{Block, FlowSignal};
use crate::machine::ExecutionContext;
use crate::program::Program;
use crate::scope::ScopeId;
use crate::value::{FunctionId, RuntimeError, StrId, Value, VmType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithmeticKind {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Shared shape of the typed arithmetic operations. `param_count == 1`
/// folds a single array popped from the stack; `param_count == 2` is the
/// binary form, where either operand may itself be an array that is
/// folded before combining.
#[derive(Clone, Debug)]
pub struct ArithmeticOp {
    pub kind: ArithmeticKind,
    pub ty: VmType,
    pub first_is_array: bool,
    pub second_is_array: bool,
    pub param_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareKind {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

/// The if/else-if/else chain. The wrapper block owns the condition ops
/// and `ElseIf` entries; each taken else-if branch ends with an
/// `ExitIfChain` marker that stops the walk.
pub struct IfOp {
    pub true_block: Option<Block>,
    pub else_if_chain: Option<Block>,
    pub false_block: Option<Block>,
}

pub enum Op {
    // === Literals and pushes ===
    PushInt(i32),
    PushInt16(i16),
    PushReal(f32),
    PushBool(bool),
    PushStr(StrId),
    /// Non-pushing constants, used inside compound operand lists and
    /// future declarations.
    IntConstant(i32),
    BoolConstant(bool),
    /// Evaluate the wrapped operation and push its result.
    Push(Box<Op>),
    DebugWrite,
    DebugRead,

    // === Variables ===
    GetValue(StrId),
    AssignValue(StrId),
    InitValue(StrId),
    BindReference(StrId),
    BindFunctionReference(StrId),
    SizeOf(StrId),
    ReadArray(StrId),
    WriteArray(StrId),
    ArrayLength(StrId),
    /// Build an array of `elem_type` from stack values; the wrapped
    /// operation produces the element count.
    ConsArrayIndirect { elem_type: VmType, count: Box<Op> },

    // === Composite access ===
    ReadTuple { var: StrId, member: StrId },
    WriteTuple { var: StrId, member: StrId },
    ReadStructure { var: StrId, member: StrId },
    WriteStructure { var: StrId, member: StrId },
    /// Read a member of the structure the prior operation produced.
    /// `prior` indexes the enclosing block's operation vector.
    ReadStructureIndirect { member: StrId, prior: usize },
    WriteStructureIndirect { member: StrId },
    /// Bind a reference to a structure member: rooted at a named
    /// variable, or chained from an address on the stack.
    BindStructMember { var: Option<StrId>, member: StrId },

    // === Arithmetic, comparison, strings ===
    Arithmetic(ArithmeticOp),
    Concat {
        first_is_array: bool,
        second_is_array: bool,
        param_count: u32,
    },
    Compare { kind: CompareKind, ty: VmType },

    // === Logical and bitwise ===
    LogicalAnd { operands: Vec<Op> },
    LogicalOr { operands: Vec<Op> },
    LogicalXor,
    LogicalNot,
    BitwiseAnd { ty: VmType, operands: Vec<Op> },
    BitwiseOr { ty: VmType, operands: Vec<Op> },
    BitwiseXor { ty: VmType },
    BitwiseNot { ty: VmType },

    // === Control flow ===
    DoWhile { body: Block },
    While { body: Block },
    WhileCondition,
    Break,
    Return,
    If(IfOp),
    ElseIf { body: Block },
    ExitIfChain,
    ExecuteBlock { body: Block },

    // === Invocation ===
    Invoke(FunctionId),
    InvokeIndirect(StrId),

    // === Concurrency ===
    ForkTask { body: Arc<Block> },
    ForkThread { body: Arc<Block> },
    CreateThreadPool,
    ForkFuture {
        name: StrId,
        ty: VmType,
        use_pool: bool,
    },
    AcceptMessage {
        message: StrId,
        payload_types: Vec<VmType>,
        body: Block,
        aux_scope: ScopeId,
    },
    AcceptMessageFromMap(StrId),
    SendTaskMessage {
        by_name: bool,
        message: StrId,
        payload_types: Vec<VmType>,
    },
    GetMessageSender,
    GetTaskCaller,
    ParallelFor { counter: StrId, body: Arc<Block> },
    Handoff {
        library: StrId,
        code_handle: u32,
        body: Arc<Block>,
    },
    HandoffControl {
        library: StrId,
        counter: StrId,
        code_handle: u32,
        body: Arc<Block>,
    },

    // === Casts ===
    TypeCast { from: VmType, to: VmType },
    CastToString { from: VmType },

    // === Container meta-ops ===
    MapOperation(Box<Op>),
    ReduceOperation(Box<Op>),
}

impl Op {
    /// The static type this operation produces against `scope`. Pure:
    /// never executes code. `block` is the enclosing block, used by
    /// member-access chains to resolve prior operations.
    pub fn result_type(
        &self,
        program: &Program,
        scope: ScopeId,
        block: &Block,
    ) -> Result<VmType, RuntimeError> {
        Ok(match self {
            Op::PushInt(_) | Op::IntConstant(_) => VmType::Int32,
            Op::PushInt16(_) => VmType::Int16,
            Op::PushReal(_) => VmType::Real,
            Op::PushBool(_) | Op::BoolConstant(_) => VmType::Bool,
            Op::PushStr(_) => VmType::Str,
            Op::Push(inner) => inner.result_type(program, scope, block)?,
            Op::DebugWrite => VmType::Null,
            Op::DebugRead => VmType::Str,

            Op::GetValue(name) | Op::AssignValue(name) | Op::BindReference(name) => {
                match program.scopes().variable_type(scope, *name) {
                    Some(ty) => ty,
                    None => program
                        .scopes()
                        .future_decl(scope, *name)
                        .map(|decl| decl.ty)
                        .ok_or_else(|| {
                            RuntimeError::UnknownVariable(program.resolve(*name).to_string())
                        })?,
                }
            }
            Op::InitValue(_) => VmType::Null,
            Op::BindFunctionReference(_) => VmType::Function,
            Op::SizeOf(_) => VmType::Int32,
            Op::ReadArray(name) => program
                .scopes()
                .array_elem_type(scope, *name)
                .ok_or_else(|| RuntimeError::UnknownVariable(program.resolve(*name).to_string()))?,
            Op::WriteArray(_) => VmType::Null,
            Op::ArrayLength(_) => VmType::Int32,
            Op::ConsArrayIndirect { .. } => VmType::Array,

            Op::ReadTuple { var, member } | Op::WriteTuple { var, member } => {
                composite::tuple_member_type(program, scope, *var, *member)?
            }
            Op::ReadStructure { var, member } | Op::WriteStructure { var, member } => {
                composite::structure_member_type(program, scope, *var, *member)?
            }
            Op::ReadStructureIndirect { member, prior } => {
                let struct_id = composite::walk_chain_for_struct(program, scope, block, *prior)?;
                program
                    .structure_layout(struct_id)?
                    .member(*member)
                    .map(|info| info.ty)
                    .ok_or_else(|| RuntimeError::UnknownMember {
                        type_name: "structure".to_string(),
                        member: program.resolve(*member).to_string(),
                    })?
            }
            Op::WriteStructureIndirect { .. } => VmType::Null,
            Op::BindStructMember { .. } => VmType::Address,

            Op::Arithmetic(op) => op.ty,
            Op::Concat { .. } => VmType::Str,
            Op::Compare { .. } => VmType::Bool,
            Op::LogicalAnd { .. } | Op::LogicalOr { .. } | Op::LogicalXor | Op::LogicalNot => {
                VmType::Bool
            }
            Op::BitwiseAnd { ty, .. }
            | Op::BitwiseOr { ty, .. }
            | Op::BitwiseXor { ty }
            | Op::BitwiseNot { ty } => *ty,

            Op::DoWhile { .. }
            | Op::While { .. }
            | Op::WhileCondition
            | Op::Break
            | Op::Return
            | Op::If(_)
            | Op::ElseIf { .. }
            | Op::ExitIfChain
            | Op::ExecuteBlock { .. } => VmType::Null,

            Op::Invoke(id) => program.function(*id)?.result_type(program),
            Op::InvokeIndirect(name) => {
                if let Some(sig) = program.scopes().signature(scope, *name) {
                    sig.returns.first().copied().unwrap_or(VmType::Null)
                } else if let Some(id) = program.scopes().function(scope, *name) {
                    program.function(id)?.result_type(program)
                } else {
                    match program.scopes().variable_type(scope, *name) {
                        Some(VmType::Function) => VmType::Null,
                        _ => {
                            return Err(RuntimeError::UnknownFunction(
                                program.resolve(*name).to_string(),
                            ))
                        }
                    }
                }
            }

            Op::ForkTask { .. } | Op::ForkThread { .. } => VmType::Task,
            Op::CreateThreadPool
            | Op::ForkFuture { .. }
            | Op::AcceptMessage { .. }
            | Op::AcceptMessageFromMap(_)
            | Op::SendTaskMessage { .. }
            | Op::ParallelFor { .. }
            | Op::Handoff { .. }
            | Op::HandoffControl { .. } => VmType::Null,
            Op::GetMessageSender | Op::GetTaskCaller => VmType::Task,

            Op::TypeCast { to, .. } => *to,
            Op::CastToString { .. } => VmType::Str,

            Op::MapOperation(_) => VmType::Array,
            Op::ReduceOperation(inner) => inner.result_type(program, scope, block)?,
        })
    }

    /// Whether executing this operation leaves its result on the operand
    /// stack. Used by compound operand evaluation to keep the stack
    /// neutral.
    pub fn pushes_result(&self) -> bool {
        matches!(
            self,
            Op::PushInt(_)
                | Op::PushInt16(_)
                | Op::PushReal(_)
                | Op::PushBool(_)
                | Op::PushStr(_)
                | Op::Push(_)
                | Op::DebugRead
                | Op::BindReference(_)
                | Op::BindFunctionReference(_)
        )
    }

    /// Execute for effect. Loops and functions interpret the returned
    /// signal; everything else forwards it unchanged.
    pub fn execute(&self, ctx: &mut ExecutionContext) -> Result<FlowSignal, RuntimeError> {
        match self {
            Op::DoWhile { body } => flow::do_while(ctx, body),
            Op::While { body } => flow::while_loop(ctx, body),
            Op::WhileCondition => flow::while_condition(ctx),
            Op::Break => Ok(FlowSignal::Break),
            Op::Return => Ok(FlowSignal::Return),
            Op::If(op) => flow::if_chain(ctx, op),
            Op::ElseIf { body } => flow::else_if(ctx, body),
            Op::ExitIfChain => Ok(FlowSignal::ExitIfChain),
            Op::ExecuteBlock { body } => body.execute(ctx),

            Op::AcceptMessage {
                message,
                payload_types,
                body,
                aux_scope,
            } => task_ops::accept_message(ctx, *message, payload_types, body, *aux_scope),
            Op::AcceptMessageFromMap(name) => task_ops::accept_from_map(ctx, *name),
            Op::SendTaskMessage {
                by_name,
                message,
                payload_types,
            } => task_ops::send_message(ctx, *by_name, *message, payload_types),
            Op::CreateThreadPool => task_ops::create_thread_pool(ctx),
            Op::ForkFuture { name, ty, use_pool } => {
                task_ops::fork_future(ctx, *name, *ty, *use_pool)
            }
            Op::ParallelFor { counter, body } => task_ops::parallel_for(ctx, *counter, body),
            Op::Handoff { library, body, .. } => task_ops::handoff(ctx, *library, body, None),
            Op::HandoffControl {
                library,
                counter,
                body,
                ..
            } => task_ops::handoff(ctx, *library, body, Some(*counter)),

            _ => {
                self.eval(ctx)?;
                Ok(FlowSignal::Normal)
            }
        }
    }

    /// Execute and return the produced value. Control-flow and
    /// statement operations produce null.
    pub fn execute_rvalue(&self, ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
        match self {
            Op::DoWhile { .. }
            | Op::While { .. }
            | Op::WhileCondition
            | Op::Break
            | Op::Return
            | Op::If(_)
            | Op::ElseIf { .. }
            | Op::ExitIfChain
            | Op::ExecuteBlock { .. }
            | Op::AcceptMessage { .. }
            | Op::AcceptMessageFromMap(_)
            | Op::SendTaskMessage { .. }
            | Op::CreateThreadPool
            | Op::ForkFuture { .. }
            | Op::ParallelFor { .. }
            | Op::Handoff { .. }
            | Op::HandoffControl { .. } => {
                self.execute(ctx)?;
                Ok(Value::Null)
            }
            _ => self.eval(ctx),
        }
    }

    /// Value-producing core shared by `execute` and `execute_rvalue`.
    fn eval(&self, ctx: &mut ExecutionContext) -> Result<Value, RuntimeError> {
        match self {
            Op::PushInt(v) => {
                ctx.stack.push_i32(*v)?;
                Ok(Value::Int32(*v))
            }
            Op::PushInt16(v) => {
                ctx.stack.push_i16(*v)?;
                Ok(Value::Int16(*v))
            }
            Op::PushReal(v) => {
                ctx.stack.push_f32(*v)?;
                Ok(Value::Real(*v))
            }
            Op::PushBool(v) => {
                ctx.stack.push_bool(*v)?;
                Ok(Value::Bool(*v))
            }
            Op::PushStr(id) => {
                ctx.stack.push_handle(id.0)?;
                Ok(Value::Str(*id))
            }
            Op::IntConstant(v) => Ok(Value::Int32(*v)),
            Op::BoolConstant(v) => Ok(Value::Bool(*v)),
            Op::Push(inner) => {
                let value = inner.execute_rvalue(ctx)?;
                if !inner.pushes_result() {
                    ctx.push_value(&value)?;
                }
                Ok(value)
            }
            Op::DebugWrite => vars::debug_write(ctx),
            Op::DebugRead => vars::debug_read(ctx),

            Op::GetValue(name) => ctx.read_variable(*name),
            Op::AssignValue(name) => vars::assign_value(ctx, *name, false),
            Op::InitValue(name) => vars::assign_value(ctx, *name, true),
            Op::BindReference(name) => vars::bind_reference(ctx, *name),
            Op::BindFunctionReference(name) => vars::bind_function_reference(ctx, *name),
            Op::SizeOf(name) => vars::size_of(ctx, *name),
            Op::ReadArray(name) => vars::read_array(ctx, *name),
            Op::WriteArray(name) => vars::write_array(ctx, *name),
            Op::ArrayLength(name) => vars::array_length(ctx, *name),
            Op::ConsArrayIndirect { elem_type, count } => {
                vars::cons_array_indirect(ctx, *elem_type, count)
            }

            Op::ReadTuple { var, member } => composite::read_tuple(ctx, *var, *member),
            Op::WriteTuple { var, member } => composite::write_tuple(ctx, *var, *member),
            Op::ReadStructure { var, member } => composite::read_structure(ctx, *var, *member),
            Op::WriteStructure { var, member } => composite::write_structure(ctx, *var, *member),
            Op::ReadStructureIndirect { member, .. } => {
                composite::read_structure_indirect(ctx, *member)
            }
            Op::WriteStructureIndirect { member } => {
                composite::write_structure_indirect(ctx, *member)
            }
            Op::BindStructMember { var, member } => {
                composite::bind_struct_member(ctx, *var, *member)
            }

            Op::Arithmetic(op) => arith::arithmetic(ctx, op),
            Op::Concat {
                first_is_array,
                second_is_array,
                param_count,
            } => arith::concat(ctx, *first_is_array, *second_is_array, *param_count),
            Op::Compare { kind, ty } => arith::compare(ctx, *kind, *ty),

            Op::LogicalAnd { operands } => arith::logical_and(ctx, operands),
            Op::LogicalOr { operands } => arith::logical_or(ctx, operands),
            Op::LogicalXor => arith::logical_xor(ctx),
            Op::LogicalNot => arith::logical_not(ctx),
            Op::BitwiseAnd { ty, operands } => arith::bitwise_compound(ctx, *ty, operands, |a, b| a & b),
            Op::BitwiseOr { ty, operands } => arith::bitwise_compound(ctx, *ty, operands, |a, b| a | b),
            Op::BitwiseXor { ty } => arith::bitwise_xor(ctx, *ty),
            Op::BitwiseNot { ty } => arith::bitwise_not(ctx, *ty),

            Op::Invoke(id) => flow::invoke(ctx, *id),
            Op::InvokeIndirect(name) => flow::invoke_indirect(ctx, *name),

            Op::ForkTask { body } => task_ops::fork_task(ctx, body, false),
            Op::ForkThread { body } => task_ops::fork_task(ctx, body, true),
            Op::GetMessageSender => task_ops::message_sender(ctx),
            Op::GetTaskCaller => Ok(Value::Task(ctx.caller)),

            Op::TypeCast { from, to } => cast::type_cast(ctx, *from, *to),
            Op::CastToString { from } => cast::cast_to_string(ctx, *from),

            Op::MapOperation(inner) => container::map_array(ctx, inner),
            Op::ReduceOperation(inner) => container::reduce_array(ctx, inner),

            // Control and statement variants are handled in execute().
            other => {
                other.execute(ctx)?;
                Ok(Value::Null)
            }
        }
    }
}

/// Evaluate a sub-operation as an operand: take its rvalue and restore
/// stack neutrality if the operation pushed its result.
pub fn evaluate_operand(
    op: &Op,
    ctx: &mut ExecutionContext,
) -> Result<Value, RuntimeError> {
    let value = op.execute_rvalue(ctx)?;
    if op.pushes_result() {
        let width = ctx.value_width(&value)?;
        ctx.stack.discard(width)?;
    }
    Ok(value)
}
