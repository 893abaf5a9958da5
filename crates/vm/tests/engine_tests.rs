//! End-to-end execution scenarios.
//!
//! Each test assembles a program the way the loader would (scope arena,
//! function table, operation trees), runs it on a capturing console and
//! checks the observable output.

use std::sync::Arc;

use fugue_vm::{
    ArithmeticKind, ArithmeticOp, Block, CompareKind, CompositeHint, CompositeLayout, Function,
    FutureDecl, IfOp, Machine, Op, Program, ResponseMap, ResponseMapEntry, RuntimeError, ScopeId,
    StructTypeId, VmType,
};

fn push(op: Op) -> Op {
    Op::Push(Box::new(op))
}

fn add_i32() -> Op {
    Op::Arithmetic(ArithmeticOp {
        kind: ArithmeticKind::Add,
        ty: VmType::Int32,
        first_is_array: false,
        second_is_array: false,
        param_count: 2,
    })
}

fn int_to_string() -> Op {
    Op::CastToString { from: VmType::Int32 }
}

/// Allocate a child scope under `parent`.
fn child_scope(program: &mut Program, parent: ScopeId) -> ScopeId {
    let scope = program.scopes_mut().alloc();
    program.scopes_mut().get_mut(scope).parent = Some(parent);
    scope
}

/// Build a block bound to a fresh child scope of `parent`.
fn block_in(program: &mut Program, parent: ScopeId, ops: Vec<Op>) -> (ScopeId, Block) {
    let scope = child_scope(program, parent);
    let mut block = Block::new();
    block.ops = ops;
    block.bind_to_scope(scope);
    (scope, block)
}

/// Install a function with the canonical scope chain
/// `locals -> returns -> params -> enclosing`, mirroring the parent
/// links the loader reads from a binary image.
fn install_function(
    program: &mut Program,
    name: &str,
    ops: Vec<Op>,
) -> (fugue_vm::FunctionId, ScopeId, ScopeId, ScopeId) {
    let global = program.global_scope();
    let params = child_scope(program, global);
    let returns = child_scope(program, params);
    let (locals, body) = block_in(program, returns, ops);
    let id = program.add_function(Function::Bytecode {
        params,
        returns,
        body,
    });
    let name = program.intern(name);
    program.scopes_mut().get_mut(global).add_function(name, id);
    (id, params, returns, locals)
}

/// Install the entrypoint and return its local scope.
fn install_entrypoint(program: &mut Program, ops: Vec<Op>) -> ScopeId {
    let (_, _, _, locals) = install_function(program, "entrypoint", ops);
    locals
}

fn run(program: Program) -> Vec<String> {
    Machine::new(program).run_captured(Vec::new()).unwrap()
}

fn print_str(program: &Program, text: &str) -> Vec<Op> {
    vec![Op::PushStr(program.intern(text)), Op::DebugWrite]
}

// ============================================================================
// Arithmetic, casts, console
// ============================================================================

#[test]
fn test_arithmetic_cast_print() {
    let mut program = Program::new();
    install_entrypoint(
        &mut program,
        vec![
            Op::PushInt(2),
            Op::PushInt(3),
            push(add_i32()),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["5"]);
}

#[test]
fn test_empty_block_executes_without_output() {
    let mut program = Program::new();
    install_entrypoint(&mut program, Vec::new());
    assert_eq!(run(program), Vec::<String>::new());
}

#[test]
fn test_global_init_runs_before_entrypoint() {
    let mut program = Program::new();
    let global = program.global_scope();
    let n = program.intern("n");
    program
        .scopes_mut()
        .get_mut(global)
        .add_variable(n, VmType::Int32, false);

    // Init assigns the global through a nested scope-bound block.
    let (_, nested) = block_in(
        &mut program,
        global,
        vec![Op::PushInt(5), Op::InitValue(n)],
    );
    let mut init = Block::new();
    init.ops = vec![Op::ExecuteBlock { body: nested }];
    program.global_init = Some(init);

    install_entrypoint(
        &mut program,
        vec![
            push(Op::GetValue(n)),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["5"]);
}

// ============================================================================
// If / else-if / else
// ============================================================================

#[test]
fn test_if_else_if_else_selects_first_true_branch() {
    let mut program = Program::new();
    let global = program.global_scope();
    let x = program.intern("x");
    program
        .scopes_mut()
        .get_mut(global)
        .add_variable(x, VmType::Bool, false);

    let print_a = print_str(&program, "a");
    let print_b = {
        let mut ops = print_str(&program, "b");
        ops.push(Op::ExitIfChain);
        ops
    };
    let print_c = print_str(&program, "c");

    let (_, true_block) = block_in(&mut program, global, print_a);
    let (_, else_if_body) = block_in(&mut program, global, print_b);
    let (_, chain) = block_in(
        &mut program,
        global,
        vec![Op::PushBool(true), Op::ElseIf { body: else_if_body }],
    );
    let (_, false_block) = block_in(&mut program, global, print_c);

    install_entrypoint(
        &mut program,
        vec![
            push(Op::GetValue(x)), // x defaults to false
            Op::If(IfOp {
                true_block: Some(true_block),
                else_if_chain: Some(chain),
                false_block: Some(false_block),
            }),
        ],
    );
    assert_eq!(run(program), vec!["b"]);
}

#[test]
fn test_if_without_chain_runs_false_block() {
    let mut program = Program::new();
    let global = program.global_scope();
    let print_c = print_str(&program, "c");
    let (_, false_block) = block_in(&mut program, global, print_c);

    install_entrypoint(
        &mut program,
        vec![
            Op::PushBool(false),
            Op::If(IfOp {
                true_block: None,
                else_if_chain: None,
                false_block: Some(false_block),
            }),
        ],
    );
    assert_eq!(run(program), vec!["c"]);
}

// ============================================================================
// Loops
// ============================================================================

#[test]
fn test_while_loop_sum() {
    let mut program = Program::new();
    let global = program.global_scope();
    let i = program.intern("i");
    let sum = program.intern("sum");
    {
        let desc = program.scopes_mut().get_mut(global);
        desc.add_variable(i, VmType::Int32, false);
        desc.add_variable(sum, VmType::Int32, false);
    }

    let body_ops = vec![
        // while (i < 5)
        push(Op::GetValue(i)),
        Op::PushInt(5),
        push(Op::Compare {
            kind: CompareKind::Less,
            ty: VmType::Int32,
        }),
        Op::WhileCondition,
        // sum = sum + i
        push(Op::GetValue(sum)),
        push(Op::GetValue(i)),
        push(add_i32()),
        Op::AssignValue(sum),
        // i = i + 1
        push(Op::GetValue(i)),
        Op::PushInt(1),
        push(add_i32()),
        Op::AssignValue(i),
    ];
    let (_, loop_body) = block_in(&mut program, global, body_ops);

    install_entrypoint(
        &mut program,
        vec![
            Op::PushInt(0),
            Op::InitValue(i),
            Op::PushInt(0),
            Op::InitValue(sum),
            Op::While { body: loop_body },
            push(Op::GetValue(sum)),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["10"]);
}

#[test]
fn test_do_while_false_condition_runs_once() {
    let mut program = Program::new();
    let global = program.global_scope();
    let mut body_ops = print_str(&program, "x");
    body_ops.push(Op::PushBool(false));
    let (_, body) = block_in(&mut program, global, body_ops);

    install_entrypoint(&mut program, vec![Op::DoWhile { body }]);
    assert_eq!(run(program), vec!["x"]);
}

#[test]
fn test_while_false_condition_runs_zero_times() {
    let mut program = Program::new();
    let global = program.global_scope();
    let mut body_ops = vec![Op::PushBool(false), Op::WhileCondition];
    body_ops.extend(print_str(&program, "y"));
    let (_, body) = block_in(&mut program, global, body_ops);

    install_entrypoint(&mut program, vec![Op::While { body }]);
    assert_eq!(run(program), Vec::<String>::new());
}

#[test]
fn test_break_exits_loop() {
    let mut program = Program::new();
    let global = program.global_scope();
    let mut body_ops = print_str(&program, "once");
    body_ops.push(Op::Break);
    body_ops.push(Op::PushBool(true));
    let (_, body) = block_in(&mut program, global, body_ops);

    install_entrypoint(&mut program, vec![Op::DoWhile { body }]);
    assert_eq!(run(program), vec!["once"]);
}

// ============================================================================
// Functions
// ============================================================================

#[test]
fn test_invoke_with_return_value() {
    let mut program = Program::new();
    let n = program.intern("n");
    let r = program.intern("r");

    let (add_one, params, returns, _) = install_function(
        &mut program,
        "addOne",
        vec![
            push(Op::GetValue(n)),
            Op::PushInt(1),
            push(add_i32()),
            Op::AssignValue(r),
        ],
    );
    program
        .scopes_mut()
        .get_mut(params)
        .add_variable(n, VmType::Int32, false);
    program
        .scopes_mut()
        .get_mut(returns)
        .add_variable(r, VmType::Int32, false);

    install_entrypoint(
        &mut program,
        vec![
            Op::PushInt(41),
            push(Op::Invoke(add_one)),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["42"]);
}

#[test]
fn test_invoke_indirect_by_name() {
    let mut program = Program::new();
    let r = program.intern("r");

    let (_, _, returns, _) = install_function(
        &mut program,
        "answer",
        vec![Op::PushInt(40), Op::PushInt(2), push(add_i32()), Op::AssignValue(r)],
    );
    program
        .scopes_mut()
        .get_mut(returns)
        .add_variable(r, VmType::Int32, false);

    let answer = program.intern("answer");
    install_entrypoint(
        &mut program,
        vec![
            push(Op::InvokeIndirect(answer)),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["42"]);
}

#[test]
fn test_reference_parameter_writes_through() {
    let mut program = Program::new();
    let v = program.intern("v");
    let x = program.intern("x");

    let (bump, params, _, _) = install_function(
        &mut program,
        "bump",
        vec![
            push(Op::GetValue(x)),
            Op::PushInt(1),
            push(add_i32()),
            Op::AssignValue(x),
        ],
    );
    program
        .scopes_mut()
        .get_mut(params)
        .add_variable(x, VmType::Int32, true);

    let entry_ops = vec![
        Op::PushInt(10),
        Op::InitValue(v),
        Op::BindReference(v),
        Op::Invoke(bump),
        push(Op::GetValue(v)),
        push(int_to_string()),
        Op::DebugWrite,
    ];
    let locals = install_entrypoint(&mut program, entry_ops);
    program
        .scopes_mut()
        .get_mut(locals)
        .add_variable(v, VmType::Int32, false);

    assert_eq!(run(program), vec!["11"]);
}

#[test]
fn test_constant_reassignment_rejected() {
    let mut program = Program::new();
    let global = program.global_scope();
    let c = program.intern("c");
    {
        let desc = program.scopes_mut().get_mut(global);
        desc.add_variable(c, VmType::Int32, false);
        desc.set_constant(c);
    }

    install_entrypoint(
        &mut program,
        vec![
            Op::PushInt(1),
            Op::InitValue(c),
            Op::PushInt(2),
            Op::AssignValue(c),
        ],
    );
    let result = Machine::new(program).run_captured(Vec::new());
    assert!(matches!(result, Err(RuntimeError::ConstantReassignment(_))));
}

// ============================================================================
// Task messaging
// ============================================================================

#[test]
fn test_task_messaging_with_sender_identity() {
    let mut program = Program::new();
    let global = program.global_scope();
    let ping = program.intern("ping");
    let p = program.intern("p");

    // Response body: print payload, then confirm the message sender is
    // the task that forked us (the main task sent the message).
    let sender_ok = print_str(&program, "sender-ok");
    let (_, sender_ok_block) = block_in(&mut program, global, sender_ok);
    let response_ops = vec![
        push(Op::GetValue(p)),
        push(int_to_string()),
        Op::DebugWrite,
        push(Op::GetMessageSender),
        push(Op::GetTaskCaller),
        push(Op::Compare {
            kind: CompareKind::Equal,
            ty: VmType::Task,
        }),
        Op::If(IfOp {
            true_block: Some(sender_ok_block),
            else_if_chain: None,
            false_block: None,
        }),
    ];
    let (_, response_block) = block_in(&mut program, global, response_ops);

    let aux_scope = program.scopes_mut().alloc();
    program
        .scopes_mut()
        .get_mut(aux_scope)
        .add_variable(p, VmType::Int32, false);

    let accept = Op::AcceptMessage {
        message: ping,
        payload_types: vec![VmType::Int32],
        body: response_block,
        aux_scope,
    };
    let (_, task_body) = block_in(&mut program, global, vec![accept]);

    install_entrypoint(
        &mut program,
        vec![
            push(Op::ForkTask {
                body: Arc::new(task_body),
            }),
            Op::PushInt(7),
            Op::SendTaskMessage {
                by_name: false,
                message: ping,
                payload_types: vec![VmType::Int32],
            },
        ],
    );
    assert_eq!(run(program), vec!["7", "sender-ok"]);
}

#[test]
fn test_response_map_skips_unmatched_messages() {
    let mut program = Program::new();
    let global = program.global_scope();
    let ping = program.intern("ping");
    let noise = program.intern("noise");
    let handlers = program.intern("handlers");
    let p = program.intern("p");
    let zzz = program.intern("zzz");
    let t = program.intern("t");

    let response_ops = vec![push(Op::GetValue(p)), push(int_to_string()), Op::DebugWrite];
    let (_, response_block) = block_in(&mut program, global, response_ops);
    let aux_scope = program.scopes_mut().alloc();
    program
        .scopes_mut()
        .get_mut(aux_scope)
        .add_variable(p, VmType::Int32, false);

    let (task_scope, task_body) = block_in(
        &mut program,
        global,
        vec![Op::AcceptMessageFromMap(handlers)],
    );
    let mut map = ResponseMap::new();
    map.add_entry(ResponseMapEntry {
        message: ping,
        payload_types: vec![VmType::Int32],
        block: response_block,
        aux_scope,
    });
    program
        .scopes_mut()
        .get_mut(task_scope)
        .response_maps
        .insert(handlers, map);

    let entry_ops = vec![
        push(Op::ForkTask {
            body: Arc::new(task_body),
        }),
        Op::InitValue(t),
        // noise("zzz") first; no map entry ever matches it.
        push(Op::GetValue(t)),
        Op::PushStr(zzz),
        Op::SendTaskMessage {
            by_name: false,
            message: noise,
            payload_types: vec![VmType::Str],
        },
        // ping(5) second; the map matches it even though noise is ahead.
        push(Op::GetValue(t)),
        Op::PushInt(5),
        Op::SendTaskMessage {
            by_name: false,
            message: ping,
            payload_types: vec![VmType::Int32],
        },
    ];
    let locals = install_entrypoint(&mut program, entry_ops);
    program
        .scopes_mut()
        .get_mut(locals)
        .add_variable(t, VmType::Task, false);

    assert_eq!(run(program), vec!["5"]);
}

// ============================================================================
// Futures
// ============================================================================

#[test]
fn test_future_produces_value() {
    let mut program = Program::new();
    let f = program.intern("f");

    let entry_ops = vec![
        Op::ForkFuture {
            name: f,
            ty: VmType::Int32,
            use_pool: false,
        },
        push(Op::GetValue(f)),
        push(int_to_string()),
        Op::DebugWrite,
    ];
    let locals = install_entrypoint(&mut program, entry_ops);
    program.scopes_mut().get_mut(locals).futures.insert(
        f,
        FutureDecl {
            ty: VmType::Int32,
            op: Arc::new(Op::IntConstant(42)),
        },
    );

    assert_eq!(run(program), vec!["42"]);
}

#[test]
fn test_future_on_thread_pool() {
    let mut program = Program::new();
    let f = program.intern("f");

    let entry_ops = vec![
        Op::PushInt(2),
        Op::CreateThreadPool,
        Op::ForkFuture {
            name: f,
            ty: VmType::Int32,
            use_pool: true,
        },
        push(Op::GetValue(f)),
        push(int_to_string()),
        Op::DebugWrite,
    ];
    let locals = install_entrypoint(&mut program, entry_ops);
    program.scopes_mut().get_mut(locals).futures.insert(
        f,
        FutureDecl {
            ty: VmType::Int32,
            op: Arc::new(Op::IntConstant(9)),
        },
    );

    assert_eq!(run(program), vec!["9"]);
}

// ============================================================================
// Structures
// ============================================================================

#[test]
fn test_struct_member_chain() {
    let mut program = Program::new();
    let global = program.global_scope();
    let val = program.intern("val");
    let inner = program.intern("inner");
    let o = program.intern("o");

    let inner_id = StructTypeId(1);
    let mut inner_layout = CompositeLayout::new();
    inner_layout.add_member(val, VmType::Int32).unwrap();
    inner_layout.compute_offsets();
    let inner_width = inner_layout.stack_width();

    let outer_id = StructTypeId(2);
    let mut outer_layout = CompositeLayout::new();
    outer_layout.add_composite_member(
        inner,
        VmType::Structure,
        CompositeHint::Structure(inner_id),
        inner_width,
    );
    outer_layout.compute_offsets();

    {
        let desc = program.scopes_mut().get_mut(global);
        desc.structure_layouts.insert(inner_id, inner_layout);
        desc.structure_layouts.insert(outer_id, outer_layout);
        desc.add_variable(o, VmType::Structure, false);
        desc.structure_hints.insert(o, outer_id);
    }
    program.register_structure_owner(inner_id, global);
    program.register_structure_owner(outer_id, global);

    install_entrypoint(
        &mut program,
        vec![
            // o.inner.val = 9
            Op::PushInt(9),
            push(Op::BindStructMember {
                var: Some(o),
                member: inner,
            }),
            Op::WriteStructureIndirect { member: val },
            // print o.inner.val
            push(Op::ReadStructure {
                var: o,
                member: inner,
            }),
            push(Op::ReadStructureIndirect {
                member: val,
                prior: 3,
            }),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["9"]);
}

// ============================================================================
// Parallel for
// ============================================================================

#[test]
fn test_parallel_for_empty_range_runs_zero_times() {
    let mut program = Program::new();
    let global = program.global_scope();
    let counter = program.intern("i");

    let body_ops = print_str(&program, "iteration");
    let (scope, body) = block_in(&mut program, global, body_ops);
    program
        .scopes_mut()
        .get_mut(scope)
        .add_variable(counter, VmType::Int32, false);

    install_entrypoint(
        &mut program,
        vec![
            Op::PushInt(5),
            Op::PushInt(3),
            Op::ParallelFor {
                counter,
                body: Arc::new(body),
            },
        ],
    );
    assert_eq!(run(program), Vec::<String>::new());
}

#[test]
fn test_parallel_for_covers_range() {
    let mut program = Program::new();
    let global = program.global_scope();
    let counter = program.intern("i");

    let body_ops = vec![
        push(Op::GetValue(counter)),
        push(int_to_string()),
        Op::DebugWrite,
    ];
    let (scope, body) = block_in(&mut program, global, body_ops);
    program
        .scopes_mut()
        .get_mut(scope)
        .add_variable(counter, VmType::Int32, false);

    install_entrypoint(
        &mut program,
        vec![
            Op::PushInt(0),
            Op::PushInt(4),
            Op::ParallelFor {
                counter,
                body: Arc::new(body),
            },
        ],
    );
    let mut output = run(program);
    output.sort();
    assert_eq!(output, vec!["0", "1", "2", "3"]);
}

// ============================================================================
// Ghost sets
// ============================================================================

#[test]
fn test_ghost_names_share_caller_cells() {
    let mut program = Program::new();
    let global = program.global_scope();
    let shared = program.intern("shared");
    program
        .scopes_mut()
        .get_mut(global)
        .add_variable(shared, VmType::Int32, false);

    let (writer, params, _, _) = install_function(
        &mut program,
        "writeShared",
        vec![Op::PushInt(77), Op::AssignValue(shared)],
    );
    // The parameter scope ghosts the caller's `shared` cell.
    let mut record = std::collections::HashMap::new();
    record.insert(shared, global);
    program.scopes_mut().get_mut(params).ghosts.push(record);

    install_entrypoint(
        &mut program,
        vec![
            Op::Invoke(writer),
            push(Op::GetValue(shared)),
            push(int_to_string()),
            Op::DebugWrite,
        ],
    );
    assert_eq!(run(program), vec!["77"]);
}
