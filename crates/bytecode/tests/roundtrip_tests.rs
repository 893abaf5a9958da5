//! Loader/writer integration tests.
//!
//! Images are built byte-by-byte with a small builder that mirrors the
//! wire layout, loaded, executed, and re-serialized. Writer output must
//! reload to a structurally-equivalent program and re-serialize
//! byte-for-byte.

use std::sync::Arc;

use fugue_bytecode::{load, load_with_extensions, opcodes as op, write, LoadError};
use fugue_extension::{ExtValue, Extension, ExtensionRegistry, ScopeExchange};
use fugue_vm::{Machine, Program, VmType};

#[derive(Default)]
struct ImageBuilder {
    out: Vec<u8>,
}

impl ImageBuilder {
    fn new() -> Self {
        let mut builder = ImageBuilder::default();
        builder.out.extend_from_slice(op::HEADER_COOKIE);
        builder
    }

    fn u8(&mut self, value: u8) -> &mut Self {
        self.out.push(value);
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.out.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn i32(&mut self, value: i32) -> &mut Self {
        self.out.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn flag(&mut self, value: bool) -> &mut Self {
        self.out.push(value as u8);
        self
    }

    fn str0(&mut self, text: &str) -> &mut Self {
        self.out.extend_from_slice(text.as_bytes());
        self.out.push(0);
        self
    }

    fn strn(&mut self, text: &str) -> &mut Self {
        self.i32(text.len() as i32);
        self.out.extend_from_slice(text.as_bytes());
        self
    }

    /// Scope header: record tag, wire id, parent link.
    fn begin_scope(&mut self, id: u32, parent: u32) -> &mut Self {
        self.u8(op::SCOPE).u32(id).u8(op::PARENT_SCOPE).u32(parent)
    }

    fn variables(&mut self, vars: &[(bool, &str, VmType)]) -> &mut Self {
        self.u8(op::VARIABLES).u32(vars.len() as u32);
        for (is_ref, name, ty) in vars {
            self.flag(*is_ref).str0(name).u32(ty.as_u32());
        }
        self
    }

    /// All remaining scope sections, empty, plus the end marker.
    fn empty_scope_tail(&mut self) -> &mut Self {
        self.u8(op::GHOSTS)
            .u32(0)
            .u8(op::FUNCTIONS)
            .u32(0)
            .u8(op::FUNCTION_SIGNATURE_LIST)
            .u32(0)
            .u8(op::TUPLE_TYPES)
            .u32(0)
            .u8(op::TUPLE_HINTS)
            .u32(0)
            .u8(op::TUPLE_TYPE_MAP)
            .u32(0)
            .u8(op::STRUCTURE_TYPES)
            .u32(0)
            .u8(op::STRUCTURE_HINTS)
            .u32(0)
            .u8(op::STRUCTURE_TYPE_MAP)
            .u32(0)
            .u8(op::CONSTANTS)
            .u32(0)
            .u8(op::RESPONSE_MAPS)
            .u32(0)
            .u8(op::FUTURES)
            .u32(0)
            .u8(op::ARRAY_HINTS)
            .u32(0)
            .u8(op::END_SCOPE)
    }

    /// A scope with no contents at all.
    fn empty_scope(&mut self, id: u32, parent: u32) -> &mut Self {
        self.begin_scope(id, parent).variables(&[]).empty_scope_tail()
    }

    fn global_block_empty(&mut self) -> &mut Self {
        self.u8(op::GLOBAL_BLOCK).u8(op::NO_OP)
    }

    fn extension_data_empty(&mut self) -> &mut Self {
        self.u8(op::EXTENSION_DATA).u32(0)
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

/// Header: flags plus extension list.
fn header(builder: &mut ImageBuilder, uses_console: bool, extensions: &[&str]) {
    builder.u32(if uses_console { op::FLAG_USES_CONSOLE } else { 0 });
    builder.u32(extensions.len() as u32);
    for name in extensions {
        builder.str0(name);
    }
}

/// Minimal valid image: one empty global scope, no init, no data.
fn minimal_image() -> Vec<u8> {
    let mut builder = ImageBuilder::new();
    header(&mut builder, false, &[]);
    builder.empty_scope(1, 0);
    builder.global_block_empty().extension_data_empty();
    builder.finish()
}

/// Image for: entrypoint() { write(string(2 + 3)) }
fn arithmetic_image() -> Vec<u8> {
    let mut builder = ImageBuilder::new();
    header(&mut builder, true, &[]);

    builder.begin_scope(1, 0).variables(&[]);
    builder.u8(op::GHOSTS).u32(0);
    builder.u8(op::FUNCTIONS).u32(1);
    builder.str0("entrypoint").u32(0).u32(0);
    builder.empty_scope(2, 1); // params
    builder.empty_scope(3, 2); // returns
    builder.u8(op::BEGIN_BLOCK);
    builder.empty_scope(4, 3); // locals
    builder.u8(op::PUSH_INTEGER_LITERAL).i32(2);
    builder.u8(op::PUSH_INTEGER_LITERAL).i32(3);
    builder
        .u8(op::PUSH_OPERATION)
        .u8(op::ADD_INTEGERS)
        .flag(false)
        .flag(false)
        .u32(2);
    builder
        .u8(op::PUSH_OPERATION)
        .u8(op::TYPE_CAST_TO_STRING)
        .u32(VmType::Int32.as_u32());
    builder.u8(op::DEBUG_WRITE);
    builder.u8(op::END_BLOCK);

    builder
        .u8(op::FUNCTION_SIGNATURE_LIST)
        .u32(0)
        .u8(op::TUPLE_TYPES)
        .u32(0)
        .u8(op::TUPLE_HINTS)
        .u32(0)
        .u8(op::TUPLE_TYPE_MAP)
        .u32(0)
        .u8(op::STRUCTURE_TYPES)
        .u32(0)
        .u8(op::STRUCTURE_HINTS)
        .u32(0)
        .u8(op::STRUCTURE_TYPE_MAP)
        .u32(0)
        .u8(op::CONSTANTS)
        .u32(0)
        .u8(op::RESPONSE_MAPS)
        .u32(0)
        .u8(op::FUTURES)
        .u32(0)
        .u8(op::ARRAY_HINTS)
        .u32(0)
        .u8(op::END_SCOPE);

    builder.global_block_empty().extension_data_empty();
    builder.finish()
}

// ============================================================================
// Loader error handling
// ============================================================================

#[test]
fn test_invalid_cookie_is_fatal() {
    let image = b"NOTVALID\0\0\0\0".to_vec();
    assert!(matches!(load(&image), Err(LoadError::InvalidCookie)));
}

#[test]
fn test_truncated_stream_reports_offset() {
    let mut image = minimal_image();
    image.truncate(image.len() - 3);
    assert!(matches!(
        load(&image),
        Err(LoadError::UnexpectedEof(_) | LoadError::ExpectedInstruction { .. })
    ));
}

#[test]
fn test_unknown_opcode_reports_offset() {
    let mut builder = ImageBuilder::new();
    header(&mut builder, false, &[]);
    builder.begin_scope(1, 0).variables(&[]);
    builder.u8(op::GHOSTS).u32(0);
    builder.u8(op::FUNCTIONS).u32(1);
    builder.str0("f").u32(0).u32(0);
    builder.empty_scope(2, 0);
    builder.empty_scope(3, 0);
    builder.u8(op::BEGIN_BLOCK);
    builder.empty_scope(4, 0);
    builder.u8(0xEE); // not an opcode
    let image = builder.finish();

    match load(&image) {
        Err(LoadError::UnknownOpcode { opcode, offset }) => {
            assert_eq!(opcode, 0xEE);
            assert!(offset > 0);
        }
        other => panic!("expected unknown opcode, got {:?}", other.err()),
    }
}

#[test]
fn test_unknown_cast_is_static_error() {
    let mut builder = ImageBuilder::new();
    header(&mut builder, false, &[]);
    builder.begin_scope(1, 0).variables(&[]);
    builder.u8(op::GHOSTS).u32(0);
    builder.u8(op::FUNCTIONS).u32(1);
    builder.str0("f").u32(0).u32(0);
    builder.empty_scope(2, 0);
    builder.empty_scope(3, 0);
    builder.u8(op::BEGIN_BLOCK);
    builder.empty_scope(4, 0);
    // task -> integer is not a supported conversion
    builder
        .u8(op::TYPE_CAST)
        .u32(VmType::Task.as_u32())
        .u32(VmType::Int32.as_u32());
    let image = builder.finish();

    assert!(matches!(load(&image), Err(LoadError::UnknownCast { .. })));
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_minimal_image_round_trips_byte_identical() {
    let image = minimal_image();
    let program = load(&image).expect("minimal image loads");
    let rewritten = write(&program).expect("program serializes");
    assert_eq!(rewritten, image);
}

#[test]
fn test_arithmetic_image_loads_and_runs() {
    let image = arithmetic_image();
    let program = load(&image).expect("image loads");
    assert!(program.uses_console);
    assert!(program.entrypoint().is_some());

    let output = Machine::new(program).run_captured(Vec::new()).unwrap();
    assert_eq!(output, vec!["5"]);
}

#[test]
fn test_arithmetic_image_round_trips_byte_identical() {
    let image = arithmetic_image();
    let program = load(&image).expect("image loads");
    let rewritten = write(&program).expect("program serializes");
    assert_eq!(rewritten, image);

    // And the rewritten image is a fixed point.
    let reloaded = load(&rewritten).expect("rewritten image loads");
    assert_eq!(write(&reloaded).unwrap(), rewritten);
}

#[test]
fn test_structural_equivalence_after_reload() {
    let image = arithmetic_image();
    let first = load(&image).unwrap();
    let second = load(&write(&first).unwrap()).unwrap();

    assert_eq!(first.scopes().len(), second.scopes().len());
    assert_eq!(first.functions.len(), second.functions.len());
    assert_eq!(
        first.entrypoint().is_some(),
        second.entrypoint().is_some()
    );

    let a = Machine::new(first).run_captured(Vec::new()).unwrap();
    let b = Machine::new(second).run_captured(Vec::new()).unwrap();
    assert_eq!(a, b);
}

// ============================================================================
// Richer programs: writer output as the source of truth
// ============================================================================

/// Build a program exercising most record families, serialize it, and
/// require the serialized form to be a loader/writer fixed point.
#[test]
fn test_rich_program_write_load_write_fixed_point() {
    let mut program = Program::new();
    let global = program.global_scope();

    // Globals, constants, array hints.
    let flagname = program.intern("ready");
    let items = program.intern("items");
    let limit = program.intern("limit");
    {
        let desc = program.scopes_mut().get_mut(global);
        desc.add_variable(flagname, VmType::Bool, false);
        desc.add_variable(items, VmType::Array, false);
        desc.add_variable(limit, VmType::Int32, false);
        desc.set_constant(limit);
        desc.array_types.insert(items, VmType::Int32);
    }

    // A tuple layout and a structure layout with a nested member.
    let first = program.intern("first");
    let second = program.intern("second");
    let mut tuple_layout = fugue_vm::CompositeLayout::new();
    tuple_layout.add_member(first, VmType::Int32).unwrap();
    tuple_layout.add_member(second, VmType::Bool).unwrap();
    tuple_layout.compute_offsets();
    let pair = fugue_vm::TupleTypeId(1);
    program
        .scopes_mut()
        .get_mut(global)
        .tuple_layouts
        .insert(pair, tuple_layout);
    program.register_tuple_owner(pair, global);
    let pair_name = program.intern("Pair");
    program
        .scopes_mut()
        .get_mut(global)
        .tuple_names
        .insert(pair_name, pair);

    // A function with a parameter and a return value.
    let n = program.intern("n");
    let r = program.intern("r");
    let params = program.scopes_mut().alloc();
    program.scopes_mut().get_mut(params).parent = Some(global);
    program
        .scopes_mut()
        .get_mut(params)
        .add_variable(n, VmType::Int32, false);
    let returns = program.scopes_mut().alloc();
    program.scopes_mut().get_mut(returns).parent = Some(params);
    program
        .scopes_mut()
        .get_mut(returns)
        .add_variable(r, VmType::Int32, false);

    let locals = program.scopes_mut().alloc();
    program.scopes_mut().get_mut(locals).parent = Some(returns);
    let mut body = fugue_vm::Block::new();
    body.ops = vec![
        fugue_vm::Op::Push(Box::new(fugue_vm::Op::GetValue(n))),
        fugue_vm::Op::PushInt(1),
        fugue_vm::Op::Push(Box::new(fugue_vm::Op::Arithmetic(fugue_vm::ArithmeticOp {
            kind: fugue_vm::ArithmeticKind::Add,
            ty: VmType::Int32,
            first_is_array: false,
            second_is_array: false,
            param_count: 2,
        }))),
        fugue_vm::Op::AssignValue(r),
    ];
    body.bind_to_scope(locals);
    let add_one = program.add_function(fugue_vm::Function::Bytecode {
        params,
        returns,
        body,
    });
    let fn_name = program.intern("addOne");
    program
        .scopes_mut()
        .get_mut(global)
        .add_function(fn_name, add_one);

    // A registered signature for indirect invocation.
    let mut signature = fugue_vm::FunctionSignature::new();
    signature.add_param(VmType::Int32, 0, None);
    signature.add_return(VmType::Int32, 0);
    let sig_name = program.intern("incrementer");
    program
        .scopes_mut()
        .get_mut(global)
        .signatures
        .insert(sig_name, signature);

    // A future declared on the global scope.
    let fut = program.intern("later");
    program.scopes_mut().get_mut(global).futures.insert(
        fut,
        fugue_vm::FutureDecl {
            ty: VmType::Int32,
            op: Arc::new(fugue_vm::Op::IntConstant(5)),
        },
    );

    let image = write(&program).expect("program serializes");
    let reloaded = load(&image).expect("writer output loads");
    let image2 = write(&reloaded).expect("reloaded program serializes");
    let reloaded2 = load(&image2).expect("fixed point loads");
    let image3 = write(&reloaded2).expect("fixed point serializes");

    // One write/load cycle reaches the fixed point.
    assert_eq!(image2, image3);

    // Structure survives the trip.
    let g = reloaded2.global_scope();
    assert_eq!(
        reloaded2.scopes().variable_type(g, reloaded2.intern("ready")),
        Some(VmType::Bool)
    );
    assert!(reloaded2.scopes().is_constant(g, reloaded2.intern("limit")));
    assert_eq!(
        reloaded2
            .scopes()
            .array_elem_type(g, reloaded2.intern("items")),
        Some(VmType::Int32)
    );
    assert!(reloaded2
        .scopes()
        .signature(g, reloaded2.intern("incrementer"))
        .is_some());
    assert!(reloaded2
        .scopes()
        .future_decl(g, reloaded2.intern("later"))
        .is_some());
    assert_eq!(reloaded2.functions.len(), 1);
}

/// The global init block may nest scope-bound blocks of its own; both
/// passes must declare those scopes for the reload to resolve them.
#[test]
fn test_global_init_with_nested_scopes_round_trips() {
    let mut program = Program::new();
    let global = program.global_scope();
    let boot = program.intern("boot");

    // An anonymous nested block plus a zero-iteration while loop, each
    // carrying its own scope record inside the init block.
    let nested_scope = program.scopes_mut().alloc();
    program.scopes_mut().get_mut(nested_scope).parent = Some(global);
    let mut nested = fugue_vm::Block::new();
    nested.ops = vec![fugue_vm::Op::PushStr(boot), fugue_vm::Op::DebugWrite];
    nested.bind_to_scope(nested_scope);

    let loop_scope = program.scopes_mut().alloc();
    program.scopes_mut().get_mut(loop_scope).parent = Some(global);
    let mut loop_body = fugue_vm::Block::new();
    loop_body.ops = vec![fugue_vm::Op::PushBool(false), fugue_vm::Op::WhileCondition];
    loop_body.bind_to_scope(loop_scope);

    let mut init = fugue_vm::Block::new();
    init.ops = vec![
        fugue_vm::Op::ExecuteBlock { body: nested },
        fugue_vm::Op::While { body: loop_body },
    ];
    program.global_init = Some(init);

    let image = write(&program).expect("program serializes");
    let reloaded = load(&image).expect("image with nested init scopes loads");

    let init = reloaded.global_init.as_ref().expect("init block survives");
    assert_eq!(init.ops.len(), 2);
    assert_eq!(reloaded.scopes().len(), program.scopes().len());

    let output = Machine::new(reloaded).run_captured(Vec::new()).unwrap();
    assert_eq!(output, vec!["boot"]);

    // Fixed point after one write/load cycle.
    let image2 = write(&load(&image).unwrap()).unwrap();
    assert_eq!(write(&load(&image2).unwrap()).unwrap(), image2);
}

// ============================================================================
// Native functions and extension data
// ============================================================================

struct MathX;

impl Extension for MathX {
    fn name(&self) -> &str {
        "mathx"
    }

    fn call(&self, symbol: &str, args: &[ExtValue]) -> Result<ExtValue, String> {
        match symbol {
            "timesSeven" => Ok(ExtValue::Int32(args[0].as_i32()? * 7)),
            other => Err(format!("unknown extension function: {}", other)),
        }
    }

    fn handoff(&self, exchange: &mut dyn ScopeExchange) -> Result<(), String> {
        exchange.run_block()
    }
}

/// Image with a native function record and an extension data block.
fn native_call_image() -> Vec<u8> {
    let mut builder = ImageBuilder::new();
    header(&mut builder, true, &["mathx"]);

    builder.begin_scope(1, 0).variables(&[]);
    builder.u8(op::GHOSTS).u32(0);
    builder.u8(op::FUNCTIONS).u32(2);

    // Native: magic(n: integer) -> integer, routed to mathx.timesSeven
    builder.str0("magic").u32(0).u32(0);
    builder.u8(op::CALL_DLL);
    builder.str0("mathx").str0("timesSeven");
    builder.u32(VmType::Int32.as_u32()).u32(0);
    builder
        .begin_scope(2, 0)
        .variables(&[(false, "n", VmType::Int32)])
        .empty_scope_tail();

    // entrypoint() { write(string(magic(6))) }
    builder.str0("entrypoint").u32(1).u32(0);
    builder.empty_scope(3, 1); // params
    builder.empty_scope(4, 3); // returns
    builder.u8(op::BEGIN_BLOCK);
    builder.empty_scope(5, 4); // locals
    builder.u8(op::PUSH_INTEGER_LITERAL).i32(6);
    builder.u8(op::PUSH_OPERATION).u8(op::INVOKE).u32(0);
    builder
        .u8(op::PUSH_OPERATION)
        .u8(op::TYPE_CAST_TO_STRING)
        .u32(VmType::Int32.as_u32());
    builder.u8(op::DEBUG_WRITE);
    builder.u8(op::END_BLOCK);

    builder
        .u8(op::FUNCTION_SIGNATURE_LIST)
        .u32(0)
        .u8(op::TUPLE_TYPES)
        .u32(0)
        .u8(op::TUPLE_HINTS)
        .u32(0)
        .u8(op::TUPLE_TYPE_MAP)
        .u32(0)
        .u8(op::STRUCTURE_TYPES)
        .u32(0)
        .u8(op::STRUCTURE_HINTS)
        .u32(0)
        .u8(op::STRUCTURE_TYPE_MAP)
        .u32(0)
        .u8(op::CONSTANTS)
        .u32(0)
        .u8(op::RESPONSE_MAPS)
        .u32(0)
        .u8(op::FUTURES)
        .u32(0)
        .u8(op::ARRAY_HINTS)
        .u32(0)
        .u8(op::END_SCOPE);

    builder.global_block_empty();
    builder.u8(op::EXTENSION_DATA).u32(1);
    builder.str0("mathx").u32(3);
    builder.out.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
    builder.finish()
}

#[test]
fn test_native_function_routes_to_extension() {
    let registry = Arc::new(ExtensionRegistry::new());
    registry.register(Arc::new(MathX));

    let image = native_call_image();
    let program = load_with_extensions(&image, Some(registry.as_ref())).expect("image loads");
    assert_eq!(program.extensions.len(), 1);
    assert_eq!(program.extension_data.len(), 1);
    assert_eq!(program.extension_data[0].1, vec![0xAA, 0xBB, 0xCC]);

    let machine = Machine::with_registry(program, registry);
    let output = machine.run_captured(Vec::new()).unwrap();
    assert_eq!(output, vec!["42"]);
}
