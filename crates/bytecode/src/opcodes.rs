//! Bytecode opcode constants.
//!
//! One byte per record tag and operation. The loader and the writer
//! share these values; changing any of them is a wire-format break.

/// Header cookie at the start of every binary image.
pub const HEADER_COOKIE: &[u8] = b"FUGUEVM1";

/// Flag word bit: the program uses the console.
pub const FLAG_USES_CONSOLE: u32 = 1;

// === Structural records ===
pub const SCOPE: u8 = 0x01;
pub const PARENT_SCOPE: u8 = 0x02;
pub const VARIABLES: u8 = 0x03;
pub const GHOSTS: u8 = 0x04;
pub const GHOST_RECORD: u8 = 0x05;
pub const FUNCTIONS: u8 = 0x06;
pub const FUNCTION_SIGNATURE_LIST: u8 = 0x07;
pub const FUNCTION_SIGNATURE_BEGIN: u8 = 0x08;
pub const FUNCTION_SIGNATURE_END: u8 = 0x09;
pub const TUPLE_TYPES: u8 = 0x0A;
pub const TUPLE_HINTS: u8 = 0x0B;
pub const TUPLE_TYPE_MAP: u8 = 0x0C;
pub const STRUCTURE_TYPES: u8 = 0x0D;
pub const STRUCTURE_HINTS: u8 = 0x0E;
pub const STRUCTURE_TYPE_MAP: u8 = 0x0F;
pub const MEMBERS: u8 = 0x10;
pub const CONSTANTS: u8 = 0x11;
pub const RESPONSE_MAPS: u8 = 0x12;
pub const FUTURES: u8 = 0x13;
pub const ARRAY_HINTS: u8 = 0x14;
pub const END_SCOPE: u8 = 0x15;
pub const BEGIN_BLOCK: u8 = 0x16;
pub const END_BLOCK: u8 = 0x17;
pub const GLOBAL_BLOCK: u8 = 0x18;
pub const EXTENSION_DATA: u8 = 0x19;
pub const CALL_DLL: u8 = 0x1A;
/// Placeholder for an absent optional block (if/else parts, global
/// init).
pub const NO_OP: u8 = 0x1B;

// === Literals and pushes ===
pub const PUSH_OPERATION: u8 = 0x20;
pub const PUSH_INTEGER_LITERAL: u8 = 0x21;
pub const PUSH_INTEGER16_LITERAL: u8 = 0x22;
pub const PUSH_REAL_LITERAL: u8 = 0x23;
pub const PUSH_BOOLEAN_LITERAL: u8 = 0x24;
pub const PUSH_STRING_LITERAL: u8 = 0x25;
pub const INTEGER_LITERAL: u8 = 0x26;
pub const BOOLEAN_LITERAL: u8 = 0x27;
pub const DEBUG_WRITE: u8 = 0x28;
pub const DEBUG_READ: u8 = 0x29;

// === Variables ===
pub const GET_VALUE: u8 = 0x2A;
pub const ASSIGN_VALUE: u8 = 0x2B;
pub const INIT: u8 = 0x2C;
pub const BIND_REFERENCE: u8 = 0x2D;
pub const BIND_FUNCTION_REFERENCE: u8 = 0x2E;
pub const SIZE_OF: u8 = 0x2F;
pub const READ_ARRAY: u8 = 0x30;
pub const WRITE_ARRAY: u8 = 0x31;
pub const ARRAY_LENGTH: u8 = 0x32;
pub const CONS_ARRAY_INDIRECT: u8 = 0x33;

// === Composite access ===
pub const READ_TUPLE: u8 = 0x34;
pub const WRITE_TUPLE: u8 = 0x35;
pub const READ_STRUCTURE: u8 = 0x36;
pub const WRITE_STRUCTURE: u8 = 0x37;
pub const READ_STRUCTURE_INDIRECT: u8 = 0x38;
pub const WRITE_STRUCTURE_INDIRECT: u8 = 0x39;
pub const BIND_STRUCT: u8 = 0x3A;

// === Arithmetic and strings ===
pub const ADD_INTEGERS: u8 = 0x3B;
pub const ADD_INTEGER16S: u8 = 0x3C;
pub const ADD_REALS: u8 = 0x3D;
pub const SUBTRACT_INTEGERS: u8 = 0x3E;
pub const SUBTRACT_INTEGER16S: u8 = 0x3F;
pub const SUBTRACT_REALS: u8 = 0x40;
pub const MULTIPLY_INTEGERS: u8 = 0x41;
pub const MULTIPLY_INTEGER16S: u8 = 0x42;
pub const MULTIPLY_REALS: u8 = 0x43;
pub const DIVIDE_INTEGERS: u8 = 0x44;
pub const DIVIDE_INTEGER16S: u8 = 0x45;
pub const DIVIDE_REALS: u8 = 0x46;
pub const CONCAT: u8 = 0x47;

// === Comparison ===
pub const IS_EQUAL: u8 = 0x48;
pub const IS_NOT_EQUAL: u8 = 0x49;
pub const IS_LESSER: u8 = 0x4A;
pub const IS_LESSER_EQUAL: u8 = 0x4B;
pub const IS_GREATER: u8 = 0x4C;
pub const IS_GREATER_EQUAL: u8 = 0x4D;

// === Logical and bitwise ===
pub const LOGICAL_AND: u8 = 0x4E;
pub const LOGICAL_OR: u8 = 0x4F;
pub const LOGICAL_XOR: u8 = 0x50;
pub const LOGICAL_NOT: u8 = 0x51;
pub const BITWISE_AND: u8 = 0x52;
pub const BITWISE_OR: u8 = 0x53;
pub const BITWISE_XOR: u8 = 0x54;
pub const BITWISE_NOT: u8 = 0x55;

// === Control flow ===
pub const DO_WHILE: u8 = 0x56;
pub const WHILE: u8 = 0x57;
pub const WHILE_CONDITION: u8 = 0x58;
pub const BREAK: u8 = 0x59;
pub const RETURN: u8 = 0x5A;
pub const IF: u8 = 0x5B;
pub const ELSE_IF_WRAPPER: u8 = 0x5C;
pub const ELSE_IF: u8 = 0x5D;
pub const EXIT_IF_CHAIN: u8 = 0x5E;

// === Invocation ===
pub const INVOKE: u8 = 0x5F;
pub const INVOKE_INDIRECT: u8 = 0x60;

// === Concurrency ===
pub const FORK_TASK: u8 = 0x61;
pub const FORK_THREAD: u8 = 0x62;
pub const THREAD_POOL: u8 = 0x63;
pub const FUTURE: u8 = 0x64;
pub const ACCEPT_MESSAGE: u8 = 0x65;
pub const ACCEPT_MESSAGE_FROM_MAP: u8 = 0x66;
pub const SEND_TASK_MESSAGE: u8 = 0x67;
pub const GET_MESSAGE_SENDER: u8 = 0x68;
pub const GET_TASK_CALLER: u8 = 0x69;
pub const PARALLEL_FOR: u8 = 0x6A;
pub const HANDOFF: u8 = 0x6B;
pub const HANDOFF_CONTROL: u8 = 0x6C;

// === Casts ===
pub const TYPE_CAST: u8 = 0x6D;
pub const TYPE_CAST_TO_STRING: u8 = 0x6E;

// === Container meta-ops ===
pub const MAP: u8 = 0x6F;
pub const REDUCE: u8 = 0x70;

use fugue_vm::{ArithmeticKind, VmType};

/// Opcode -> (kind, operand type) for the arithmetic family.
pub fn arithmetic_for_opcode(opcode: u8) -> Option<(ArithmeticKind, VmType)> {
    Some(match opcode {
        ADD_INTEGERS => (ArithmeticKind::Add, VmType::Int32),
        ADD_INTEGER16S => (ArithmeticKind::Add, VmType::Int16),
        ADD_REALS => (ArithmeticKind::Add, VmType::Real),
        SUBTRACT_INTEGERS => (ArithmeticKind::Subtract, VmType::Int32),
        SUBTRACT_INTEGER16S => (ArithmeticKind::Subtract, VmType::Int16),
        SUBTRACT_REALS => (ArithmeticKind::Subtract, VmType::Real),
        MULTIPLY_INTEGERS => (ArithmeticKind::Multiply, VmType::Int32),
        MULTIPLY_INTEGER16S => (ArithmeticKind::Multiply, VmType::Int16),
        MULTIPLY_REALS => (ArithmeticKind::Multiply, VmType::Real),
        DIVIDE_INTEGERS => (ArithmeticKind::Divide, VmType::Int32),
        DIVIDE_INTEGER16S => (ArithmeticKind::Divide, VmType::Int16),
        DIVIDE_REALS => (ArithmeticKind::Divide, VmType::Real),
        _ => return None,
    })
}

/// (kind, operand type) -> opcode, the writer-side inverse.
pub fn opcode_for_arithmetic(kind: ArithmeticKind, ty: VmType) -> Option<u8> {
    Some(match (kind, ty) {
        (ArithmeticKind::Add, VmType::Int32) => ADD_INTEGERS,
        (ArithmeticKind::Add, VmType::Int16) => ADD_INTEGER16S,
        (ArithmeticKind::Add, VmType::Real) => ADD_REALS,
        (ArithmeticKind::Subtract, VmType::Int32) => SUBTRACT_INTEGERS,
        (ArithmeticKind::Subtract, VmType::Int16) => SUBTRACT_INTEGER16S,
        (ArithmeticKind::Subtract, VmType::Real) => SUBTRACT_REALS,
        (ArithmeticKind::Multiply, VmType::Int32) => MULTIPLY_INTEGERS,
        (ArithmeticKind::Multiply, VmType::Int16) => MULTIPLY_INTEGER16S,
        (ArithmeticKind::Multiply, VmType::Real) => MULTIPLY_REALS,
        (ArithmeticKind::Divide, VmType::Int32) => DIVIDE_INTEGERS,
        (ArithmeticKind::Divide, VmType::Int16) => DIVIDE_INTEGER16S,
        (ArithmeticKind::Divide, VmType::Real) => DIVIDE_REALS,
        _ => return None,
    })
}
