//! Value representation for the Fugue VM.
//!
//! Design goals:
//! - Compact: strings, arrays, buffers and tasks are small copyable
//!   handles into process-wide pools
//! - Stack-friendly: every type knows its operand-stack width
//! - Introspectable: composite values carry their layout hint so they
//!   can be rebuilt from raw stack bytes

use std::collections::HashMap;

/// Interned identifier/string handle. All name comparison and hashing
/// goes through the handle, never the characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrId(pub u32);

/// Index into the program's function table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// Handle into the array pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ArrayHandle(pub u32);

/// Handle into the buffer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Handle identifying a running or finished task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    /// Sentinel for "no task" (the main task has no caller).
    pub const NONE: TaskId = TaskId(0);
}

/// Handle into a task's address table (structure member paths).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddressId(pub u32);

/// Registered tuple layout identifier. Globally unique across scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleTypeId(pub u32);

/// Registered structure layout identifier. Globally unique across scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StructTypeId(pub u32);

/// Width in bytes of a handle or type-hint id on the operand stack.
pub const HANDLE_WIDTH: usize = 4;

/// Fixed type identifier set.
///
/// The discriminant values double as the wire encoding; they must stay
/// stable between the serializer and the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VmType {
    Null = 0,
    Int32 = 1,
    Int16 = 2,
    Real = 3,
    Bool = 4,
    Str = 5,
    Tuple = 6,
    Structure = 7,
    Function = 8,
    Address = 9,
    Array = 10,
    Task = 11,
    Buffer = 12,
    Error = 13,
}

impl VmType {
    /// Decode a wire type id.
    pub fn from_u32(raw: u32) -> Option<VmType> {
        Some(match raw {
            0 => VmType::Null,
            1 => VmType::Int32,
            2 => VmType::Int16,
            3 => VmType::Real,
            4 => VmType::Bool,
            5 => VmType::Str,
            6 => VmType::Tuple,
            7 => VmType::Structure,
            8 => VmType::Function,
            9 => VmType::Address,
            10 => VmType::Array,
            11 => VmType::Task,
            12 => VmType::Buffer,
            13 => VmType::Error,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Operand-stack width of a value of this type, in bytes.
    /// Composites have no fixed width; their width comes from the layout.
    pub fn stack_width(self) -> Option<usize> {
        Some(match self {
            VmType::Null | VmType::Error => return None,
            VmType::Int32 => 4,
            VmType::Int16 => 2,
            VmType::Real => 4,
            VmType::Bool => 1,
            VmType::Str
            | VmType::Function
            | VmType::Address
            | VmType::Array
            | VmType::Task
            | VmType::Buffer => HANDLE_WIDTH,
            VmType::Tuple | VmType::Structure => return None,
        })
    }

    pub fn is_composite(self) -> bool {
        matches!(self, VmType::Tuple | VmType::Structure)
    }

    /// Human-readable name, used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            VmType::Null => "null",
            VmType::Int32 => "integer",
            VmType::Int16 => "integer16",
            VmType::Real => "real",
            VmType::Bool => "boolean",
            VmType::Str => "string",
            VmType::Tuple => "tuple",
            VmType::Structure => "structure",
            VmType::Function => "function",
            VmType::Address => "address",
            VmType::Array => "array",
            VmType::Task => "task",
            VmType::Buffer => "buffer",
            VmType::Error => "error",
        }
    }
}

/// A tuple value: positional members plus the registered layout id.
#[derive(Clone, Debug, PartialEq)]
pub struct TupleValue {
    pub type_id: TupleTypeId,
    /// Member values in declaration order.
    pub members: Vec<Value>,
}

/// A structure value: by-offset members plus the registered layout id.
#[derive(Clone, Debug, PartialEq)]
pub struct StructValue {
    pub type_id: StructTypeId,
    /// Member values in declaration order.
    pub members: Vec<Value>,
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int16(i16),
    Real(f32),
    Bool(bool),
    Str(StrId),
    Tuple(TupleValue),
    Structure(StructValue),
    Function(FunctionId),
    Address(AddressId),
    Array(ArrayHandle),
    Task(TaskId),
    Buffer(BufferHandle),
}

impl Value {
    /// The type tag of this value.
    pub fn vm_type(&self) -> VmType {
        match self {
            Value::Null => VmType::Null,
            Value::Int32(_) => VmType::Int32,
            Value::Int16(_) => VmType::Int16,
            Value::Real(_) => VmType::Real,
            Value::Bool(_) => VmType::Bool,
            Value::Str(_) => VmType::Str,
            Value::Tuple(_) => VmType::Tuple,
            Value::Structure(_) => VmType::Structure,
            Value::Function(_) => VmType::Function,
            Value::Address(_) => VmType::Address,
            Value::Array(_) => VmType::Array,
            Value::Task(_) => VmType::Task,
            Value::Buffer(_) => VmType::Buffer,
        }
    }

    pub fn as_i32(&self) -> Result<i32, RuntimeError> {
        match self {
            Value::Int32(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Int32, other.vm_type())),
        }
    }

    pub fn as_i16(&self) -> Result<i16, RuntimeError> {
        match self {
            Value::Int16(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Int16, other.vm_type())),
        }
    }

    pub fn as_real(&self) -> Result<f32, RuntimeError> {
        match self {
            Value::Real(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Real, other.vm_type())),
        }
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Bool, other.vm_type())),
        }
    }

    pub fn as_str(&self) -> Result<StrId, RuntimeError> {
        match self {
            Value::Str(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Str, other.vm_type())),
        }
    }

    pub fn as_task(&self) -> Result<TaskId, RuntimeError> {
        match self {
            Value::Task(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Task, other.vm_type())),
        }
    }

    pub fn as_array(&self) -> Result<ArrayHandle, RuntimeError> {
        match self {
            Value::Array(v) => Ok(*v),
            other => Err(RuntimeError::type_mismatch(VmType::Array, other.vm_type())),
        }
    }
}

/// Secondary hint attached to nested composite members.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositeHint {
    Tuple(TupleTypeId),
    Structure(StructTypeId),
}

impl CompositeHint {
    pub fn raw(self) -> u32 {
        match self {
            CompositeHint::Tuple(id) => id.0,
            CompositeHint::Structure(id) => id.0,
        }
    }
}

/// Per-member layout record.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberInfo {
    pub ty: VmType,
    /// Byte offset inside the composite, computed once at registration.
    pub offset: usize,
    /// Stack width of the member (layout width for nested composites).
    pub width: usize,
    /// Layout hint for nested tuple/structure members.
    pub hint: Option<CompositeHint>,
}

/// Layout of a tuple or structure type. Tuples are positional and only
/// ever hold primitive members; structures may nest other composites.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CompositeLayout {
    member_order: Vec<StrId>,
    members: HashMap<StrId, MemberInfo>,
    total_width: usize,
}

impl CompositeLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a primitive member. Width comes from the type itself.
    pub fn add_member(&mut self, name: StrId, ty: VmType) -> Result<(), RuntimeError> {
        let width = ty.stack_width().ok_or(RuntimeError::NotImplemented(
            "composite member requires an explicit width",
        ))?;
        self.push_member(name, ty, width, None);
        Ok(())
    }

    /// Add a nested composite member. The caller resolves the nested
    /// layout's width through the owner maps.
    pub fn add_composite_member(
        &mut self,
        name: StrId,
        ty: VmType,
        hint: CompositeHint,
        width: usize,
    ) {
        self.push_member(name, ty, width, Some(hint));
    }

    fn push_member(&mut self, name: StrId, ty: VmType, width: usize, hint: Option<CompositeHint>) {
        self.member_order.push(name);
        self.members.insert(
            name,
            MemberInfo {
                ty,
                offset: 0,
                width,
                hint,
            },
        );
    }

    /// Compute byte offsets for every member, in declaration order.
    /// Stable for the layout's lifetime once called.
    pub fn compute_offsets(&mut self) {
        let mut offset = 0usize;
        for name in &self.member_order {
            let info = self.members.get_mut(name).expect("member listed in order");
            info.offset = offset;
            offset += info.width;
        }
        self.total_width = offset;
    }

    pub fn member_order(&self) -> &[StrId] {
        &self.member_order
    }

    pub fn member(&self, name: StrId) -> Option<&MemberInfo> {
        self.members.get(&name)
    }

    pub fn member_index(&self, name: StrId) -> Option<usize> {
        self.member_order.iter().position(|m| *m == name)
    }

    pub fn len(&self) -> usize {
        self.member_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_order.is_empty()
    }

    /// Sum of all member widths, hint id excluded.
    pub fn members_width(&self) -> usize {
        self.total_width
    }

    /// Full operand-stack footprint: members plus the trailing hint id.
    pub fn stack_width(&self) -> usize {
        self.total_width + HANDLE_WIDTH
    }
}

/// Bit set on a signature parameter flag word when the parameter is
/// passed by reference.
pub const PARAM_FLAG_REFERENCE: u32 = 1;

/// A function signature as registered in a scope: parameter and return
/// types, layout hints, by-reference flags and nested sub-signatures for
/// higher-order parameters.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FunctionSignature {
    pub params: Vec<VmType>,
    pub returns: Vec<VmType>,
    pub param_hints: Vec<u32>,
    pub param_flags: Vec<u32>,
    pub sub_signatures: Vec<Option<Box<FunctionSignature>>>,
    pub return_hints: Vec<u32>,
}

impl FunctionSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_param(&mut self, ty: VmType, hint: u32, sub: Option<Box<FunctionSignature>>) {
        self.params.push(ty);
        self.param_hints.push(hint);
        self.param_flags.push(0);
        self.sub_signatures.push(sub);
    }

    pub fn set_last_param_reference(&mut self) {
        if let Some(flags) = self.param_flags.last_mut() {
            *flags |= PARAM_FLAG_REFERENCE;
        }
    }

    pub fn add_return(&mut self, ty: VmType, hint: u32) {
        self.returns.push(ty);
        self.return_hints.push(hint);
    }

    pub fn param_is_reference(&self, index: usize) -> bool {
        self.param_flags
            .get(index)
            .map(|f| f & PARAM_FLAG_REFERENCE != 0)
            .unwrap_or(false)
    }

    /// Structural match used for dynamic invocation checks: parameter and
    /// return type lists must agree exactly.
    pub fn matches(&self, other: &FunctionSignature) -> bool {
        self.params == other.params && self.returns == other.returns
    }
}

/// Runtime errors. Any of these aborts the task that raised it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Array index out of bounds: {index} (length {length})")]
    IndexOutOfBounds { index: i64, length: usize },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown member: {member} on {type_name}")]
    UnknownMember { type_name: String, member: String },

    #[error("Cannot reassign constant: {0}")]
    ConstantReassignment(String),

    #[error("Function does not match the required signature: {0}")]
    SignatureMismatch(String),

    #[error("Cannot push a null value onto the stack")]
    NullValuePush,

    #[error("Operand stack underflow")]
    StackUnderflow,

    #[error("Operand stack overflow")]
    StackOverflow,

    #[error("Unknown type id: {0}")]
    UnknownType(u32),

    #[error("Unknown tuple type id: {0}")]
    UnknownTupleType(u32),

    #[error("Unknown structure type id: {0}")]
    UnknownStructureType(u32),

    #[error("Invalid handle: {0}")]
    InvalidHandle(u32),

    #[error("Task not found")]
    TaskNotFound,

    #[error("Unknown extension library: {0}")]
    UnknownExtension(String),

    #[error("Extension failure: {0}")]
    ExtensionFailure(String),

    #[error("Cannot cast from {from} to {to}")]
    InvalidCast { from: String, to: String },

    #[error("Cannot parse {text:?} as {target}")]
    ParseFailure { text: String, target: String },

    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Internal failure: {0}")]
    InternalFailure(String),
}

impl RuntimeError {
    pub fn type_mismatch(expected: VmType, found: VmType) -> RuntimeError {
        RuntimeError::TypeMismatch {
            expected: expected.name().to_string(),
            found: found.name().to_string(),
        }
    }

    pub fn invalid_cast(from: VmType, to: VmType) -> RuntimeError {
        RuntimeError::InvalidCast {
            from: from.name().to_string(),
            to: to.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_wire_codes_round_trip() {
        for raw in 0..14 {
            let ty = VmType::from_u32(raw).unwrap();
            assert_eq!(ty.as_u32(), raw);
        }
        assert!(VmType::from_u32(14).is_none());
    }

    #[test]
    fn test_primitive_widths() {
        assert_eq!(VmType::Int32.stack_width(), Some(4));
        assert_eq!(VmType::Int16.stack_width(), Some(2));
        assert_eq!(VmType::Real.stack_width(), Some(4));
        assert_eq!(VmType::Bool.stack_width(), Some(1));
        assert_eq!(VmType::Str.stack_width(), Some(4));
        assert_eq!(VmType::Tuple.stack_width(), None);
        assert_eq!(VmType::Null.stack_width(), None);
    }

    #[test]
    fn test_layout_offsets() {
        let mut layout = CompositeLayout::new();
        layout.add_member(StrId(1), VmType::Int32).unwrap();
        layout.add_member(StrId(2), VmType::Bool).unwrap();
        layout.add_member(StrId(3), VmType::Real).unwrap();
        layout.compute_offsets();

        assert_eq!(layout.member(StrId(1)).unwrap().offset, 0);
        assert_eq!(layout.member(StrId(2)).unwrap().offset, 4);
        assert_eq!(layout.member(StrId(3)).unwrap().offset, 5);
        assert_eq!(layout.members_width(), 9);
        assert_eq!(layout.stack_width(), 13);
    }

    #[test]
    fn test_nested_layout_width() {
        let mut inner = CompositeLayout::new();
        inner.add_member(StrId(10), VmType::Int32).unwrap();
        inner.compute_offsets();

        let mut outer = CompositeLayout::new();
        outer.add_composite_member(
            StrId(20),
            VmType::Structure,
            CompositeHint::Structure(StructTypeId(7)),
            inner.stack_width(),
        );
        outer.add_member(StrId(21), VmType::Int16).unwrap();
        outer.compute_offsets();

        assert_eq!(outer.member(StrId(20)).unwrap().offset, 0);
        assert_eq!(outer.member(StrId(21)).unwrap().offset, 8);
        assert_eq!(outer.stack_width(), 8 + 2 + 4);
    }

    #[test]
    fn test_signature_reference_flags() {
        let mut sig = FunctionSignature::new();
        sig.add_param(VmType::Int32, 0, None);
        sig.add_param(VmType::Str, 0, None);
        sig.set_last_param_reference();

        assert!(!sig.param_is_reference(0));
        assert!(sig.param_is_reference(1));
    }

    #[test]
    fn test_signature_matching() {
        let mut a = FunctionSignature::new();
        a.add_param(VmType::Int32, 0, None);
        a.add_return(VmType::Bool, 0);

        let mut b = FunctionSignature::new();
        b.add_param(VmType::Int32, 0, None);
        b.add_return(VmType::Bool, 0);
        assert!(a.matches(&b));

        b.add_param(VmType::Real, 0, None);
        assert!(!a.matches(&b));
    }
}
