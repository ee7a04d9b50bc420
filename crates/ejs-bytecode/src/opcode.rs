//! Bytecode opcodes for the Ejscript VM.
//!
//! All opcodes are single-byte instructions. Numeric operands are encoded
//! as signed variable-length integers, except the fixed-width `Word`/`Byte`
//! displacements of patched jumps and the `Double` payload of
//! `LoadDouble`.
//!
//! Layout:
//! - 0x00-0x0F: stack manipulation and miscellany
//! - 0x10-0x2F: literal loads
//! - 0x30-0x8F: slot load/store families (local, object, this) with
//!   dedicated forms for slots 0-9
//! - 0x90-0x9F: block/global/type slots and by-name access
//! - 0xA0-0xAF: calls and returns
//! - 0xB0-0xBF: branches (32-bit and 8-bit forms)
//! - 0xC0-0xCF: exceptions
//! - 0xD0-0xDF: arithmetic
//! - 0xE0-0xEF: comparisons and type operators
//! - 0xF0-0xFF: object construction and block management

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack manipulation & misc (0x00-0x0F) =====
    Nop = 0x00,
    Pop = 0x01,
    /// Pop N items (operand: count)
    PopItems = 0x02,
    Dup = 0x03,
    Swap = 0x04,
    /// Push the result register of the last call
    PushResult = 0x05,
    /// Push the pending catch argument
    PushCatchArg = 0x06,
    /// Debug marker (operands: filename offset, line, source offset)
    Debug = 0x07,

    // ===== Literals (0x10-0x2F) =====
    LoadTrue = 0x10,
    LoadFalse = 0x11,
    LoadNull = 0x12,
    LoadUndefined = 0x13,
    Load0 = 0x14,
    Load1 = 0x15,
    Load2 = 0x16,
    Load3 = 0x17,
    Load4 = 0x18,
    Load5 = 0x19,
    Load6 = 0x1A,
    Load7 = 0x1B,
    Load8 = 0x1C,
    Load9 = 0x1D,
    /// Push integer (operand: value)
    LoadInt = 0x1E,
    /// Push double (operand: 8-byte IEEE-754 LE)
    LoadDouble = 0x1F,
    /// Push string from the constant pool (operand: pool offset)
    LoadString = 0x20,
    /// Push namespace (operand: URI pool offset)
    LoadNamespace = 0x21,
    /// Push regular expression (operand: source pool offset)
    LoadRegExp = 0x22,
    /// Push XML literal (operand: text pool offset)
    LoadXml = 0x23,
    LoadGlobal = 0x24,
    LoadThis = 0x25,

    // ===== Local slots (0x30-0x4A) =====
    GetLocalSlot0 = 0x30,
    GetLocalSlot1 = 0x31,
    GetLocalSlot2 = 0x32,
    GetLocalSlot3 = 0x33,
    GetLocalSlot4 = 0x34,
    GetLocalSlot5 = 0x35,
    GetLocalSlot6 = 0x36,
    GetLocalSlot7 = 0x37,
    GetLocalSlot8 = 0x38,
    GetLocalSlot9 = 0x39,
    /// (operand: slot)
    GetLocalSlot = 0x3A,
    PutLocalSlot0 = 0x40,
    PutLocalSlot1 = 0x41,
    PutLocalSlot2 = 0x42,
    PutLocalSlot3 = 0x43,
    PutLocalSlot4 = 0x44,
    PutLocalSlot5 = 0x45,
    PutLocalSlot6 = 0x46,
    PutLocalSlot7 = 0x47,
    PutLocalSlot8 = 0x48,
    PutLocalSlot9 = 0x49,
    PutLocalSlot = 0x4A,

    // ===== Object slots (0x50-0x6A) =====
    GetObjSlot0 = 0x50,
    GetObjSlot1 = 0x51,
    GetObjSlot2 = 0x52,
    GetObjSlot3 = 0x53,
    GetObjSlot4 = 0x54,
    GetObjSlot5 = 0x55,
    GetObjSlot6 = 0x56,
    GetObjSlot7 = 0x57,
    GetObjSlot8 = 0x58,
    GetObjSlot9 = 0x59,
    GetObjSlot = 0x5A,
    PutObjSlot0 = 0x60,
    PutObjSlot1 = 0x61,
    PutObjSlot2 = 0x62,
    PutObjSlot3 = 0x63,
    PutObjSlot4 = 0x64,
    PutObjSlot5 = 0x65,
    PutObjSlot6 = 0x66,
    PutObjSlot7 = 0x67,
    PutObjSlot8 = 0x68,
    PutObjSlot9 = 0x69,
    PutObjSlot = 0x6A,

    // ===== This slots (0x70-0x8A) =====
    GetThisSlot0 = 0x70,
    GetThisSlot1 = 0x71,
    GetThisSlot2 = 0x72,
    GetThisSlot3 = 0x73,
    GetThisSlot4 = 0x74,
    GetThisSlot5 = 0x75,
    GetThisSlot6 = 0x76,
    GetThisSlot7 = 0x77,
    GetThisSlot8 = 0x78,
    GetThisSlot9 = 0x79,
    GetThisSlot = 0x7A,
    PutThisSlot0 = 0x80,
    PutThisSlot1 = 0x81,
    PutThisSlot2 = 0x82,
    PutThisSlot3 = 0x83,
    PutThisSlot4 = 0x84,
    PutThisSlot5 = 0x85,
    PutThisSlot6 = 0x86,
    PutThisSlot7 = 0x87,
    PutThisSlot8 = 0x88,
    PutThisSlot9 = 0x89,
    PutThisSlot = 0x8A,

    // ===== Block, global, type slots and by-name access (0x90-0x9F) =====
    /// (operands: slot, nth enclosing block)
    GetBlockSlot = 0x90,
    PutBlockSlot = 0x91,
    GetGlobalSlot = 0x92,
    PutGlobalSlot = 0x93,
    /// (operands: slot, nth base)
    GetTypeSlot = 0x94,
    PutTypeSlot = 0x95,
    GetThisTypeSlot = 0x96,
    PutThisTypeSlot = 0x97,
    /// Unbound scoped access (operands: space offset, name offset)
    GetScopedName = 0x98,
    PutScopedName = 0x99,
    /// Unbound object access (operands: space offset, name offset)
    GetObjName = 0x9A,
    PutObjName = 0x9B,
    /// Unbound object access with the name value on the stack
    GetObjNameExpr = 0x9C,
    PutObjNameExpr = 0x9D,

    // ===== Calls (0xA0-0xAF) =====
    /// Call a function value with a receiver on the stack (operand: argc)
    Call = 0xA0,
    /// (operands: space offset, name offset, argc)
    CallScopedName = 0xA1,
    CallObjName = 0xA2,
    /// (operands: slot, argc)
    CallObjSlot = 0xA3,
    CallObjInstanceSlot = 0xA4,
    CallObjStaticSlot = 0xA5,
    CallThisSlot = 0xA6,
    CallThisStaticSlot = 0xA7,
    CallGlobalSlot = 0xA8,
    /// (operands: slot, nth block, argc)
    CallBlockSlot = 0xA9,
    /// (operand: argc)
    CallConstructor = 0xAA,
    /// Call the base-class constructor (operand: argc)
    CallNextConstructor = 0xAB,
    Return = 0xAC,
    ReturnValue = 0xAD,

    // ===== Branches (0xB0-0xBF) =====
    /// (operand: 32-bit displacement word)
    Goto = 0xB0,
    /// (operand: 8-bit displacement)
    Goto8 = 0xB1,
    BranchTrue = 0xB2,
    BranchTrue8 = 0xB3,
    BranchFalse = 0xB4,
    BranchFalse8 = 0xB5,
    BranchEq = 0xB6,
    BranchNe = 0xB7,
    BranchStrictlyEq = 0xB8,
    BranchStrictlyNe = 0xB9,
    BranchLt = 0xBA,
    BranchLe = 0xBB,
    BranchGt = 0xBC,
    BranchGe = 0xBD,
    BranchNull = 0xBE,
    BranchUndefined = 0xBF,

    // ===== Exceptions (0xC0-0xCF) =====
    Throw = 0xC0,
    /// Run the pending finally block
    Finally = 0xC1,
    EndException = 0xC2,

    // ===== Arithmetic (0xD0-0xDF) =====
    Add = 0xD0,
    Sub = 0xD1,
    Mul = 0xD2,
    Div = 0xD3,
    Rem = 0xD4,
    Shl = 0xD5,
    Shr = 0xD6,
    Ushr = 0xD7,
    BitAnd = 0xD8,
    BitOr = 0xD9,
    BitXor = 0xDA,
    Neg = 0xDB,
    LogicalNot = 0xDC,
    BitNot = 0xDD,

    // ===== Comparison & type operators (0xE0-0xEF) =====
    CompareEq = 0xE0,
    CompareNe = 0xE1,
    CompareStrictlyEq = 0xE2,
    CompareStrictlyNe = 0xE3,
    CompareLt = 0xE4,
    CompareLe = 0xE5,
    CompareGt = 0xE6,
    CompareGe = 0xE7,
    InstanceOf = 0xE8,
    IsA = 0xE9,
    In = 0xEA,
    CastOp = 0xEB,
    Like = 0xEC,
    TypeOf = 0xED,
    DeleteScopedName = 0xEE,
    DeleteObjName = 0xEF,

    // ===== Object construction & block management (0xF0-0xFF) =====
    /// Construct with the type on the stack
    New = 0xF0,
    /// Object literal (operands: type ref, field count, then per field:
    /// space offset, name offset; values are on the stack)
    NewObject = 0xF1,
    /// (operand: element count)
    NewArray = 0xF2,
    Super = 0xF3,
    /// (operands: slot, nth block)
    OpenBlock = 0xF4,
    CloseBlock = 0xF5,
    OpenWith = 0xF6,
    /// (operand: URI pool offset)
    AddNamespace = 0xF7,
    AddNamespaceRef = 0xF8,
    /// (operands: slot, nth block)
    DefineFunction = 0xF9,
    /// (operands: space offset, name offset)
    DefineClass = 0xFA,
    /// Default-argument jump table (operands: count, then 32-bit entries)
    InitDefaultArgs = 0xFB,
    /// 8-bit form (operands: count, then 8-bit entries)
    InitDefaultArgs8 = 0xFC,
}

/// Operand encodings that follow an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Signed variable-length integer
    Num,
    /// Fixed 32-bit little-endian word (patched jump displacement)
    Word,
    /// Fixed single byte (8-bit jump displacement)
    Byte,
    /// IEEE-754 double, little-endian
    Double,
}

impl Opcode {
    /// All defined opcodes, in byte order.
    pub const ALL: &'static [Opcode] = &[
        Opcode::Nop,
        Opcode::Pop,
        Opcode::PopItems,
        Opcode::Dup,
        Opcode::Swap,
        Opcode::PushResult,
        Opcode::PushCatchArg,
        Opcode::Debug,
        Opcode::LoadTrue,
        Opcode::LoadFalse,
        Opcode::LoadNull,
        Opcode::LoadUndefined,
        Opcode::Load0,
        Opcode::Load1,
        Opcode::Load2,
        Opcode::Load3,
        Opcode::Load4,
        Opcode::Load5,
        Opcode::Load6,
        Opcode::Load7,
        Opcode::Load8,
        Opcode::Load9,
        Opcode::LoadInt,
        Opcode::LoadDouble,
        Opcode::LoadString,
        Opcode::LoadNamespace,
        Opcode::LoadRegExp,
        Opcode::LoadXml,
        Opcode::LoadGlobal,
        Opcode::LoadThis,
        Opcode::GetLocalSlot0,
        Opcode::GetLocalSlot1,
        Opcode::GetLocalSlot2,
        Opcode::GetLocalSlot3,
        Opcode::GetLocalSlot4,
        Opcode::GetLocalSlot5,
        Opcode::GetLocalSlot6,
        Opcode::GetLocalSlot7,
        Opcode::GetLocalSlot8,
        Opcode::GetLocalSlot9,
        Opcode::GetLocalSlot,
        Opcode::PutLocalSlot0,
        Opcode::PutLocalSlot1,
        Opcode::PutLocalSlot2,
        Opcode::PutLocalSlot3,
        Opcode::PutLocalSlot4,
        Opcode::PutLocalSlot5,
        Opcode::PutLocalSlot6,
        Opcode::PutLocalSlot7,
        Opcode::PutLocalSlot8,
        Opcode::PutLocalSlot9,
        Opcode::PutLocalSlot,
        Opcode::GetObjSlot0,
        Opcode::GetObjSlot1,
        Opcode::GetObjSlot2,
        Opcode::GetObjSlot3,
        Opcode::GetObjSlot4,
        Opcode::GetObjSlot5,
        Opcode::GetObjSlot6,
        Opcode::GetObjSlot7,
        Opcode::GetObjSlot8,
        Opcode::GetObjSlot9,
        Opcode::GetObjSlot,
        Opcode::PutObjSlot0,
        Opcode::PutObjSlot1,
        Opcode::PutObjSlot2,
        Opcode::PutObjSlot3,
        Opcode::PutObjSlot4,
        Opcode::PutObjSlot5,
        Opcode::PutObjSlot6,
        Opcode::PutObjSlot7,
        Opcode::PutObjSlot8,
        Opcode::PutObjSlot9,
        Opcode::PutObjSlot,
        Opcode::GetThisSlot0,
        Opcode::GetThisSlot1,
        Opcode::GetThisSlot2,
        Opcode::GetThisSlot3,
        Opcode::GetThisSlot4,
        Opcode::GetThisSlot5,
        Opcode::GetThisSlot6,
        Opcode::GetThisSlot7,
        Opcode::GetThisSlot8,
        Opcode::GetThisSlot9,
        Opcode::GetThisSlot,
        Opcode::PutThisSlot0,
        Opcode::PutThisSlot1,
        Opcode::PutThisSlot2,
        Opcode::PutThisSlot3,
        Opcode::PutThisSlot4,
        Opcode::PutThisSlot5,
        Opcode::PutThisSlot6,
        Opcode::PutThisSlot7,
        Opcode::PutThisSlot8,
        Opcode::PutThisSlot9,
        Opcode::PutThisSlot,
        Opcode::GetBlockSlot,
        Opcode::PutBlockSlot,
        Opcode::GetGlobalSlot,
        Opcode::PutGlobalSlot,
        Opcode::GetTypeSlot,
        Opcode::PutTypeSlot,
        Opcode::GetThisTypeSlot,
        Opcode::PutThisTypeSlot,
        Opcode::GetScopedName,
        Opcode::PutScopedName,
        Opcode::GetObjName,
        Opcode::PutObjName,
        Opcode::GetObjNameExpr,
        Opcode::PutObjNameExpr,
        Opcode::Call,
        Opcode::CallScopedName,
        Opcode::CallObjName,
        Opcode::CallObjSlot,
        Opcode::CallObjInstanceSlot,
        Opcode::CallObjStaticSlot,
        Opcode::CallThisSlot,
        Opcode::CallThisStaticSlot,
        Opcode::CallGlobalSlot,
        Opcode::CallBlockSlot,
        Opcode::CallConstructor,
        Opcode::CallNextConstructor,
        Opcode::Return,
        Opcode::ReturnValue,
        Opcode::Goto,
        Opcode::Goto8,
        Opcode::BranchTrue,
        Opcode::BranchTrue8,
        Opcode::BranchFalse,
        Opcode::BranchFalse8,
        Opcode::BranchEq,
        Opcode::BranchNe,
        Opcode::BranchStrictlyEq,
        Opcode::BranchStrictlyNe,
        Opcode::BranchLt,
        Opcode::BranchLe,
        Opcode::BranchGt,
        Opcode::BranchGe,
        Opcode::BranchNull,
        Opcode::BranchUndefined,
        Opcode::Throw,
        Opcode::Finally,
        Opcode::EndException,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Rem,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Ushr,
        Opcode::BitAnd,
        Opcode::BitOr,
        Opcode::BitXor,
        Opcode::Neg,
        Opcode::LogicalNot,
        Opcode::BitNot,
        Opcode::CompareEq,
        Opcode::CompareNe,
        Opcode::CompareStrictlyEq,
        Opcode::CompareStrictlyNe,
        Opcode::CompareLt,
        Opcode::CompareLe,
        Opcode::CompareGt,
        Opcode::CompareGe,
        Opcode::InstanceOf,
        Opcode::IsA,
        Opcode::In,
        Opcode::CastOp,
        Opcode::Like,
        Opcode::TypeOf,
        Opcode::DeleteScopedName,
        Opcode::DeleteObjName,
        Opcode::New,
        Opcode::NewObject,
        Opcode::NewArray,
        Opcode::Super,
        Opcode::OpenBlock,
        Opcode::CloseBlock,
        Opcode::OpenWith,
        Opcode::AddNamespace,
        Opcode::AddNamespaceRef,
        Opcode::DefineFunction,
        Opcode::DefineClass,
        Opcode::InitDefaultArgs,
        Opcode::InitDefaultArgs8,
    ];

    /// Convert a byte to an opcode. Returns `None` for undefined bytes.
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| *op as u8 == byte)
    }

    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Dedicated form for slot `k` of a slot family, when one exists.
    /// `base` is the `*Slot0` opcode of the family.
    pub fn slot_form(base: Opcode, slot: u32) -> Option<Opcode> {
        if slot < 10 {
            Opcode::from_u8(base as u8 + slot as u8)
        } else {
            None
        }
    }

    /// Operand layout following the opcode byte. `NewObject` and the
    /// `InitDefaultArgs` forms carry variable-length operand lists and are
    /// handled specially by the disassembler and verifier.
    pub fn operands(self) -> &'static [Operand] {
        use Operand::*;
        match self {
            Opcode::PopItems
            | Opcode::LoadInt
            | Opcode::LoadString
            | Opcode::LoadNamespace
            | Opcode::LoadRegExp
            | Opcode::LoadXml
            | Opcode::GetLocalSlot
            | Opcode::PutLocalSlot
            | Opcode::GetObjSlot
            | Opcode::PutObjSlot
            | Opcode::GetThisSlot
            | Opcode::PutThisSlot
            | Opcode::GetGlobalSlot
            | Opcode::PutGlobalSlot
            | Opcode::Call
            | Opcode::CallConstructor
            | Opcode::CallNextConstructor
            | Opcode::AddNamespace
            | Opcode::NewArray => &[Num],
            Opcode::LoadDouble => &[Double],
            Opcode::GetBlockSlot
            | Opcode::PutBlockSlot
            | Opcode::GetTypeSlot
            | Opcode::PutTypeSlot
            | Opcode::GetThisTypeSlot
            | Opcode::PutThisTypeSlot
            | Opcode::GetScopedName
            | Opcode::PutScopedName
            | Opcode::GetObjName
            | Opcode::PutObjName
            | Opcode::DeleteScopedName
            | Opcode::DeleteObjName
            | Opcode::CallObjSlot
            | Opcode::CallObjInstanceSlot
            | Opcode::CallObjStaticSlot
            | Opcode::CallThisSlot
            | Opcode::CallThisStaticSlot
            | Opcode::CallGlobalSlot
            | Opcode::OpenBlock
            | Opcode::DefineFunction
            | Opcode::DefineClass => &[Num, Num],
            Opcode::CallScopedName | Opcode::CallObjName | Opcode::CallBlockSlot | Opcode::Debug => {
                &[Num, Num, Num]
            }
            Opcode::Goto
            | Opcode::BranchTrue
            | Opcode::BranchFalse
            | Opcode::BranchEq
            | Opcode::BranchNe
            | Opcode::BranchStrictlyEq
            | Opcode::BranchStrictlyNe
            | Opcode::BranchLt
            | Opcode::BranchLe
            | Opcode::BranchGt
            | Opcode::BranchGe
            | Opcode::BranchNull
            | Opcode::BranchUndefined => &[Word],
            Opcode::Goto8 | Opcode::BranchTrue8 | Opcode::BranchFalse8 => &[Byte],
            _ => &[],
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Goto
                | Opcode::Goto8
                | Opcode::BranchTrue
                | Opcode::BranchTrue8
                | Opcode::BranchFalse
                | Opcode::BranchFalse8
                | Opcode::BranchEq
                | Opcode::BranchNe
                | Opcode::BranchStrictlyEq
                | Opcode::BranchStrictlyNe
                | Opcode::BranchLt
                | Opcode::BranchLe
                | Opcode::BranchGt
                | Opcode::BranchGe
                | Opcode::BranchNull
                | Opcode::BranchUndefined
        )
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallScopedName
                | Opcode::CallObjName
                | Opcode::CallObjSlot
                | Opcode::CallObjInstanceSlot
                | Opcode::CallObjStaticSlot
                | Opcode::CallThisSlot
                | Opcode::CallThisStaticSlot
                | Opcode::CallGlobalSlot
                | Opcode::CallBlockSlot
                | Opcode::CallConstructor
                | Opcode::CallNextConstructor
        )
    }

    pub fn is_return(self) -> bool {
        matches!(self, Opcode::Return | Opcode::ReturnValue)
    }

    pub fn is_terminator(self) -> bool {
        self.is_return() || matches!(self, Opcode::Goto | Opcode::Goto8 | Opcode::Throw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.to_u8()), Some(op), "roundtrip {:?}", op);
        }
    }

    #[test]
    fn test_no_duplicate_bytes() {
        let mut seen = [false; 256];
        for &op in Opcode::ALL {
            let b = op.to_u8() as usize;
            assert!(!seen[b], "duplicate byte {:#04x}", b);
            seen[b] = true;
        }
    }

    #[test]
    fn test_invalid_bytes() {
        assert_eq!(Opcode::from_u8(0x0F), None);
        assert_eq!(Opcode::from_u8(0x3F), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_slot_form() {
        assert_eq!(
            Opcode::slot_form(Opcode::GetLocalSlot0, 0),
            Some(Opcode::GetLocalSlot0)
        );
        assert_eq!(
            Opcode::slot_form(Opcode::GetLocalSlot0, 9),
            Some(Opcode::GetLocalSlot9)
        );
        assert_eq!(Opcode::slot_form(Opcode::GetLocalSlot0, 10), None);
        assert_eq!(
            Opcode::slot_form(Opcode::PutObjSlot0, 3),
            Some(Opcode::PutObjSlot3)
        );
    }

    #[test]
    fn test_branch_predicates() {
        assert!(Opcode::BranchFalse.is_branch());
        assert!(Opcode::Goto8.is_branch());
        assert!(!Opcode::Call.is_branch());
        assert!(Opcode::CallGlobalSlot.is_call());
        assert!(Opcode::ReturnValue.is_return());
        assert!(Opcode::Throw.is_terminator());
        assert!(!Opcode::BranchTrue.is_terminator());
    }

    #[test]
    fn test_operand_shapes() {
        assert_eq!(Opcode::LoadInt.operands(), &[Operand::Num]);
        assert_eq!(Opcode::Goto.operands(), &[Operand::Word]);
        assert_eq!(Opcode::Goto8.operands(), &[Operand::Byte]);
        assert_eq!(Opcode::LoadDouble.operands(), &[Operand::Double]);
        assert_eq!(
            Opcode::CallGlobalSlot.operands(),
            &[Operand::Num, Operand::Num]
        );
        assert!(Opcode::Add.operands().is_empty());
    }
}
