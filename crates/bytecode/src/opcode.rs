/// Opcodes across the supported bytecode versions.
///
/// Where an instruction changed encoding or meaning between compiler
/// versions, each form gets its own variant (`Eq` vs `Eq54`, `Jmp` vs
/// `Jmp52` vs `Jmp54`, and so on). The container/field decoder tags each
/// decoded instruction with the right variant for its version; nothing
/// downstream ever consults a raw opcode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// MOVE: A = B
    Move,
    /// LOADI: A = sBx (integer immediate)
    LoadI,
    /// LOADF: A = sBx (float immediate)
    LoadF,
    /// LOADK: A = constants[Bx]
    LoadK,
    /// LOADKX: A = constants[extra arg]
    LoadKx,
    /// LOADBOOL: A = (bool)B; if C, skip next instruction
    LoadBool,
    /// LOADFALSE: A = false
    LoadFalse,
    /// LFALSESKIP: A = false; skip next instruction
    LFalseSkip,
    /// LOADTRUE: A = true
    LoadTrue,
    /// LOADNIL: A..B = nil
    LoadNil,
    /// LOADNIL (5.2+ encoding): A..A+B = nil
    LoadNil52,
    /// GETGLOBAL: A = globals[constants[Bx]]
    GetGlobal,
    /// SETGLOBAL: globals[constants[Bx]] = A
    SetGlobal,
    /// GETUPVAL: A = upvalues[B]
    GetUpval,
    /// SETUPVAL: upvalues[B] = A
    SetUpval,
    /// GETTABUP: A = upvalues[B][RK(C)]
    GetTabUp,
    /// GETTABUP (5.4 encoding): A = upvalues[B][constants[C]]
    GetTabUp54,
    /// GETTABLE: A = B[RK(C)]
    GetTable,
    /// GETTABLE (5.4 encoding): A = B[C]
    GetTable54,
    /// GETI: A = B[C] (integer key)
    GetI,
    /// GETFIELD: A = B[constants[C]]
    GetField,
    /// SETTABUP: upvalues[A][RK(B)] = RK(C)
    SetTabUp,
    /// SETTABUP (5.4 encoding): upvalues[A][constants[B]] = RK(C)
    SetTabUp54,
    /// SETTABLE: A[RK(B)] = RK(C)
    SetTable,
    /// SETTABLE (5.4 encoding): A[B] = RK(C)
    SetTable54,
    /// SETI: A[B] = RK(C) (integer key)
    SetI,
    /// SETFIELD: A[constants[B]] = RK(C)
    SetField,
    /// NEWTABLE (5.0 encoding)
    NewTable50,
    /// NEWTABLE
    NewTable,
    /// NEWTABLE (5.4 encoding)
    NewTable54,
    /// SELF: A+1 = B; A = B[RK(C)]
    Self_,
    /// SELF (5.4 encoding)
    Self54,
    /// ADD: A = RK(B) + RK(C)
    Add,
    /// SUB: A = RK(B) - RK(C)
    Sub,
    /// MUL: A = RK(B) * RK(C)
    Mul,
    /// DIV: A = RK(B) / RK(C)
    Div,
    /// MOD: A = RK(B) % RK(C)
    Mod,
    /// POW: A = RK(B) ^ RK(C)
    Pow,
    /// IDIV: A = RK(B) // RK(C)
    IDiv,
    /// BAND: A = RK(B) & RK(C)
    BAnd,
    /// BOR: A = RK(B) | RK(C)
    BOr,
    /// BXOR: A = RK(B) ~ RK(C)
    BXor,
    /// SHL: A = RK(B) << RK(C)
    Shl,
    /// SHR: A = RK(B) >> RK(C)
    Shr,
    /// ADD (5.4 register-register encoding)
    Add54,
    /// SUB (5.4 register-register encoding)
    Sub54,
    /// MUL (5.4 register-register encoding)
    Mul54,
    /// DIV (5.4 register-register encoding)
    Div54,
    /// MOD (5.4 register-register encoding)
    Mod54,
    /// POW (5.4 register-register encoding)
    Pow54,
    /// IDIV (5.4 register-register encoding)
    IDiv54,
    /// BAND (5.4 register-register encoding)
    BAnd54,
    /// BOR (5.4 register-register encoding)
    BOr54,
    /// BXOR (5.4 register-register encoding)
    BXor54,
    /// SHL (5.4 register-register encoding)
    Shl54,
    /// SHR (5.4 register-register encoding)
    Shr54,
    /// ADDK: A = B + constants[C]
    AddK,
    /// SUBK: A = B - constants[C]
    SubK,
    /// MULK: A = B * constants[C]
    MulK,
    /// DIVK: A = B / constants[C]
    DivK,
    /// MODK: A = B % constants[C]
    ModK,
    /// POWK: A = B ^ constants[C]
    PowK,
    /// IDIVK: A = B // constants[C]
    IDivK,
    /// BANDK: A = B & constants[C]
    BAndK,
    /// BORK: A = B | constants[C]
    BOrK,
    /// BXORK: A = B ~ constants[C]
    BXorK,
    /// ADDI: A = B + sC
    AddI,
    /// SHLI: A = sC << B
    ShlI,
    /// SHRI: A = B >> sC
    ShrI,
    /// UNM: A = -B
    Unm,
    /// NOT: A = not B
    Not,
    /// LEN: A = #B
    Len,
    /// BNOT: A = ~B
    BNot,
    /// CONCAT: A = B .. .. C
    Concat,
    /// CONCAT (5.4 encoding): A = A .. .. A+B-1
    Concat54,
    /// MMBIN: metamethod continuation of the preceding arithmetic op
    MmBin,
    /// MMBINI: metamethod continuation (immediate operand)
    MmBinI,
    /// MMBINK: metamethod continuation (constant operand)
    MmBinK,
    /// JMP: pc += sBx
    Jmp,
    /// JMP (5.2/5.3 encoding): pc += sBx; if A != 0, close upvalues >= A-1
    Jmp52,
    /// JMP (5.4 encoding): pc += sJ
    Jmp54,
    /// EQ: if (RK(B) == RK(C)) != A then skip jump
    Eq,
    /// LT: if (RK(B) < RK(C)) != A then skip jump
    Lt,
    /// LE: if (RK(B) <= RK(C)) != A then skip jump
    Le,
    /// EQ (5.4 encoding): if (A == B) != k then skip jump
    Eq54,
    /// LT (5.4 encoding): if (A < B) != k then skip jump
    Lt54,
    /// LE (5.4 encoding): if (A <= B) != k then skip jump
    Le54,
    /// EQK: if (A == constants[B]) != k then skip jump
    EqK,
    /// EQI: if (A == sB) != k then skip jump
    EqI,
    /// LTI: if (A < sB) != k then skip jump
    LtI,
    /// LEI: if (A <= sB) != k then skip jump
    LeI,
    /// GTI: if (A > sB) != k then skip jump
    GtI,
    /// GEI: if (A >= sB) != k then skip jump
    GeI,
    /// TEST (5.0 encoding): if (bool)B != C then skip jump; A = B
    Test50,
    /// TEST: if (bool)A != C then skip jump
    Test,
    /// TEST (5.4 encoding): if (bool)A != k then skip jump
    Test54,
    /// TESTSET: if (bool)B != C then skip jump else A = B
    TestSet,
    /// TESTSET (5.4 encoding): if (bool)B != k then skip jump else A = B
    TestSet54,
    /// CALL: A, ..A+C-2 = A(A+1, ..A+B-1)
    Call,
    /// TAILCALL: return A(A+1, ..A+B-1)
    TailCall,
    /// TAILCALL (5.4 encoding)
    TailCall54,
    /// RETURN: return A, ..A+B-2
    Return,
    /// RETURN (5.4 encoding)
    Return54,
    /// RETURN0: return
    Return0,
    /// RETURN1: return A
    Return1,
    /// FORLOOP: numeric for back-edge
    ForLoop,
    /// FORLOOP (5.4 encoding)
    ForLoop54,
    /// FORPREP: numeric for setup, jumps to the FORLOOP
    ForPrep,
    /// FORPREP (5.4 encoding)
    ForPrep54,
    /// TFORPREP: generic for setup (5.0), jumps to the TFORLOOP
    TForPrep,
    /// TFORPREP (5.4 encoding)
    TForPrep54,
    /// TFORCALL: generic for iterator call (5.2/5.3)
    TForCall,
    /// TFORCALL (5.4 encoding)
    TForCall54,
    /// TFORLOOP: generic for back-edge (5.0/5.1)
    TForLoop,
    /// TFORLOOP (5.2/5.3 encoding)
    TForLoop52,
    /// TFORLOOP (5.4 encoding)
    TForLoop54,
    /// SETLIST (5.0 encoding)
    SetList50,
    /// SETLISTO (5.0 vararg table fill)
    SetListO,
    /// SETLIST
    SetList,
    /// SETLIST (5.2 encoding)
    SetList52,
    /// SETLIST (5.4 encoding)
    SetList54,
    /// CLOSE: close upvalues >= A
    Close,
    /// TBC: mark A as to-be-closed
    Tbc,
    /// CLOSURE: A = closure(protos[Bx])
    Closure,
    /// VARARG: A, ..A+B-2 = ...
    VarArg,
    /// VARARG (5.4 encoding): A, ..A+C-2 = ...
    VarArg54,
    /// VARARGPREP: adjust varargs (5.4)
    VarArgPrep,
    /// EXTRAARG: carries extra bits for the preceding instruction
    ExtraArg,
    /// EXTRABYTE: raw filler consumed by the preceding instruction
    ExtraByte,
}

impl Op {
    /// Whether this is a plain jump encoding. `Jmp52` counts even when it
    /// doubles as a close marker; use `Code::is_jmp` for the close-aware
    /// check.
    pub fn is_jump(self) -> bool {
        matches!(self, Op::Jmp | Op::Jmp52 | Op::Jmp54)
    }

    /// Whether this instruction's sBx field carries a jump offset.
    pub fn has_jump_target(self) -> bool {
        matches!(
            self,
            Op::Jmp
                | Op::Jmp52
                | Op::Jmp54
                | Op::ForLoop
                | Op::ForLoop54
                | Op::ForPrep
                | Op::ForPrep54
                | Op::TForPrep
                | Op::TForPrep54
                | Op::TForLoop
                | Op::TForLoop52
                | Op::TForLoop54
        )
    }

    /// Whether this is a comparison that pairs with a following jump.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Op::Eq
                | Op::Lt
                | Op::Le
                | Op::Eq54
                | Op::Lt54
                | Op::Le54
                | Op::EqK
                | Op::EqI
                | Op::LtI
                | Op::LeI
                | Op::GtI
                | Op::GeI
        )
    }

    /// Whether this is a test/testset that pairs with a following jump.
    pub fn is_test(self) -> bool {
        matches!(
            self,
            Op::Test50 | Op::Test | Op::Test54 | Op::TestSet | Op::TestSet54
        )
    }
}
