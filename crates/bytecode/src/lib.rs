//! Decoded bytecode model: the opcode set across supported compiler
//! versions, a 1-indexed instruction stream adapter, and the per-version
//! capability table the analyses branch on.

mod code;
mod function;
mod instruction;
mod opcode;
mod version;

pub use code::{Code, CloseType};
pub use function::{FuncInfo, UpvalueRef};
pub use instruction::Instr;
pub use opcode::Op;
pub use version::{CloseSemantics, VarArgType, Version, WhileFormat};
