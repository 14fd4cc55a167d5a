//! The ordered instruction stream a function compiles into.

use crate::inst::Instruction;
use core::fmt;
use core::ops::{Index, IndexMut};

/// An ordered sequence of instructions with label bookkeeping. Rewrites
/// replace a window in place, so indices before the window stay valid.
#[derive(Clone, Debug, Default)]
pub struct InstructionStream {
    insts: Vec<Instruction>,
}

impl InstructionStream {
    pub fn new() -> InstructionStream {
        InstructionStream { insts: Vec::new() }
    }

    pub fn from_instructions(insts: Vec<Instruction>) -> InstructionStream {
        InstructionStream { insts }
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn push(&mut self, inst: Instruction) {
        self.insts.push(inst);
    }

    pub fn extend(&mut self, insts: impl IntoIterator<Item = Instruction>) {
        self.insts.extend(insts);
    }

    /// Append a label definition.
    pub fn define_label(&mut self, name: &str) {
        self.insts.push(Instruction::label_def(name));
    }

    /// Insert an instruction at `pos`, shifting the rest down.
    pub fn insert(&mut self, pos: usize, inst: Instruction) {
        self.insts.insert(pos, inst);
    }

    /// Replace the window `[pos, pos + count)` with `replacements`.
    pub fn replace(&mut self, pos: usize, count: usize, replacements: Vec<Instruction>) {
        self.insts.splice(pos..pos + count, replacements);
    }

    /// Index of the definition of `label`, if present.
    pub fn find_label(&self, label: &str) -> Option<usize> {
        self.insts.iter().position(|inst| {
            inst.is_label_definition && inst.target_label.as_deref() == Some(label)
        })
    }

    /// Rename every reference to (and definition of) `from` into `to`.
    pub fn rename_label(&mut self, from: &str, to: &str) {
        for inst in &mut self.insts {
            if inst.target_label.as_deref() == Some(from) {
                inst.assembly_text = inst.assembly_text.replace(from, to);
                inst.target_label = Some(to.to_string());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.insts.iter()
    }

    pub fn as_slice(&self) -> &[Instruction] {
        &self.insts
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<Instruction> {
        &mut self.insts
    }
}

impl Index<usize> for InstructionStream {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Instruction {
        &self.insts[index]
    }
}

impl IndexMut<usize> for InstructionStream {
    fn index_mut(&mut self, index: usize) -> &mut Instruction {
        &mut self.insts[index]
    }
}

impl fmt::Display for InstructionStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for inst in &self.insts {
            if inst.is_label_definition {
                writeln!(f, "{inst}")?;
            } else {
                writeln!(f, "    {inst}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::emit::{mov_reg, nop, ret};
    use crate::inst::regs::xreg;

    #[test]
    fn labels_and_replacement() {
        let mut stream = InstructionStream::new();
        stream.define_label("entry");
        stream.push(nop());
        stream.push(mov_reg(xreg(0), xreg(1)));
        stream.push(ret());

        assert_eq!(stream.find_label("entry"), Some(0));
        assert_eq!(stream.len(), 4);

        stream.replace(1, 2, vec![mov_reg(xreg(0), xreg(2))]);
        assert_eq!(stream.len(), 3);
        assert_eq!(stream[1].assembly_text, "mov x0, x2");
        // The label before the window is untouched.
        assert_eq!(stream.find_label("entry"), Some(0));
    }

    #[test]
    fn rename_label() {
        let mut stream = InstructionStream::new();
        stream.define_label("L1");
        stream.push(crate::inst::emit::b("L1"));
        stream.rename_label("L1", "L_exit");
        assert_eq!(stream.find_label("L_exit"), Some(0));
        assert_eq!(stream[1].target_label.as_deref(), Some("L_exit"));
    }
}
