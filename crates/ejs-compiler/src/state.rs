//! Compile-state frames.
//!
//! A frame is pushed on entry to every processed node and popped on every
//! exit path. Pushing inherits the parent frame; nothing leaks upward on
//! pop. The same stack shape serves the semantic phases and the code
//! generator.

use crate::graph::{BlockId, FunId, TypeId};
use ejs_parser::ast::{ContainerRef, LangLevel, Mode, NodeId};

/// The context an expression's value is produced in. Replaces an ad-hoc
/// needs-value flag: statement expressions are `Discarded`, operands and
/// arguments are `Consumed`, and `return` bodies are `Returned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueUse {
    #[default]
    Consumed,
    Discarded,
    Returned,
}

impl ValueUse {
    pub fn needs_value(self) -> bool {
        !matches!(self, ValueUse::Discarded)
    }
}

/// One compile-state frame.
#[derive(Debug, Clone, Default)]
pub struct State {
    /// Index of the current module unit.
    pub module: Option<usize>,
    pub class: Option<TypeId>,
    pub fun: Option<FunId>,
    pub fun_node: Option<NodeId>,
    /// Innermost lexical block for `let` declarations.
    pub let_block: Option<BlockId>,
    pub let_block_node: Option<NodeId>,
    /// Nearest function/class/global container for `var` hoisting.
    pub var_block: Option<ContainerRef>,
    /// Let block elided because it needs no runtime object.
    pub optimized_let_block: Option<BlockId>,
    pub current_object_node: Option<NodeId>,
    /// Compiling the target of an assignment.
    pub on_left: bool,
    /// Generating instance-variable initializer code.
    pub instance_code: bool,
    pub in_class: bool,
    pub in_function: bool,
    pub in_method: bool,
    pub in_interface: bool,
    pub in_settings: bool,
    pub in_hash_expression: bool,
    /// Inside a subtree disabled by conditional compilation.
    pub disabled: bool,
    /// `for` header initializer: `in` is not an operator here.
    pub noin: bool,
    /// break/continue/return must run the pending finally first.
    pub capture_break: bool,
    pub namespace: String,
    pub default_namespace: Option<String>,
    pub mode: Mode,
    pub lang: LangLevel,
    pub block_nest_count: u32,
}

/// The frame stack.
#[derive(Debug, Default)]
pub struct StateStack {
    frames: Vec<State>,
}

impl StateStack {
    pub fn new() -> Self {
        Self {
            frames: vec![State::default()],
        }
    }

    /// Push a frame inheriting everything from the current one.
    pub fn push(&mut self) {
        let top = self.top().clone();
        self.frames.push(top);
    }

    pub fn pop(&mut self) {
        debug_assert!(self.frames.len() > 1, "popping the root state frame");
        self.frames.pop();
    }

    #[inline]
    pub fn top(&self) -> &State {
        self.frames.last().expect("state stack is never empty")
    }

    #[inline]
    pub fn top_mut(&mut self) -> &mut State {
        self.frames.last_mut().expect("state stack is never empty")
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Swap in a fresh root stack (re-entrant compilation) and return the
    /// saved one.
    pub fn save(&mut self) -> StateStack {
        std::mem::replace(self, StateStack::new())
    }

    pub fn restore(&mut self, saved: StateStack) {
        *self = saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_inherits() {
        let mut s = StateStack::new();
        s.top_mut().in_class = true;
        s.top_mut().namespace = "blue".to_string();
        s.push();
        assert!(s.top().in_class);
        assert_eq!(s.top().namespace, "blue");
    }

    #[test]
    fn test_pop_discards() {
        let mut s = StateStack::new();
        s.push();
        s.top_mut().in_function = true;
        s.pop();
        assert!(!s.top().in_function);
    }

    #[test]
    fn test_save_restore() {
        let mut s = StateStack::new();
        s.push();
        s.top_mut().disabled = true;
        let saved = s.save();
        assert_eq!(s.depth(), 1);
        assert!(!s.top().disabled);
        s.restore(saved);
        assert_eq!(s.depth(), 2);
        assert!(s.top().disabled);
    }

    #[test]
    fn test_value_use() {
        assert!(ValueUse::Consumed.needs_value());
        assert!(ValueUse::Returned.needs_value());
        assert!(!ValueUse::Discarded.needs_value());
    }
}
