//! The five-phase AST processor.
//!
//! Each phase runs to completion over all source trees before the next
//! begins: Define creates the VM object graph entities, Conditional
//! evaluates `#` expressions and hoists block vars, Fixup lays out class
//! inheritance, Bind resolves every reference to a Lookup record, and
//! Erase clears the transient constants stamped for conditional
//! evaluation.

pub mod bind;
pub mod conditional;
pub mod define;
pub mod erase;
pub mod fixup;

use crate::graph::{NS_INTERNAL, NS_PRIVATE, NS_PROTECTED, NS_PUBLIC};
use ejs_parser::ast::{Attributes, ContainerRef, QName};

/// One entry of the scope chain walked by name resolution.
#[derive(Debug, Clone, Copy)]
pub struct ScopeEntry {
    pub container: ContainerRef,
    /// Hidden entries are not counted by `nth_block`.
    pub hidden: bool,
    /// Dynamic scopes (`with`) force everything resolved past them to
    /// stay unbound.
    pub dynamic: bool,
}

impl ScopeEntry {
    pub fn new(container: ContainerRef) -> Self {
        Self {
            container,
            hidden: false,
            dynamic: false,
        }
    }
}

/// The namespace a declaration lands in, combining the parser-recorded
/// qualifier with the reserved-namespace attribute bits.
pub fn declared_space(qname: &QName, attrs: Attributes) -> String {
    if !qname.space.is_empty() {
        return qname.space.clone();
    }
    if attrs.contains(Attributes::PRIVATE) {
        NS_PRIVATE.to_string()
    } else if attrs.contains(Attributes::PROTECTED) {
        NS_PROTECTED.to_string()
    } else if attrs.contains(Attributes::INTERNAL) {
        NS_INTERNAL.to_string()
    } else if attrs.contains(Attributes::PUBLIC) {
        NS_PUBLIC.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_space_prefers_explicit() {
        let q = QName::new("blue", "x");
        assert_eq!(declared_space(&q, Attributes::PRIVATE), "blue");
    }

    #[test]
    fn test_declared_space_from_attributes() {
        let q = QName::new("", "x");
        assert_eq!(declared_space(&q, Attributes::PRIVATE), NS_PRIVATE);
        assert_eq!(declared_space(&q, Attributes::PROTECTED), NS_PROTECTED);
        assert_eq!(declared_space(&q, Attributes::empty()), "");
    }
}
