//! Phase 5 — Erase.
//!
//! Global constants were stamped with their literal values so conditional
//! compilation could evaluate them. Those values must not be baked into
//! the emitted module (initializer code assigns them at run time), so the
//! transient ones are cleared here. Namespace-typed constants keep their
//! values; the module format stores those inline.

use crate::graph::Value;
use crate::Compiler;

impl Compiler {
    pub(crate) fn phase_erase(&mut self) {
        let global = self.graph.global;
        let mut erased = 0;
        for prop in &mut self.graph.block_mut(global).properties {
            if prop.transient && !matches!(prop.value, Value::Namespace(_)) {
                prop.value = Value::Empty;
                prop.transient = false;
                erased += 1;
            }
        }
        log::debug!("erase: cleared {} transient constant(s)", erased);
    }
}
