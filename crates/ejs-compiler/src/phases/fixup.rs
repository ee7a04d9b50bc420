//! Phase 3 — Fixup.
//!
//! Lays out every class: base types and implemented interfaces are
//! resolved by name, inherited instance slots are reserved ahead of the
//! local ones, `override` methods are stamped into the slot they replace,
//! unused constructor and static-initializer placeholders are removed,
//! and interface contracts are checked. Base/interface references form a
//! DAG; cycles are user errors caught with an in-progress flag.

use crate::graph::TypeId;
use crate::phases::define::STATIC_INITIALIZER;
use crate::Compiler;
use ejs_parser::ast::{Attributes, Loc, QName};

impl Compiler {
    pub(crate) fn phase_fixup(&mut self) {
        log::debug!("fixup: {} type(s)", self.graph.types.len());

        // Final slot numbering for all non-instance blocks: live properties
        // take consecutive slots, tombstones vanish.
        let instance_blocks: Vec<u32> = self.graph.types.iter().map(|t| t.instance).collect();
        for (bid, block) in self.graph.blocks.iter_mut().enumerate() {
            if instance_blocks.contains(&(bid as u32)) {
                continue;
            }
            let mut slot = 0;
            for prop in &mut block.properties {
                if prop.deleted {
                    continue;
                }
                prop.slot = slot;
                slot += 1;
            }
        }

        for tid in 0..self.graph.types.len() as TypeId {
            self.fixup_type(tid);
        }
    }

    pub(crate) fn fixup_type(&mut self, tid: TypeId) {
        if self.graph.type_def(tid).fixed {
            return;
        }
        if self.graph.type_def(tid).in_fixup {
            let qname = self.graph.type_def(tid).qname.clone();
            self.error(
                &Loc::default(),
                format!("circular inheritance involving '{}'", qname),
            );
            return;
        }
        self.graph.type_mut(tid).in_fixup = true;

        // Resolve and fix up the base first, so its layout is final.
        if let Some(base_name) = self.graph.type_def(tid).base_name.clone() {
            match self.graph.find_global_type(&base_name) {
                Some(base) if base != tid => {
                    self.fixup_type(base);
                    self.graph.type_mut(tid).base = Some(base);
                }
                _ => {
                    let qname = self.graph.type_def(tid).qname.clone();
                    self.error(
                        &Loc::default(),
                        format!("can not find base type '{}' of '{}'", base_name, qname),
                    );
                }
            }
        }
        for iface_name in self.graph.type_def(tid).interface_names.clone() {
            match self.graph.find_global_type(&iface_name) {
                Some(iface) if iface != tid => {
                    self.fixup_type(iface);
                    self.graph.type_mut(tid).interfaces.push(iface);
                }
                _ => {
                    let qname = self.graph.type_def(tid).qname.clone();
                    self.error(
                        &Loc::default(),
                        format!("can not find interface '{}' of '{}'", iface_name, qname),
                    );
                }
            }
        }

        self.remove_unused_placeholders(tid);
        self.layout_instance_slots(tid);
        self.verify_interfaces(tid);

        self.graph.type_mut(tid).in_fixup = false;
        self.graph.type_mut(tid).fixed = true;
    }

    /// Reserved constructor/static-initializer slots that stayed empty are
    /// removed so they do not occupy layout.
    fn remove_unused_placeholders(&mut self, tid: TypeId) {
        let t = self.graph.type_def(tid);
        let instance = t.instance;
        let statics = t.statics;
        let name = t.qname.name.clone();

        let base_has_ctor = {
            let mut current = t.base;
            let mut found = false;
            while let Some(b) = current {
                if self.graph.type_def(b).has_constructor {
                    found = true;
                    break;
                }
                current = self.graph.type_def(b).base;
            }
            found
        };

        let t = self.graph.type_def(tid);
        let needs_ctor = t.has_constructor || t.has_instance_initializers || base_has_ctor;
        if !needs_ctor {
            let ctor_name = QName::new(crate::graph::NS_CONSTRUCT, name);
            if let Some(index) = self.graph.find_exact(instance, &ctor_name) {
                self.graph.prop_mut(instance, index).deleted = true;
            }
        }

        if !self.graph.type_def(tid).has_static_initializers {
            let init_name = QName::new("", STATIC_INITIALIZER);
            if let Some(index) = self.graph.find_exact(statics, &init_name) {
                self.graph.prop_mut(statics, index).deleted = true;
            }
        }

        // Statics renumber after removal.
        let mut slot = 0;
        for prop in &mut self.graph.block_mut(statics).properties {
            if prop.deleted {
                continue;
            }
            prop.slot = slot;
            slot += 1;
        }
    }

    /// Inherited slots come first, in base declaration order; local
    /// properties follow. Overriding methods take the base slot they
    /// replace instead of a fresh one.
    fn layout_instance_slots(&mut self, tid: TypeId) {
        let base = self.graph.type_def(tid).base;
        let offset = base.map(|b| self.graph.instance_slot_count(b)).unwrap_or(0);
        self.graph.type_mut(tid).instance_slot_offset = offset;

        let instance = self.graph.type_def(tid).instance;
        let prop_count = self.graph.block(instance).properties.len();
        let mut next = offset;

        for index in 0..prop_count {
            let (deleted, qname, attrs) = {
                let p = self.graph.prop(instance, index);
                (p.deleted, p.qname.clone(), p.trait_.attributes)
            };
            if deleted {
                continue;
            }

            if attrs.contains(Attributes::OVERRIDE) {
                let inherited = base.and_then(|b| self.graph.find_instance_property(b, &qname));
                match inherited {
                    Some((owner, base_index, _)) => {
                        let base_block = self.graph.type_def(owner).instance;
                        let slot = {
                            let bp = self.graph.prop(base_block, base_index);
                            bp.override_slot.unwrap_or(bp.slot)
                        };
                        let p = self.graph.prop_mut(instance, index);
                        p.override_slot = Some(slot);
                        p.slot = slot;
                        continue;
                    }
                    None => {
                        let qn = self.graph.type_def(tid).qname.clone();
                        self.error(
                            &Loc::default(),
                            format!("'{}' marked override but '{}' has no base method '{}'",
                                qname.name, qn, qname.name),
                        );
                    }
                }
            }

            let p = self.graph.prop_mut(instance, index);
            p.slot = next;
            next += 1;
        }
    }

    /// Every function an implemented interface declares must exist in the
    /// implementing class's instance chain.
    fn verify_interfaces(&mut self, tid: TypeId) {
        let interfaces = self.graph.type_def(tid).interfaces.clone();
        for iface in interfaces {
            let iface_block = self.graph.type_def(iface).instance;
            let required: Vec<QName> = self
                .graph
                .block(iface_block)
                .live()
                .filter(|(_, p)| p.is_function() && !p.trait_.attributes.contains(Attributes::CONSTRUCTOR))
                .map(|(_, p)| p.qname.clone())
                .collect();

            for qname in required {
                let lookup_name = QName::new("", qname.name.clone());
                if self.graph.find_instance_property(tid, &lookup_name).is_none() {
                    let class_name = self.graph.type_def(tid).qname.clone();
                    let iface_name = self.graph.type_def(iface).qname.clone();
                    self.error(
                        &Loc::default(),
                        format!(
                            "class '{}' does not implement '{}' required by interface '{}'",
                            class_name, qname.name, iface_name
                        ),
                    );
                }
            }
        }
    }
}
