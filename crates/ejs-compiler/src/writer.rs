//! Binary module serialization.
//!
//! Sections are written in the order: header; then per module the Module
//! section (name, version, reserved checksum slot, constant pool),
//! dependencies, the initializer function, and the global properties in
//! declaration order — classes transitively so bases and interfaces
//! precede their users — and a ModuleEnd tag. The additive checksum is
//! accumulated while sections are emitted and patched into the reserved
//! slot at module end. The pool is locked once its section is written;
//! any late addition is a fatal error.

use crate::error::{CompileError, CompileResult};
use crate::graph::{FunId, Property, TypeId, Value};
use crate::Compiler;
use ejs_bytecode::{
    BytecodeWriter, Checksum, GlobalRef, SectionTag, FILE_VERSION, FLAG_EMPTY_INTERP, MAGIC,
};

impl Compiler {
    /// Serialize all modules into one output image.
    pub fn write_modules(&mut self) -> CompileResult<Vec<u8>> {
        let mut w = BytecodeWriter::new();
        w.emit_u32(MAGIC);
        w.emit_u32(FILE_VERSION);
        w.emit_u32(if self.options.empty {
            FLAG_EMPTY_INTERP
        } else {
            0
        });

        for index in 0..self.modules.len() {
            self.write_module(&mut w, index)?;
        }
        Ok(w.into_bytes())
    }

    fn write_module(&mut self, w: &mut BytecodeWriter, index: usize) -> CompileResult<()> {
        self.intern_module_names(index)?;

        let mut sum = Checksum::new();
        let (name, version) = {
            let m = &self.modules[index];
            (m.name.clone(), m.version)
        };

        w.emit_u8(SectionTag::Module as u8);
        w.emit_cstring(&name);
        w.emit_num(version as i64);
        sum.add_name(&name);
        sum.add_num(version as i64);

        let checksum_at = w.offset();
        w.emit_u32(0); // patched below

        {
            let pool = &mut self.modules[index].pool;
            w.emit_num(pool.len() as i64);
            w.emit_bytes(pool.bytes());
            pool.lock();
        }

        // Dependencies are omitted when merging aggregates them into the
        // output.
        if !self.options.merge {
            let deps = self.modules[index].dependencies.clone();
            for dep in deps {
                if dep.name == name {
                    continue;
                }
                let name_off = self.pool_offset(index, &dep.name)?;
                w.emit_u8(SectionTag::Dependency as u8);
                w.emit_num(name_off as i64);
                w.emit_num(dep.checksum as i64);
                w.emit_num(dep.min_version as i64);
                w.emit_num(dep.max_version as i64);
                sum.add_name(&dep.name);
            }
        }

        if let Some(fid) = self.modules[index].initializer {
            self.write_function(w, index, fid, -1, &mut sum)?;
        }

        let globals: Vec<(usize, Property)> = self
            .graph
            .block(self.graph.global)
            .live()
            .map(|(i, p)| (i, p.clone()))
            .collect();
        for (_, prop) in globals {
            if prop.module.as_deref() != Some(&name) {
                continue;
            }
            self.write_global_property(w, index, &prop, &mut sum)?;
        }

        w.emit_u8(SectionTag::ModuleEnd as u8);
        w.patch_u32(checksum_at, sum.value());
        self.modules[index].checksum = sum.value();
        Ok(())
    }

    fn write_global_property(
        &mut self,
        w: &mut BytecodeWriter,
        index: usize,
        prop: &Property,
        sum: &mut Checksum,
    ) -> CompileResult<()> {
        match prop.value {
            Value::Type(tid) => self.write_class(w, index, tid, sum),
            Value::Function(fid) => {
                self.write_function(w, index, fid, prop.slot as i64, sum)
            }
            _ => self.write_property(w, index, prop, sum),
        }
    }

    /// Emit a class section, transitively emitting its base and
    /// interfaces first. The `written` flag doubles as the cycle guard.
    fn write_class(
        &mut self,
        w: &mut BytecodeWriter,
        index: usize,
        tid: TypeId,
        sum: &mut Checksum,
    ) -> CompileResult<()> {
        if self.graph.type_def(tid).written || self.graph.type_def(tid).builtin {
            return Ok(());
        }
        self.graph.type_mut(tid).written = true;

        let (base, interfaces) = {
            let t = self.graph.type_def(tid);
            (t.base, t.interfaces.clone())
        };
        if let Some(base) = base {
            self.write_class(w, index, base, sum)?;
        }
        for iface in &interfaces {
            self.write_class(w, index, *iface, sum)?;
        }

        let t = self.graph.type_def(tid).clone();
        let slot = self
            .graph
            .find_exact(self.graph.global, &t.qname)
            .map(|i| self.graph.prop(self.graph.global, i).slot as i64)
            .unwrap_or(-1);

        if let Some(doc) = &t.doc {
            self.write_doc(w, index, doc)?;
        }

        w.emit_u8(SectionTag::Class as u8);
        let name_off = self.pool_offset(index, &t.qname.name)?;
        let space_off = self.pool_offset(index, &t.qname.space)?;
        w.emit_num(name_off as i64);
        w.emit_num(space_off as i64);
        w.emit_num(t.attributes.bits() as i64);
        w.emit_num(slot);
        self.type_global_ref(base).encode(w);

        let num_statics = self.graph.block(t.statics).live_count();
        let num_instance = self.graph.instance_slot_count(tid);
        w.emit_num(num_statics as i64);
        w.emit_num(num_instance as i64);
        w.emit_num(interfaces.len() as i64);
        for iface in &interfaces {
            self.type_global_ref(Some(*iface)).encode(w);
        }

        sum.add_name(&t.qname.name);
        sum.add_num(slot);

        let statics: Vec<Property> = self
            .graph
            .block(t.statics)
            .live()
            .map(|(_, p)| p.clone())
            .collect();
        for prop in statics {
            self.write_trait(w, index, &prop, sum)?;
        }

        // Inherited, non-overridden slots are not re-emitted; the local
        // instance block holds exactly the rest.
        let instance: Vec<Property> = self
            .graph
            .block(t.instance)
            .live()
            .map(|(_, p)| p.clone())
            .collect();
        for prop in instance {
            self.write_trait(w, index, &prop, sum)?;
        }

        w.emit_u8(SectionTag::ClassEnd as u8);
        Ok(())
    }

    fn write_trait(
        &mut self,
        w: &mut BytecodeWriter,
        index: usize,
        prop: &Property,
        sum: &mut Checksum,
    ) -> CompileResult<()> {
        match prop.value {
            Value::Function(fid) => self.write_function(w, index, fid, prop.slot as i64, sum),
            _ => self.write_property(w, index, prop, sum),
        }
    }

    fn write_function(
        &mut self,
        w: &mut BytecodeWriter,
        index: usize,
        fid: FunId,
        slot: i64,
        sum: &mut Checksum,
    ) -> CompileResult<()> {
        let f = self.graph.fun(fid).clone();
        if let Some(doc) = &f.doc {
            self.write_doc(w, index, doc)?;
        }

        let num_locals = self.graph.block(f.activation).live_count();
        let result_ref = self.type_global_ref(f.result_type);

        w.emit_u8(SectionTag::Function as u8);
        let name_off = self.pool_offset(index, &f.qname.name)?;
        let space_off = self.pool_offset(index, &f.qname.space)?;
        w.emit_num(name_off as i64);
        w.emit_num(space_off as i64);
        w.emit_num(f.next_slot as i64);
        w.emit_num(f.attributes.bits() as i64);
        w.emit_num(f.lang as i64);
        result_ref.encode(w);
        w.emit_num(slot);
        w.emit_num(f.num_args as i64);
        w.emit_num(num_locals as i64);

        let (code, exceptions) = match &f.code {
            Some(code) => (code.bytes.clone(), code.exceptions.clone()),
            None => (Vec::new(), Vec::new()),
        };
        w.emit_num(exceptions.len() as i64);
        w.emit_num(code.len() as i64);
        w.emit_bytes(&code);

        if !exceptions.is_empty() {
            w.emit_u8(SectionTag::Exception as u8);
            for e in &exceptions {
                w.emit_num(e.flags as i64);
                w.emit_num(e.try_start as i64);
                w.emit_num(e.try_end as i64);
                w.emit_num(e.handler_start as i64);
                w.emit_num(e.handler_end as i64);
                w.emit_num(e.num_blocks as i64);
                w.emit_num(e.num_stack as i64);
                e.catch_type.encode(w);
            }
        }

        sum.add_name(&f.qname.name);
        sum.add_num(slot);
        sum.add_num(f.num_args as i64);

        // Parameter and local subsections.
        let locals: Vec<Property> = self
            .graph
            .block(f.activation)
            .live()
            .map(|(_, p)| p.clone())
            .collect();
        for prop in locals {
            self.write_property(w, index, &prop, sum)?;
        }

        w.emit_u8(SectionTag::FunctionEnd as u8);
        Ok(())
    }

    fn write_property(
        &mut self,
        w: &mut BytecodeWriter,
        index: usize,
        prop: &Property,
        sum: &mut Checksum,
    ) -> CompileResult<()> {
        if let Some(doc) = &prop.doc {
            self.write_doc(w, index, doc)?;
        }

        w.emit_u8(SectionTag::Property as u8);
        let name_off = self.pool_offset(index, &prop.qname.name)?;
        let space_off = self.pool_offset(index, &prop.qname.space)?;
        w.emit_num(name_off as i64);
        w.emit_num(space_off as i64);
        w.emit_num(prop.trait_.attributes.bits() as i64);
        w.emit_num(prop.slot as i64);
        self.type_global_ref(prop.trait_.ty).encode(w);

        // Values are emitted only for namespace-typed constants.
        match &prop.value {
            Value::Namespace(uri) => {
                w.emit_u8(1);
                let uri_off = self.pool_offset(index, uri)?;
                w.emit_num(uri_off as i64);
            }
            _ => w.emit_u8(0),
        }

        sum.add_name(&prop.qname.name);
        sum.add_num(prop.slot as i64);
        Ok(())
    }

    fn write_doc(
        &mut self,
        w: &mut BytecodeWriter,
        index: usize,
        doc: &str,
    ) -> CompileResult<()> {
        w.emit_u8(SectionTag::Doc as u8);
        let off = self.pool_offset(index, doc)?;
        w.emit_num(off as i64);
        Ok(())
    }

    /// Global reference to a type by id: the global slot holding it.
    fn type_global_ref(&self, tid: Option<TypeId>) -> GlobalRef {
        match tid {
            None => GlobalRef::None,
            Some(tid) => {
                let qname = &self.graph.type_def(tid).qname;
                match self.graph.find_exact(self.graph.global, qname) {
                    Some(index) => GlobalRef::Slot(self.graph.prop(self.graph.global, index).slot),
                    None => GlobalRef::None,
                }
            }
        }
    }

    /// Pool offset of an already-interned string. Adding to a locked pool
    /// is the fatal "try another module name" condition.
    fn pool_offset(&mut self, index: usize, s: &str) -> CompileResult<u32> {
        self.modules[index].pool.add(s).map_err(|e| {
            self.status.fatal = true;
            CompileError::from(e)
        })
    }

    /// Pre-intern every string the module's sections will reference, so
    /// the pool region is complete before it is written and locked.
    fn intern_module_names(&mut self, index: usize) -> CompileResult<()> {
        let name = self.modules[index].name.clone();
        let mut strings: Vec<String> = Vec::new();

        for dep in &self.modules[index].dependencies {
            strings.push(dep.name.clone());
        }

        let mut funcs: Vec<FunId> = Vec::new();
        if let Some(fid) = self.modules[index].initializer {
            funcs.push(fid);
        }

        let mut types: Vec<TypeId> = Vec::new();
        for (_, prop) in self.graph.block(self.graph.global).live() {
            if prop.module.as_deref() != Some(&name) {
                continue;
            }
            collect_property_strings(prop, &mut strings);
            match prop.value {
                Value::Type(tid) => types.push(tid),
                Value::Function(fid) => funcs.push(fid),
                _ => {}
            }
        }

        let mut seen = Vec::new();
        while let Some(tid) = types.pop() {
            if seen.contains(&tid) || self.graph.type_def(tid).builtin {
                continue;
            }
            seen.push(tid);
            let t = self.graph.type_def(tid);
            strings.push(t.qname.name.clone());
            strings.push(t.qname.space.clone());
            if let Some(doc) = &t.doc {
                strings.push(doc.clone());
            }
            if let Some(base) = t.base {
                types.push(base);
            }
            for iface in &t.interfaces {
                types.push(*iface);
            }
            for block in [t.statics, t.instance] {
                for (_, prop) in self.graph.block(block).live() {
                    collect_property_strings(prop, &mut strings);
                    if let Value::Function(fid) = prop.value {
                        funcs.push(fid);
                    }
                }
            }
        }

        for fid in funcs {
            let f = self.graph.fun(fid);
            strings.push(f.qname.name.clone());
            strings.push(f.qname.space.clone());
            if let Some(doc) = &f.doc {
                strings.push(doc.clone());
            }
            for (_, prop) in self.graph.block(f.activation).live() {
                collect_property_strings(prop, &mut strings);
            }
        }

        let pool = &mut self.modules[index].pool;
        for s in strings {
            if pool.add(&s).is_err() {
                self.status.fatal = true;
                return Err(CompileError::fatal(
                    "constant pool is locked; try another module name",
                ));
            }
        }
        Ok(())
    }
}

fn collect_property_strings(prop: &Property, strings: &mut Vec<String>) {
    strings.push(prop.qname.name.clone());
    strings.push(prop.qname.space.clone());
    if let Some(doc) = &prop.doc {
        strings.push(doc.clone());
    }
    if let Value::Namespace(uri) = &prop.value {
        strings.push(uri.clone());
    }
}
