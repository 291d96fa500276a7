//! [`Backend`] over LLVM's C API, compiled by MCJIT.
//!
//! Each compilation unit is its own LLVM module. Submitted modules are owned
//! by the execution engine until they are removed; native runtime functions
//! are bound to their declarations through global mappings when a unit is
//! submitted.

use super::{Backend, FloatOp, FloatPredicate};
use crate::error::{Error, ErrorKind};
use crate::runtime;
use libc::{c_char, c_void};
use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyFunction, LLVMVerifyModule};
use llvm_sys::execution_engine::{self, LLVMExecutionEngineRef};
use llvm_sys::prelude::*;
use llvm_sys::transforms::{instcombine, scalar, util};
use llvm_sys::{core, target, LLVMRealPredicate};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::ptr::null_mut;

fn c_string(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}

/// Takes ownership of an LLVM-allocated message.
unsafe fn take_message(message: *mut c_char) -> String {
    if message.is_null() {
        return String::new();
    }
    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(message);
    text
}

unsafe fn value_name(value: LLVMValueRef) -> String {
    CStr::from_ptr(core::LLVMGetValueName(value))
        .to_string_lossy()
        .into_owned()
}

/// Functions with a body, in module order.
unsafe fn defined_functions(module: LLVMModuleRef) -> Vec<LLVMValueRef> {
    let mut functions = Vec::new();
    let mut function = core::LLVMGetFirstFunction(module);
    while !function.is_null() {
        if core::LLVMCountBasicBlocks(function) > 0 {
            functions.push(function);
        }
        function = core::LLVMGetNextFunction(function);
    }
    functions
}

unsafe fn declared_functions(module: LLVMModuleRef) -> Vec<LLVMValueRef> {
    let mut functions = Vec::new();
    let mut function = core::LLVMGetFirstFunction(module);
    while !function.is_null() {
        if core::LLVMCountBasicBlocks(function) == 0 {
            functions.push(function);
        }
        function = core::LLVMGetNextFunction(function);
    }
    functions
}

pub struct LlvmBackend {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    fpm: LLVMPassManagerRef,
    engine: LLVMExecutionEngineRef,
    double_type: LLVMTypeRef,
    units: usize,
    mapped: HashSet<String>,
    // Symbols of removed units stay loaded in the engine, so a later body
    // reusing one of these names is emitted under a fresh name.
    retired: HashSet<String>,
    renamed: HashMap<(LLVMModuleRef, String), String>,
}

impl LlvmBackend {
    pub fn new() -> Result<Self, Error> {
        unsafe {
            execution_engine::LLVMLinkInMCJIT();
            if target::LLVM_InitializeNativeTarget() != 0
                || target::LLVM_InitializeNativeAsmPrinter() != 0
            {
                return Err(Error::from(ErrorKind::Execution(
                    "failed to initialize the native target".to_owned(),
                )));
            }

            let context = core::LLVMContextCreate();
            let name = c_string("kaleidoscope");
            let root = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), context);
            let mut engine = null_mut();
            let mut message = null_mut();
            if execution_engine::LLVMCreateExecutionEngineForModule(
                &mut engine,
                root,
                &mut message,
            ) != 0
            {
                let reason = take_message(message);
                core::LLVMDisposeModule(root);
                core::LLVMContextDispose(context);
                return Err(Error::from(ErrorKind::Execution(reason)));
            }

            let mut backend = LlvmBackend {
                context,
                module: null_mut(),
                builder: core::LLVMCreateBuilderInContext(context),
                fpm: null_mut(),
                engine,
                double_type: core::LLVMDoubleTypeInContext(context),
                units: 0,
                mapped: HashSet::new(),
                retired: HashSet::new(),
                renamed: HashMap::new(),
            };
            backend.open_unit();
            Ok(backend)
        }
    }

    unsafe fn open_unit(&mut self) {
        let name = c_string(&format!("unit{}", self.units));
        self.units += 1;
        self.module = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), self.context);
        target::LLVMSetModuleDataLayout(
            self.module,
            execution_engine::LLVMGetExecutionEngineTargetData(self.engine),
        );

        self.fpm = core::LLVMCreateFunctionPassManagerForModule(self.module);
        util::LLVMAddPromoteMemoryToRegisterPass(self.fpm);
        instcombine::LLVMAddInstructionCombiningPass(self.fpm);
        scalar::LLVMAddReassociatePass(self.fpm);
        scalar::LLVMAddGVNPass(self.fpm);
        scalar::LLVMAddCFGSimplificationPass(self.fpm);
        core::LLVMInitializeFunctionPassManager(self.fpm);
    }

    fn positioned(&self) -> Result<(), Error> {
        if unsafe { core::LLVMGetInsertBlock(self.builder) }.is_null() {
            return Err(Error::from(ErrorKind::NoInsertPoint));
        }
        Ok(())
    }

    /// Points the unit's bodiless declarations at the runtime library unless
    /// a live unit defines them, and drops mappings the unit's own bodies
    /// now shadow.
    unsafe fn bind_natives(&mut self, module: LLVMModuleRef) {
        for function in defined_functions(module) {
            let name = value_name(function);
            if self.mapped.remove(&name) {
                execution_engine::LLVMAddGlobalMapping(self.engine, function, null_mut());
                debug!("'{}' no longer mapped to the runtime library", name);
            }
        }
        for function in declared_functions(module) {
            let name = value_name(function);
            if self.mapped.contains(&name) || self.is_defined(&name) {
                continue;
            }
            if let Some(native) = runtime::lookup(&name) {
                execution_engine::LLVMAddGlobalMapping(
                    self.engine,
                    function,
                    native.address() as *mut c_void,
                );
                debug!("mapped '{}' to the runtime library", name);
                self.mapped.insert(name);
            }
        }
    }

    unsafe fn rename_retired(&mut self, module: LLVMModuleRef) {
        for function in defined_functions(module) {
            let name = value_name(function);
            if !self.retired.contains(&name) {
                continue;
            }
            let fresh = format!("{}.{}", name, self.units);
            let c_fresh = c_string(&fresh);
            core::LLVMSetValueName(function, c_fresh.as_ptr());
            debug!("emitting '{}' as '{}'", name, fresh);
            self.renamed.insert((module, name), fresh);
        }
    }

    #[cfg(test)]
    fn has_native_mapping(&self, name: &str) -> bool {
        self.mapped.contains(name)
    }
}

impl Drop for LlvmBackend {
    fn drop(&mut self) {
        unsafe {
            core::LLVMDisposePassManager(self.fpm);
            core::LLVMDisposeModule(self.module);
            core::LLVMDisposeBuilder(self.builder);
            // Disposes every module still owned by the engine.
            execution_engine::LLVMDisposeExecutionEngine(self.engine);
            core::LLVMContextDispose(self.context);
        }
    }
}

impl Backend for LlvmBackend {
    type Value = LLVMValueRef;
    type Block = LLVMBasicBlockRef;
    type Function = LLVMValueRef;
    type Unit = LLVMModuleRef;

    fn get_function(&self, name: &str) -> Option<LLVMValueRef> {
        let name = c_string(name);
        let function = unsafe { core::LLVMGetNamedFunction(self.module, name.as_ptr()) };
        if function.is_null() {
            None
        } else {
            Some(function)
        }
    }

    fn declare_function(&mut self, name: &str, params: &[String]) -> LLVMValueRef {
        unsafe {
            let mut param_types = vec![self.double_type; params.len()];
            let function_type = core::LLVMFunctionType(
                self.double_type,
                param_types.as_mut_ptr(),
                param_types.len() as u32,
                0,
            );
            let c_name = c_string(name);
            let function = core::LLVMAddFunction(self.module, c_name.as_ptr(), function_type);
            for (index, param) in params.iter().enumerate() {
                let c_param = c_string(param);
                core::LLVMSetValueName(core::LLVMGetParam(function, index as u32), c_param.as_ptr());
            }
            function
        }
    }

    fn param_count(&self, function: LLVMValueRef) -> usize {
        unsafe { core::LLVMCountParams(function) as usize }
    }

    fn param(&self, function: LLVMValueRef, index: usize) -> LLVMValueRef {
        unsafe { core::LLVMGetParam(function, index as u32) }
    }

    fn has_body(&self, function: LLVMValueRef) -> bool {
        unsafe { core::LLVMCountBasicBlocks(function) > 0 }
    }

    fn append_block(&mut self, function: LLVMValueRef, name: &str) -> LLVMBasicBlockRef {
        let name = c_string(name);
        unsafe { core::LLVMAppendBasicBlockInContext(self.context, function, name.as_ptr()) }
    }

    fn position_at_end(&mut self, block: LLVMBasicBlockRef) {
        unsafe { core::LLVMPositionBuilderAtEnd(self.builder, block) }
    }

    fn insert_block(&self) -> Option<LLVMBasicBlockRef> {
        let block = unsafe { core::LLVMGetInsertBlock(self.builder) };
        if block.is_null() {
            None
        } else {
            Some(block)
        }
    }

    fn const_number(&mut self, value: f64) -> LLVMValueRef {
        unsafe { core::LLVMConstReal(self.double_type, value) }
    }

    fn build_alloca(&mut self, function: LLVMValueRef, name: &str) -> Result<LLVMValueRef, Error> {
        if !self.has_body(function) {
            return Err(Error::from(ErrorKind::NoInsertPoint));
        }
        let name = c_string(name);
        unsafe {
            let entry = core::LLVMGetEntryBasicBlock(function);
            let tmp = core::LLVMCreateBuilderInContext(self.context);
            let first = core::LLVMGetFirstInstruction(entry);
            if first.is_null() {
                core::LLVMPositionBuilderAtEnd(tmp, entry);
            } else {
                core::LLVMPositionBuilderBefore(tmp, first);
            }
            let slot = core::LLVMBuildAlloca(tmp, self.double_type, name.as_ptr());
            core::LLVMDisposeBuilder(tmp);
            Ok(slot)
        }
    }

    fn build_load(&mut self, slot: LLVMValueRef, name: &str) -> Result<LLVMValueRef, Error> {
        self.positioned()?;
        let name = c_string(name);
        Ok(unsafe { core::LLVMBuildLoad(self.builder, slot, name.as_ptr()) })
    }

    fn build_store(&mut self, slot: LLVMValueRef, value: LLVMValueRef) -> Result<(), Error> {
        self.positioned()?;
        unsafe { core::LLVMBuildStore(self.builder, value, slot) };
        Ok(())
    }

    fn build_float_op(
        &mut self,
        op: FloatOp,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.positioned()?;
        let name = c_string(name);
        let build = match op {
            FloatOp::Add => core::LLVMBuildFAdd,
            FloatOp::Sub => core::LLVMBuildFSub,
            FloatOp::Mul => core::LLVMBuildFMul,
            FloatOp::Div => core::LLVMBuildFDiv,
        };
        Ok(unsafe { build(self.builder, lhs, rhs, name.as_ptr()) })
    }

    fn build_compare(
        &mut self,
        predicate: FloatPredicate,
        lhs: LLVMValueRef,
        rhs: LLVMValueRef,
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.positioned()?;
        let name = c_string(name);
        let predicate = match predicate {
            FloatPredicate::Ult => LLVMRealPredicate::LLVMRealULT,
            FloatPredicate::One => LLVMRealPredicate::LLVMRealONE,
        };
        Ok(unsafe { core::LLVMBuildFCmp(self.builder, predicate, lhs, rhs, name.as_ptr()) })
    }

    fn build_bool_to_number(
        &mut self,
        flag: LLVMValueRef,
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.positioned()?;
        let name = c_string(name);
        Ok(unsafe { core::LLVMBuildUIToFP(self.builder, flag, self.double_type, name.as_ptr()) })
    }

    fn build_br(&mut self, dest: LLVMBasicBlockRef) -> Result<(), Error> {
        self.positioned()?;
        unsafe { core::LLVMBuildBr(self.builder, dest) };
        Ok(())
    }

    fn build_cond_br(
        &mut self,
        cond: LLVMValueRef,
        then_block: LLVMBasicBlockRef,
        else_block: LLVMBasicBlockRef,
    ) -> Result<(), Error> {
        self.positioned()?;
        unsafe { core::LLVMBuildCondBr(self.builder, cond, then_block, else_block) };
        Ok(())
    }

    fn build_phi(
        &mut self,
        incoming: &[(LLVMValueRef, LLVMBasicBlockRef)],
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.positioned()?;
        let name = c_string(name);
        let (mut values, mut blocks): (Vec<_>, Vec<_>) = incoming.iter().cloned().unzip();
        unsafe {
            let phi = core::LLVMBuildPhi(self.builder, self.double_type, name.as_ptr());
            core::LLVMAddIncoming(
                phi,
                values.as_mut_ptr(),
                blocks.as_mut_ptr(),
                values.len() as u32,
            );
            Ok(phi)
        }
    }

    fn build_call(
        &mut self,
        callee: LLVMValueRef,
        args: &[LLVMValueRef],
        name: &str,
    ) -> Result<LLVMValueRef, Error> {
        self.positioned()?;
        let name = c_string(name);
        let mut args = args.to_vec();
        Ok(unsafe {
            core::LLVMBuildCall(
                self.builder,
                callee,
                args.as_mut_ptr(),
                args.len() as u32,
                name.as_ptr(),
            )
        })
    }

    fn build_ret(&mut self, value: LLVMValueRef) -> Result<(), Error> {
        self.positioned()?;
        unsafe { core::LLVMBuildRet(self.builder, value) };
        Ok(())
    }

    /// Verifies, then runs the unit's function passes over `function`.
    fn verify_function(&self, function: LLVMValueRef) -> Result<(), Error> {
        unsafe {
            if LLVMVerifyFunction(function, LLVMVerifierFailureAction::LLVMReturnStatusAction) != 0
            {
                let name = core::LLVMGetValueName(function);
                return Err(Error::from(ErrorKind::Verify {
                    name: CStr::from_ptr(name).to_string_lossy().into_owned(),
                    reason: "rejected by the LLVM verifier".to_owned(),
                }));
            }
            core::LLVMRunFunctionPassManager(self.fpm, function);
        }
        Ok(())
    }

    fn delete_function(&mut self, function: LLVMValueRef) {
        unsafe {
            let block = core::LLVMGetInsertBlock(self.builder);
            if !block.is_null() && core::LLVMGetBasicBlockParent(block) == function {
                core::LLVMClearInsertionPosition(self.builder);
            }
            core::LLVMDeleteFunction(function);
        }
    }

    fn print_function(&self, function: LLVMValueRef) -> String {
        unsafe { take_message(core::LLVMPrintValueToString(function)) }
    }

    fn is_defined(&self, name: &str) -> bool {
        let name = c_string(name);
        let mut function = null_mut();
        unsafe { execution_engine::LLVMFindFunction(self.engine, name.as_ptr(), &mut function) == 0 }
    }

    fn submit_unit(&mut self) -> Result<LLVMModuleRef, Error> {
        unsafe {
            core::LLVMClearInsertionPosition(self.builder);
            core::LLVMFinalizeFunctionPassManager(self.fpm);
            core::LLVMDisposePassManager(self.fpm);
            let module = self.module;
            self.open_unit();

            let mut message = null_mut();
            if LLVMVerifyModule(
                module,
                LLVMVerifierFailureAction::LLVMReturnStatusAction,
                &mut message,
            ) != 0
            {
                let reason = take_message(message);
                core::LLVMDisposeModule(module);
                return Err(Error::from(ErrorKind::Verify {
                    name: "<unit>".to_owned(),
                    reason,
                }));
            }
            take_message(message);

            self.bind_natives(module);
            self.rename_retired(module);
            execution_engine::LLVMAddModule(self.engine, module);
            debug!("added a unit to the execution engine");
            Ok(module)
        }
    }

    fn run_function(&mut self, unit: &LLVMModuleRef, name: &str) -> Result<f64, Error> {
        let emitted = self
            .renamed
            .get(&(*unit, name.to_owned()))
            .map_or(name, String::as_str);
        let c_name = c_string(emitted);
        unsafe {
            let function = core::LLVMGetNamedFunction(*unit, c_name.as_ptr());
            if function.is_null() || core::LLVMCountBasicBlocks(function) == 0 {
                return Err(Error::from(ErrorKind::UnresolvedSymbol(name.to_owned())));
            }
            let result = execution_engine::LLVMRunFunction(self.engine, function, 0, null_mut());
            let value = execution_engine::LLVMGenericValueToFloat(self.double_type, result);
            execution_engine::LLVMDisposeGenericValue(result);
            Ok(value)
        }
    }

    fn remove_unit(&mut self, unit: LLVMModuleRef) -> Result<(), Error> {
        let mut removed = null_mut();
        let mut message = null_mut();
        unsafe {
            if execution_engine::LLVMRemoveModule(self.engine, unit, &mut removed, &mut message) != 0
            {
                return Err(Error::from(ErrorKind::Execution(take_message(message))));
            }
            for function in defined_functions(removed) {
                self.retired.insert(value_name(function));
            }
            core::LLVMDisposeModule(removed);
        }
        self.renamed.retain(|(module, _), _| *module != unit);
        Ok(())
    }
}
