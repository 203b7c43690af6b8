//! Call-convention adaptation for symbols fetched from loaded modules.
//!
//! Every address handed to compiled code by the module loader passes through
//! the installed [`CallAdapter`]. The default is the identity.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use super::SymbolAddr;
use crate::x64::StubError;

/// Wraps a module symbol so compiled code can call it.
pub trait CallAdapter: Send + Sync {
    fn wrap(&self, module: &str, address: SymbolAddr) -> Result<SymbolAddr, StubError>;
}

/// Identity adapter for modules built with the host convention.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCallAdapter;

impl CallAdapter for NativeCallAdapter {
    fn wrap(&self, _module: &str, address: SymbolAddr) -> Result<SymbolAddr, StubError> {
        Ok(address)
    }
}

static ADAPTER: Lazy<RwLock<Arc<dyn CallAdapter>>> =
    Lazy::new(|| RwLock::new(Arc::new(NativeCallAdapter)));

/// Replace the process-wide adapter, returning the previous one.
pub fn install_call_adapter(adapter: Arc<dyn CallAdapter>) -> Arc<dyn CallAdapter> {
    std::mem::replace(&mut *ADAPTER.write(), adapter)
}

pub fn call_adapter() -> Arc<dyn CallAdapter> {
    ADAPTER.read().clone()
}

/// Wrap `address` with the installed adapter.
pub fn wrap_symbol(module: &str, address: SymbolAddr) -> Result<SymbolAddr, StubError> {
    call_adapter().wrap(module, address)
}
