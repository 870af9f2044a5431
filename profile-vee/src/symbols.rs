//! Batch resolution of native (non-managed) frame addresses.
//!
//! The session collects every unresolved native address after detach
//! and submits one batch; whatever comes back is substituted into the
//! Native annotations. The batch is fallible as a whole: no partial
//! success is assumed from the backend.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("symbolization failed: {0}")]
    Backend(String),
    #[error("symbolizer returned {got} results for {want} addresses")]
    BatchMismatch { want: usize, got: usize },
}

/// Maps raw addresses in a target process to symbol names.
pub trait NativeSymbolResolver {
    /// Resolve a deduplicated batch of addresses. Addresses missing
    /// from the returned map stay in their raw-address form.
    fn resolve_batch(
        &self,
        pid: u32,
        addresses: &[u64],
    ) -> Result<HashMap<u64, String>, SymbolError>;
}

/// blazesym-backed resolver reading the live process's mappings.
#[cfg(target_os = "linux")]
pub struct BlazeResolver {
    symbolizer: blazesym::symbolize::Symbolizer,
}

#[cfg(target_os = "linux")]
impl BlazeResolver {
    pub fn new() -> Self {
        BlazeResolver {
            symbolizer: blazesym::symbolize::Symbolizer::new(),
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for BlazeResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl NativeSymbolResolver for BlazeResolver {
    fn resolve_batch(
        &self,
        pid: u32,
        addresses: &[u64],
    ) -> Result<HashMap<u64, String>, SymbolError> {
        use blazesym::symbolize::source::{Process, Source};
        use blazesym::symbolize::{Input, Symbolized};

        let src = Source::Process(Process::new(blazesym::Pid::from(pid)));
        let syms = self
            .symbolizer
            .symbolize(&src, Input::AbsAddr(addresses))
            .map_err(|err| SymbolError::Backend(err.to_string()))?;

        if syms.len() != addresses.len() {
            return Err(SymbolError::BatchMismatch {
                want: addresses.len(),
                got: syms.len(),
            });
        }

        let mut table = HashMap::new();
        for (addr, sym) in addresses.iter().zip(syms) {
            if let Symbolized::Sym(sym) = sym {
                table.insert(*addr, sym.name.to_string());
            }
        }
        Ok(table)
    }
}

/// Shells out to the system `atos` symbolicator.
#[cfg(target_os = "macos")]
pub struct AtosResolver;

#[cfg(target_os = "macos")]
impl NativeSymbolResolver for AtosResolver {
    fn resolve_batch(
        &self,
        pid: u32,
        addresses: &[u64],
    ) -> Result<HashMap<u64, String>, SymbolError> {
        let mut cmd = std::process::Command::new("atos");
        cmd.arg("-p").arg(pid.to_string());
        for addr in addresses {
            cmd.arg(format!("{:#x}", addr));
        }

        let output = cmd
            .output()
            .map_err(|err| SymbolError::Backend(format!("failed to spawn atos: {}", err)))?;
        if !output.status.success() {
            return Err(SymbolError::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let symbols: Vec<&str> = stdout.trim().lines().collect();
        if symbols.len() != addresses.len() {
            return Err(SymbolError::BatchMismatch {
                want: addresses.len(),
                got: symbols.len(),
            });
        }

        Ok(addresses
            .iter()
            .zip(symbols)
            .map(|(addr, sym)| (*addr, sym.to_string()))
            .collect())
    }
}

/// Resolver variant for the host platform.
#[cfg(target_os = "linux")]
pub type HostResolver = BlazeResolver;
#[cfg(target_os = "macos")]
pub type HostResolver = AtosResolver;

#[cfg(target_os = "linux")]
pub fn host_resolver() -> HostResolver {
    BlazeResolver::new()
}
#[cfg(target_os = "macos")]
pub fn host_resolver() -> HostResolver {
    AtosResolver
}
