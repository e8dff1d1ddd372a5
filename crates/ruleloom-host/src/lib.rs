//! WebAssembly expansion host
//!
//! Loads expansion artifacts (core wasm modules, binary or text) from a
//! directory and installs them as rule types in a `ruleloom_engine`
//! registry. Each call into a guest runs under a fuel budget; traps are
//! logged and never reach the rule tree.

pub mod host;
pub mod reload;
pub mod scanner;
pub mod wasm;

pub use host::{create_host_from_config, ExpansionHost};
pub use reload::{setup_reload_signal, ReloadSignal};
pub use scanner::{ArtifactChanges, ExpansionScanner, DEFAULT_SCAN_INTERVAL};
pub use wasm::{create_engine, ExpansionKind, HostState, WasmExpansion, WasmExpansionSource};
