pub(crate) mod bindings;
mod engine;
mod expansion;
mod loader;

pub use bindings::HostState;
pub use engine::create_engine;
pub use expansion::{ExpansionKind, WasmExpansion};
pub use loader::{is_artifact, WasmExpansionSource};
