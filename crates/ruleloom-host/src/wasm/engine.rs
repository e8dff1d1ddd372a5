use anyhow::{Context, Result};
use wasmtime::{Config, Engine};

/// Create a Wasmtime engine for expansion artifacts.
///
/// Fuel metering is always on so every call into a guest can be bounded.
pub fn create_engine() -> Result<Engine> {
    let mut config = Config::new();

    config.consume_fuel(true);
    config.async_support(false);

    #[cfg(not(debug_assertions))]
    {
        config.cranelift_opt_level(wasmtime::OptLevel::Speed);
    }

    Engine::new(&config).context("Failed to create Wasmtime engine")
}
