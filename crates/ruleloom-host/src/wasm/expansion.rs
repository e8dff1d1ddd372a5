use anyhow::Context as _;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};
use wasmtime::{
    Engine, Instance, Linker, Memory, Module, Store, Trap, TypedFunc, WasmParams, WasmResults,
};

use ruleloom_engine::{
    ActionBody, CompileError, Compiler, Context, ExpansionDescriptor, ExpansionError, Factory, Node,
    RequirementBody, Subject, TextExpr,
};

use super::bindings::HostState;

/// What a guest module contributes to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionKind {
    Action,
    Requirement,
}

impl ExpansionKind {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExpansionKind::Action),
            1 => Some(ExpansionKind::Requirement),
            _ => None,
        }
    }
}

enum Entry {
    Run(TypedFunc<(i32, i32), ()>),
    Check(TypedFunc<(i32, i32), i32>),
}

/// Everything that needs the store, guarded by one lock
struct Guest<T: Subject> {
    store: Store<HostState<T>>,
    memory: Memory,
    alloc: Option<TypedFunc<i32, i32>>,
    validate: Option<TypedFunc<(i32, i32), i32>>,
    entry: Entry,
}

impl<T: Subject> Guest<T> {
    /// Copy `payload` into guest memory through `alloc`.
    /// Without an allocator the guest sees `(0, 0)`.
    fn write_payload(&mut self, payload: &str) -> anyhow::Result<(i32, i32)> {
        let Some(alloc) = &self.alloc else {
            return Ok((0, 0));
        };
        if payload.is_empty() {
            return Ok((0, 0));
        }

        let len = i32::try_from(payload.len()).context("payload does not fit in guest memory")?;
        let ptr = alloc.call(&mut self.store, len).context("alloc trapped")?;
        self.memory
            .write(&mut self.store, ptr as u32 as usize, payload.as_bytes())
            .context("alloc returned a pointer outside of memory")?;
        Ok((ptr, len))
    }
}

/// A loaded expansion module
pub struct WasmExpansion<T: Subject> {
    type_key: String,
    version: String,
    author: String,
    kind: ExpansionKind,
    fuel_per_call: u64,
    guest: Mutex<Guest<T>>,
}

impl<T: Subject> fmt::Debug for WasmExpansion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmExpansion")
            .field("type_key", &self.type_key)
            .field("version", &self.version)
            .field("author", &self.author)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T: Subject> WasmExpansion<T> {
    /// Load a `.wasm` binary or `.wat` text module
    pub fn from_file(
        engine: &Engine,
        linker: &Linker<HostState<T>>,
        path: &Path,
        fuel_per_call: u64,
    ) -> Result<Self, ExpansionError> {
        let module = Module::from_file(engine, path)
            .map_err(|e| ExpansionError::Incompatible(format!("{:#}", e)))?;
        Self::from_module(engine, linker, &module, fuel_per_call)
    }

    pub fn from_module(
        engine: &Engine,
        linker: &Linker<HostState<T>>,
        module: &Module,
        fuel_per_call: u64,
    ) -> Result<Self, ExpansionError> {
        let mut store = Store::new(engine, HostState::new(String::new()));
        store
            .set_fuel(fuel_per_call)
            .map_err(|e| ExpansionError::Instantiate(format!("{:#}", e)))?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| ExpansionError::Instantiate(format!("{:#}", e)))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| ExpansionError::MissingExport("memory".to_string()))?;

        let type_key = read_metadata(&mut store, &instance, &memory, "expansion_type_key")?;
        if type_key.trim().is_empty() {
            return Err(ExpansionError::InvalidMetadata("type key is empty".to_string()));
        }
        let version = read_metadata(&mut store, &instance, &memory, "expansion_version")?;
        let author = read_metadata(&mut store, &instance, &memory, "expansion_author")?;
        store.data_mut().type_key = type_key.clone();

        let kind = match optional_func::<(), i32, T>(&mut store, &instance, "expansion_kind")? {
            Some(func) => {
                let code = func.call(&mut store, ()).map_err(|e| {
                    ExpansionError::InvalidMetadata(format!("expansion_kind: {:#}", e))
                })?;
                ExpansionKind::from_code(code).ok_or_else(|| {
                    ExpansionError::Incompatible(format!("unknown expansion kind {}", code))
                })?
            }
            None => ExpansionKind::Action,
        };

        let entry = match kind {
            ExpansionKind::Action => Entry::Run(required_func(&mut store, &instance, "run")?),
            ExpansionKind::Requirement => {
                Entry::Check(required_func(&mut store, &instance, "check")?)
            }
        };
        let alloc = optional_func(&mut store, &instance, "alloc")?;
        let validate = optional_func(&mut store, &instance, "validate")?;

        debug!(
            target: "expansions",
            "Loaded {:?} expansion '{}' v{} by {}",
            kind,
            type_key,
            version,
            author
        );

        Ok(Self {
            type_key,
            version,
            author,
            kind,
            fuel_per_call,
            guest: Mutex::new(Guest {
                store,
                memory,
                alloc,
                validate,
                entry,
            }),
        })
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn kind(&self) -> ExpansionKind {
        self.kind
    }

    /// Ask the guest whether it accepts a serialized value.
    /// Modules without a `validate` export accept everything.
    pub fn validate(&self, payload: &str) -> Result<(), String> {
        let code = self.call(None, payload, |guest, ptr, len| match &guest.validate {
            Some(validate) => validate.call(&mut guest.store, (ptr, len)),
            None => Ok(0),
        });
        match code {
            Ok(0) => Ok(()),
            Ok(code) => Err(format!("value rejected with code {}", code)),
            Err(e) => Err(format!("validate failed: {:#}", e)),
        }
    }

    /// Run an action expansion. Traps are logged and have no effect.
    pub fn run(&self, ctx: &Context<T>, payload: &str) {
        let result = self.call(Some(ctx), payload, |guest, ptr, len| match &guest.entry {
            Entry::Run(run) => run.call(&mut guest.store, (ptr, len)),
            Entry::Check(_) => Ok(()),
        });
        if let Err(e) = result {
            self.report(e);
        }
    }

    /// Evaluate a requirement expansion. Traps are logged and count as unmet.
    pub fn check(&self, ctx: &Context<T>, payload: &str) -> bool {
        let result = self.call(Some(ctx), payload, |guest, ptr, len| match &guest.entry {
            Entry::Check(check) => check.call(&mut guest.store, (ptr, len)),
            Entry::Run(_) => Ok(0),
        });
        match result {
            Ok(satisfied) => satisfied != 0,
            Err(e) => {
                self.report(e);
                false
            }
        }
    }

    /// One bounded call into the guest with `ctx` visible to host imports
    fn call<R>(
        &self,
        ctx: Option<&Context<T>>,
        payload: &str,
        f: impl FnOnce(&mut Guest<T>, i32, i32) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut guard = self.guest.lock().unwrap_or_else(PoisonError::into_inner);
        let guest = &mut *guard;

        guest.store.set_fuel(self.fuel_per_call)?;
        guest.store.data_mut().ctx = ctx.cloned();
        let result = guest
            .write_payload(payload)
            .and_then(|(ptr, len)| f(guest, ptr, len));
        guest.store.data_mut().ctx = None;

        result
    }

    fn report(&self, e: anyhow::Error) {
        if matches!(e.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
            warn!(
                target: "expansions",
                "Expansion '{}' ran out of fuel ({} units)",
                self.type_key,
                self.fuel_per_call
            );
        } else {
            warn!(target: "expansions", "Expansion '{}' trapped: {:#}", self.type_key, e);
        }
    }

    /// Wrap the module into a registry factory for its type key
    pub fn into_descriptor(self) -> ExpansionDescriptor<T> {
        let type_key = self.type_key.clone();
        let version = self.version.clone();
        let author = self.author.clone();
        let expansion = Arc::new(self);

        let factory = match expansion.kind {
            ExpansionKind::Action => Factory::action(move |_: &Compiler<T>, value: &Node| {
                let payload = Payload::compile(&expansion, value)?;
                Ok(Arc::new(WasmAction {
                    expansion: expansion.clone(),
                    payload,
                }) as Arc<dyn ActionBody<T>>)
            }),
            ExpansionKind::Requirement => {
                Factory::requirement(move |_: &Compiler<T>, value: &Node, _| {
                    let payload = Payload::compile(&expansion, value)?;
                    Ok(Arc::new(WasmRequirement {
                        expansion: expansion.clone(),
                        payload,
                    }) as Arc<dyn RequirementBody<T>>)
                })
            }
        };

        ExpansionDescriptor {
            type_key,
            version,
            author,
            factory,
        }
    }
}

/// The value handed to the guest on every call
enum Payload {
    Text(TextExpr),
    Json(String),
}

impl Payload {
    fn compile<T: Subject>(
        expansion: &WasmExpansion<T>,
        value: &Node,
    ) -> Result<Self, CompileError> {
        let payload = match value.as_str() {
            Some(template) => Payload::Text(TextExpr::compile(template)?),
            None => Payload::Json(value.to_json()),
        };

        let serialized = match &payload {
            Payload::Text(text) => text.source(),
            Payload::Json(json) => json.as_str(),
        };
        expansion.validate(serialized).map_err(CompileError::Rejected)?;

        Ok(payload)
    }

    fn render<T: Subject>(&self, ctx: &Context<T>) -> String {
        match self {
            Payload::Text(text) => text.render(ctx),
            Payload::Json(json) => json.clone(),
        }
    }
}

struct WasmAction<T: Subject> {
    expansion: Arc<WasmExpansion<T>>,
    payload: Payload,
}

impl<T: Subject> ActionBody<T> for WasmAction<T> {
    fn run(&self, ctx: &Context<T>) {
        self.expansion.run(ctx, &self.payload.render(ctx));
    }
}

struct WasmRequirement<T: Subject> {
    expansion: Arc<WasmExpansion<T>>,
    payload: Payload,
}

impl<T: Subject> RequirementBody<T> for WasmRequirement<T> {
    fn check(&self, ctx: &Context<T>, _side_effects: bool) -> bool {
        self.expansion.check(ctx, &self.payload.render(ctx))
    }
}

fn read_metadata<T: Subject>(
    store: &mut Store<HostState<T>>,
    instance: &Instance,
    memory: &Memory,
    name: &str,
) -> Result<String, ExpansionError> {
    let func = required_func::<(), i64, T>(store, instance, name)?;
    let packed = func
        .call(&mut *store, ())
        .map_err(|e| ExpansionError::InvalidMetadata(format!("{}: {:#}", name, e)))?;

    let ptr = (packed as u64 >> 32) as usize;
    let len = (packed as u64 & 0xffff_ffff) as usize;
    let bytes = memory
        .data(&*store)
        .get(ptr..ptr + len)
        .ok_or_else(|| ExpansionError::InvalidMetadata(format!("{} points outside memory", name)))?;

    String::from_utf8(bytes.to_vec())
        .map_err(|_| ExpansionError::InvalidMetadata(format!("{} is not valid UTF-8", name)))
}

fn optional_func<P, R, T>(
    store: &mut Store<HostState<T>>,
    instance: &Instance,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>, ExpansionError>
where
    P: WasmParams,
    R: WasmResults,
    T: Subject,
{
    match instance.get_func(&mut *store, name) {
        Some(func) => func.typed::<P, R>(&*store).map(Some).map_err(|e| {
            ExpansionError::Incompatible(format!(
                "export '{}' has the wrong signature: {:#}",
                name, e
            ))
        }),
        None => Ok(None),
    }
}

fn required_func<P, R, T>(
    store: &mut Store<HostState<T>>,
    instance: &Instance,
    name: &str,
) -> Result<TypedFunc<P, R>, ExpansionError>
where
    P: WasmParams,
    R: WasmResults,
    T: Subject,
{
    optional_func(store, instance, name)?
        .ok_or_else(|| ExpansionError::MissingExport(name.to_string()))
}
