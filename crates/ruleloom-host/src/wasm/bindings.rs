use anyhow::Result;
use tracing::{debug, info};
use wasmtime::{Caller, Extern, Linker, Memory};

use ruleloom_engine::{Context, Subject};

/// Module name every host import lives under
pub const HOST_MODULE: &str = "host";

/// Per-store state seen by host imports
pub struct HostState<T: Subject> {
    /// Type key of the expansion owning the store, used in log lines
    pub(crate) type_key: String,
    /// Context of the trigger currently calling into the guest.
    /// `None` outside of `run`/`check`, e.g. while validating a value.
    pub(crate) ctx: Option<Context<T>>,
}

impl<T: Subject> HostState<T> {
    pub fn new(type_key: impl Into<String>) -> Self {
        Self {
            type_key: type_key.into(),
            ctx: None,
        }
    }
}

/// Add all host imports to the linker
pub fn add_host_imports<T: Subject>(linker: &mut Linker<HostState<T>>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "log",
        |mut caller: Caller<'_, HostState<T>>, ptr: i32, len: i32| {
            if let Some(message) = read_string(&mut caller, ptr, len) {
                info!(target: "expansions", "[{}] {}", caller.data().type_key, message);
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "send_message",
        |mut caller: Caller<'_, HostState<T>>, ptr: i32, len: i32| {
            let ctx = current_context(&caller);
            let message = read_string(&mut caller, ptr, len);
            let (Some(ctx), Some(message)) = (ctx, message) else {
                return;
            };
            let targets = ctx.targets();
            if targets.is_empty() {
                ctx.platform().send_message(ctx.subject(), &message);
            } else {
                for target in targets {
                    ctx.platform().send_message(&target, &message);
                }
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "run_command",
        |mut caller: Caller<'_, HostState<T>>, ptr: i32, len: i32| {
            let ctx = current_context(&caller);
            let command = read_string(&mut caller, ptr, len);
            let (Some(ctx), Some(command)) = (ctx, command) else {
                return;
            };
            ctx.platform().run_command(ctx.subject(), &command);
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "get_property",
        |mut caller: Caller<'_, HostState<T>>,
         key_ptr: i32,
         key_len: i32,
         out_ptr: i32,
         out_cap: i32|
         -> i32 {
            let Some(ctx) = current_context(&caller) else {
                return -1;
            };
            let Some(key) = read_string(&mut caller, key_ptr, key_len) else {
                return -1;
            };
            match ctx.get_text(&key) {
                Some(value) => write_bytes(&mut caller, out_ptr, out_cap, value.as_bytes()),
                None => -1,
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "set_property",
        |mut caller: Caller<'_, HostState<T>>,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32| {
            let Some(ctx) = current_context(&caller) else {
                return;
            };
            let key = read_string(&mut caller, key_ptr, key_len);
            let value = read_string(&mut caller, value_ptr, value_len);
            if let (Some(key), Some(value)) = (key, value) {
                ctx.set(key, value);
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "subject_id",
        |mut caller: Caller<'_, HostState<T>>, out_ptr: i32, out_cap: i32| -> i32 {
            match current_context(&caller) {
                Some(ctx) => {
                    let id = ctx.subject().id();
                    write_bytes(&mut caller, out_ptr, out_cap, id.as_bytes())
                }
                None => -1,
            }
        },
    )?;

    Ok(())
}

fn current_context<T: Subject>(caller: &Caller<'_, HostState<T>>) -> Option<Context<T>> {
    let ctx = caller.data().ctx.clone();
    if ctx.is_none() {
        debug!(
            target: "expansions",
            "[{}] host call outside of a trigger ignored",
            caller.data().type_key
        );
    }
    ctx
}

fn guest_memory<T: Subject>(caller: &mut Caller<'_, HostState<T>>) -> Option<Memory> {
    caller.get_export("memory").and_then(Extern::into_memory)
}

/// Read a UTF-8 string out of guest memory; out-of-bounds reads yield `None`
fn read_string<T: Subject>(
    caller: &mut Caller<'_, HostState<T>>,
    ptr: i32,
    len: i32,
) -> Option<String> {
    let memory = guest_memory(caller)?;
    let start = ptr as u32 as usize;
    let end = start.checked_add(len as u32 as usize)?;
    let bytes = memory.data(&*caller).get(start..end)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Copy as much of `bytes` as fits into the guest buffer and return the full length
fn write_bytes<T: Subject>(
    caller: &mut Caller<'_, HostState<T>>,
    ptr: i32,
    cap: i32,
    bytes: &[u8],
) -> i32 {
    let Some(memory) = guest_memory(caller) else {
        return -1;
    };
    let n = bytes.len().min(cap.max(0) as usize);
    if n > 0 && memory.write(&mut *caller, ptr as u32 as usize, &bytes[..n]).is_err() {
        return -1;
    }
    i32::try_from(bytes.len()).unwrap_or(i32::MAX)
}
