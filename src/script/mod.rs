//! Sandboxed Lua execution for model-generated command scripts
//!
//! Scripts run in a fresh interpreter per execution with only the
//! math/string/table standard libraries loaded. Every effect a script
//! can have on the outside world goes through an injected capability
//! closure, so tests and restricted deployments swap in stubs instead
//! of real hardware or network access.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mlua::{Lua, LuaOptions, StdLib, Variadic, VmState};

use crate::commands::CommandResult;

/// Heap ceiling for a single script
const MEMORY_LIMIT_BYTES: usize = 256 * 1024;

/// Instruction budget before a script is aborted
const INSTRUCTION_BUDGET: u32 = 5_000_000;

/// Hook granularity
const HOOK_EVERY_NTH: u32 = 10_000;

/// External effects a script may invoke, supplied as closures
pub struct Capabilities {
    /// Dispatch a registered device command
    pub dispatch: Arc<dyn Fn(&str, &[String]) -> CommandResult + Send + Sync>,

    /// Drive a GPIO pin; returns whether the write took effect
    pub gpio_write: Arc<dyn Fn(u8, bool) -> bool + Send + Sync>,

    /// Read a GPIO pin level
    pub gpio_read: Arc<dyn Fn(u8) -> bool + Send + Sync>,

    /// Toggle a GPIO pin; returns the new level
    pub gpio_toggle: Arc<dyn Fn(u8) -> bool + Send + Sync>,

    /// Sleep for the given milliseconds (implementations should cap this)
    pub delay: Arc<dyn Fn(u64) + Send + Sync>,

    /// Fetch a URL into named web-data storage once
    pub web_fetch: Arc<dyn Fn(&str, &str) -> CommandResult + Send + Sync>,

    /// Fetch a URL into named web-data storage on an interval (minutes)
    pub web_fetch_scheduled: Arc<dyn Fn(&str, &str, u64) -> CommandResult + Send + Sync>,

    /// Read a stored web-data file
    pub web_read: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,

    /// List stored web-data files
    pub web_list: Arc<dyn Fn() -> Vec<String> + Send + Sync>,

    /// Read a persistent memory entry
    pub memory_read: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,

    /// Write a persistent memory entry
    pub memory_write: Arc<dyn Fn(&str, &str) -> bool + Send + Sync>,

    /// List persistent memory entries
    pub memory_list: Arc<dyn Fn() -> Vec<String> + Send + Sync>,

    /// Delete a persistent memory entry
    pub memory_delete: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl Capabilities {
    /// Capabilities where every effect is a stub; useful in tests and
    /// as a base to override individual fields
    #[must_use]
    pub fn noop() -> Self {
        Self {
            dispatch: Arc::new(|name, _| {
                CommandResult::failed(format!("unknown command: {name}"))
            }),
            gpio_write: Arc::new(|_, _| false),
            gpio_read: Arc::new(|_| false),
            gpio_toggle: Arc::new(|_| false),
            delay: Arc::new(|ms| std::thread::sleep(Duration::from_millis(ms.min(100)))),
            web_fetch: Arc::new(|_, _| CommandResult::failed("web data unavailable")),
            web_fetch_scheduled: Arc::new(|_, _, _| CommandResult::failed("web data unavailable")),
            web_read: Arc::new(|_| None),
            web_list: Arc::new(Vec::new),
            memory_read: Arc::new(|_| None),
            memory_write: Arc::new(|_, _| false),
            memory_list: Arc::new(Vec::new),
            memory_delete: Arc::new(|_| false),
        }
    }
}

/// Sandboxed script runner
pub struct ScriptEngine {
    caps: Arc<Capabilities>,
}

impl ScriptEngine {
    #[must_use]
    pub fn new(caps: Capabilities) -> Self {
        Self { caps: Arc::new(caps) }
    }

    /// Run a script and collect its printed output.
    ///
    /// All interpreter faults (syntax errors, runtime errors, budget
    /// exhaustion) surface as a failed [`CommandResult`] rather than an
    /// error, so a bad model script never takes the pipeline down.
    #[must_use]
    pub fn execute(&self, script: &str) -> CommandResult {
        let script = preprocess(script);
        match self.run(&script) {
            Ok(output) if output.is_empty() => CommandResult::ok("script completed"),
            Ok(output) => CommandResult::ok(output.trim_end().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "script execution failed");
                CommandResult::failed(format!("script error: {e}"))
            }
        }
    }

    fn run(&self, script: &str) -> mlua::Result<String> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )?;
        lua.set_memory_limit(MEMORY_LIMIT_BYTES)?;

        let spent = Arc::new(Mutex::new(0u32));
        lua.set_hook(
            mlua::HookTriggers::new().every_nth_instruction(HOOK_EVERY_NTH),
            move |_, _| {
                let Ok(mut spent) = spent.lock() else {
                    return Err(mlua::Error::runtime("instruction counter unavailable"));
                };
                *spent += HOOK_EVERY_NTH;
                if *spent >= INSTRUCTION_BUDGET {
                    Err(mlua::Error::runtime("instruction budget exceeded"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        let output = Arc::new(Mutex::new(String::new()));
        self.install_bindings(&lua, &output)?;

        lua.load(script).set_name("command_script").exec()?;

        let collected = output
            .lock()
            .map(|s| s.clone())
            .map_err(|_| mlua::Error::runtime("output buffer unavailable"))?;
        Ok(collected)
    }

    #[allow(clippy::too_many_lines)]
    fn install_bindings(&self, lua: &Lua, output: &Arc<Mutex<String>>) -> mlua::Result<()> {
        let globals = lua.globals();

        // The base library is always present; strip the functions that
        // reach the filesystem or load arbitrary chunks
        for name in ["dofile", "loadfile", "load", "require"] {
            globals.set(name, mlua::Value::Nil)?;
        }

        let out = Arc::clone(output);
        globals.set(
            "println",
            lua.create_function(move |_, text: String| {
                if let Ok(mut out) = out.lock() {
                    out.push_str(&text);
                    out.push('\n');
                }
                Ok(())
            })?,
        )?;

        let dispatch = Arc::clone(&self.caps.dispatch);
        let out = Arc::clone(output);
        globals.set(
            "execute_command",
            lua.create_function(move |_, (name, args): (String, Variadic<String>)| {
                let result = dispatch(&name, &args);
                if !result.success
                    && let Ok(mut out) = out.lock()
                {
                    out.push_str(&result.message);
                    out.push('\n');
                }
                Ok(result.success)
            })?,
        )?;

        let gpio_write = Arc::clone(&self.caps.gpio_write);
        globals.set(
            "gpio_write",
            lua.create_function(move |_, (pin, value): (u8, bool)| Ok(gpio_write(pin, value)))?,
        )?;

        let gpio_read = Arc::clone(&self.caps.gpio_read);
        globals.set(
            "gpio_read",
            lua.create_function(move |_, pin: u8| Ok(gpio_read(pin)))?,
        )?;

        let gpio_toggle = Arc::clone(&self.caps.gpio_toggle);
        globals.set(
            "gpio_toggle",
            lua.create_function(move |_, pin: u8| Ok(gpio_toggle(pin)))?,
        )?;

        let delay = Arc::clone(&self.caps.delay);
        globals.set(
            "delay",
            lua.create_function(move |_, ms: u64| {
                delay(ms);
                Ok(())
            })?,
        )?;

        let web_fetch = Arc::clone(&self.caps.web_fetch);
        globals.set(
            "fetch_webdata",
            lua.create_function(move |_, (url, filename): (String, String)| {
                let result = web_fetch(&url, &filename);
                Ok((result.success, result.message))
            })?,
        )?;

        let web_fetch_scheduled = Arc::clone(&self.caps.web_fetch_scheduled);
        globals.set(
            "schedule_webdata",
            lua.create_function(
                move |_, (url, filename, minutes): (String, String, u64)| {
                    let result = web_fetch_scheduled(&url, &filename, minutes);
                    Ok((result.success, result.message))
                },
            )?,
        )?;

        let web_read = Arc::clone(&self.caps.web_read);
        globals.set(
            "read_webdata",
            lua.create_function(move |_, filename: String| Ok(web_read(&filename)))?,
        )?;

        let web_list = Arc::clone(&self.caps.web_list);
        globals.set(
            "list_webdata",
            lua.create_function(move |_, ()| Ok(web_list()))?,
        )?;

        let memory_read = Arc::clone(&self.caps.memory_read);
        globals.set(
            "memory_read",
            lua.create_function(move |_, key: String| Ok(memory_read(&key)))?,
        )?;

        let memory_write = Arc::clone(&self.caps.memory_write);
        globals.set(
            "memory_write",
            lua.create_function(move |_, (key, value): (String, String)| {
                Ok(memory_write(&key, &value))
            })?,
        )?;

        let memory_list = Arc::clone(&self.caps.memory_list);
        globals.set(
            "memory_list",
            lua.create_function(move |_, ()| Ok(memory_list()))?,
        )?;

        let memory_delete = Arc::clone(&self.caps.memory_delete);
        globals.set(
            "memory_delete",
            lua.create_function(move |_, key: String| Ok(memory_delete(&key)))?,
        )?;

        Ok(())
    }
}

/// Replace bare `null` tokens with `nil`; models trained on JSON emit
/// `null` in otherwise valid Lua
fn preprocess(script: &str) -> String {
    let bytes = script.as_bytes();
    let mut result = String::with_capacity(script.len());
    let mut i = 0;
    while i < bytes.len() {
        if script[i..].starts_with("null")
            && !is_ident_byte(bytes.get(i.wrapping_sub(1)).copied(), i > 0)
            && !is_ident_byte(bytes.get(i + 4).copied(), true)
        {
            result.push_str("nil");
            i += 4;
        } else {
            // Keep multi-byte characters intact
            let ch_len = script[i..].chars().next().map_or(1, char::len_utf8);
            result.push_str(&script[i..i + ch_len]);
            i += ch_len;
        }
    }
    result
}

fn is_ident_byte(byte: Option<u8>, exists: bool) -> bool {
    exists && byte.is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
}
