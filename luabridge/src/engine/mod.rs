//! The script engine: compile, evaluate and invoke against a [`Runtime`].
//!
//! Every evaluation loads the chunk, copies the context's bindings into the
//! global namespace, binds the context streams, pushes `argv` and calls the
//! chunk for a single result. Syntax errors surface as [`LoadError`], runtime
//! errors as [`ScriptError`] with the location split out of the message.

mod compiled;
mod context;
mod factory;
mod proxy;
mod streams;

use std::io::Read;

use log::{debug, warn};
use luabridge_nls::{Decoder, TextDecoder};
use luabridge_vm::{LuaError, State};

use crate::bindings::{Bindings, Scope};
use crate::config::EngineConfig;
use crate::error::{Error, LoadError, Result, ScriptError};
use crate::object::Object;
use crate::runtime::{Runtime, StackGuard};
use crate::table_map::TableSource;

pub use compiled::CompiledChunk;
pub use context::{ScriptContext, SharedReader};
pub use factory::EngineFactory;
pub use proxy::InterfaceProxy;

use streams::Streams;

/// Compiles, evaluates and invokes scripts against one [`Runtime`].
///
/// The runtime never frees tables, so memory grows with every table a
/// script builds and every [`ScriptEngine::create_bindings`] call. An engine
/// that runs indefinitely should be replaced from time to time.
pub struct ScriptEngine {
    runtime: Runtime,
    config: EngineConfig,
    context: ScriptContext,
    streams: Streams,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let runtime = if config.open_libs() {
            Runtime::new()
        } else {
            Runtime::bare()
        };
        Self::with_runtime(runtime, config)
    }

    /// An engine over an existing runtime. The default context's engine
    /// scope is the runtime's global namespace.
    pub fn with_runtime(runtime: Runtime, config: EngineConfig) -> Self {
        let streams = runtime.enter(Streams::install);
        let context = ScriptContext::standard().with_engine_scope(Bindings::globals(&runtime));
        Self {
            runtime,
            config,
            context,
            streams,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn factory(&self) -> EngineFactory {
        EngineFactory::with_config(self.config.clone())
    }

    pub fn context(&self) -> &ScriptContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ScriptContext {
        &mut self.context
    }

    /// Replaces the default context used by [`ScriptEngine::eval`] and friends.
    pub fn set_context(&mut self, context: ScriptContext) {
        self.context = context;
    }

    /// Stores a binding in the default context's engine scope.
    pub fn put(&mut self, name: &str, value: impl Into<Object>) -> Result<Option<Object>> {
        self.context.engine_scope_mut().put(name, value)
    }

    pub fn get(&self, name: &str) -> Result<Option<Object>> {
        match self.context.engine_scope() {
            Some(scope) => scope.get(name),
            None => Ok(None),
        }
    }

    /// The live global namespace.
    pub fn bindings(&self) -> Bindings {
        Bindings::globals(&self.runtime)
    }

    /// Fresh bindings backed by a new, empty table. The table lives as long
    /// as the runtime does.
    pub fn create_bindings(&self) -> Bindings {
        Bindings::create(&self.runtime)
    }

    fn chunk_name(&self, ctx: &ScriptContext) -> String {
        ctx.filename()
            .unwrap_or(self.config.default_chunk_name())
            .to_string()
    }

    fn decode(&self, mut reader: impl Read) -> Result<String> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let decoder = Decoder::new(self.config.source_encoding());
        Ok(decoder.decode_strict(&bytes)?.into_owned())
    }

    /// Parses `source` and returns its dumped form.
    pub fn compile(&self, source: &str) -> Result<CompiledChunk> {
        let chunk_name = self.chunk_name(&self.context);
        debug!("compile: '{chunk_name}' ({} bytes)", source.len());
        self.runtime.enter(|state| {
            let _guard = StackGuard::new(state);
            state.load(source.as_bytes(), &chunk_name).map_err(load_error)?;
            let bytes = state.dump()?;
            Ok(CompiledChunk::new(bytes))
        })
    }

    pub fn compile_reader(&self, reader: impl Read) -> Result<CompiledChunk> {
        let source = self.decode(reader)?;
        self.compile(&source)
    }

    pub fn eval(&self, source: &str) -> Result<Object> {
        self.eval_with(source, &self.context)
    }

    pub fn eval_with(&self, source: &str, ctx: &ScriptContext) -> Result<Object> {
        self.call_chunk(source.as_bytes(), ctx)
    }

    /// Reads the whole source, decoding it with the configured encoding.
    pub fn eval_reader(&self, reader: impl Read, ctx: &ScriptContext) -> Result<Object> {
        let source = self.decode(reader)?;
        self.call_chunk(source.as_bytes(), ctx)
    }

    pub fn eval_chunk(&self, chunk: &CompiledChunk, ctx: &ScriptContext) -> Result<Object> {
        self.call_chunk(chunk.as_bytes(), ctx)
    }

    fn call_chunk(&self, bytes: &[u8], ctx: &ScriptContext) -> Result<Object> {
        let chunk_name = self.chunk_name(ctx);
        let argv = ctx
            .argv()
            .unwrap_or_default()
            .iter()
            .map(|a| a.clone().into_value(&self.runtime))
            .collect::<Result<Vec<_>>>()?;
        debug!("eval: '{chunk_name}' with {} arguments", argv.len());
        self.runtime.enter(|state| {
            let _guard = StackGuard::new(state);
            state.load(bytes, &chunk_name).map_err(load_error)?;
            self.apply_context(state, ctx)?;
            let nargs = argv.len();
            for arg in argv {
                state.push(arg);
            }
            let previous = state.set_output(ctx.writer().cloned());
            let called = state.call(nargs, Some(1));
            state.set_output(previous);
            called.map_err(script_error)?;
            Ok(Object::from_value(&self.runtime, state.to_value(-1)?))
        })
    }

    fn apply_context(&self, state: &State, ctx: &ScriptContext) -> Result<()> {
        if let Some(scope) = ctx.global_scope() {
            self.apply_bindings(state, scope)?;
        }
        if let Some(scope) = ctx.engine_scope() {
            // the live global namespace needs no copying onto itself
            if !scope.is_globals_of(&self.runtime) {
                self.apply_bindings(state, scope)?;
            }
        }
        self.streams.attach(state, ctx)?;
        Ok(())
    }

    fn apply_bindings(&self, state: &State, scope: &Scope) -> Result<()> {
        for (key, value) in scope.pairs()? {
            let name = global_name(&key);
            if name.is_empty() {
                warn!("binding '{key}' has no name after its last '.', skipped");
                continue;
            }
            state.push(value.into_value(&self.runtime)?);
            state.set_global(name)?;
        }
        Ok(())
    }

    /// Calls the global function `name` with `args`, returning its first result.
    pub fn invoke_function(&self, name: &str, args: Vec<Object>) -> Result<Object> {
        call_field(&self.runtime, TableSource::Globals, name, CallStyle::Function, args)
    }

    /// Calls `target:name(args...)`.
    pub fn invoke_method(&self, target: &Object, name: &str, args: Vec<Object>) -> Result<Object> {
        let table = self.table_of(target)?;
        call_field(&self.runtime, table, name, CallStyle::Method, args)
    }

    /// A proxy calling global functions.
    pub fn get_interface(&self, methods: &[&str]) -> InterfaceProxy {
        InterfaceProxy::new(&self.runtime, TableSource::Globals, methods)
    }

    /// A proxy calling methods of the table `target`.
    pub fn get_interface_of(&self, target: &Object, methods: &[&str]) -> Result<InterfaceProxy> {
        let table = self.table_of(target)?;
        Ok(InterfaceProxy::new(&self.runtime, table, methods))
    }

    fn table_of(&self, target: &Object) -> Result<TableSource> {
        match target {
            Object::Table(t) if t.runtime().ptr_eq(&self.runtime) => Ok(TableSource::Table(t.id())),
            _ => Err(Error::NotATable),
        }
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Trailing segment of a dotted binding name, the whole name otherwise.
fn global_name(key: &str) -> &str {
    match key.rfind('.') {
        Some(pos) => &key[pos + 1..],
        None => key,
    }
}

fn load_error(err: LuaError) -> Error {
    Error::Load(LoadError::from(err))
}

fn script_error(err: LuaError) -> Error {
    Error::Script(ScriptError::from(err))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CallStyle {
    /// `f(args...)`
    Function,
    /// `t:f(args...)`
    Method,
}

/// Calls the field `name` of `target` for one result.
pub(crate) fn call_field(
    runtime: &Runtime,
    target: TableSource,
    name: &str,
    style: CallStyle,
    args: Vec<Object>,
) -> Result<Object> {
    let args = args
        .into_iter()
        .map(|a| a.into_value(runtime))
        .collect::<Result<Vec<_>>>()?;
    runtime.enter(|state| {
        let _guard = StackGuard::new(state);
        target.push(state);
        state.get_field(-1, name)?;
        if !state.is_function(-1) {
            let what = match style {
                CallStyle::Function => "function",
                CallStyle::Method => "method",
            };
            return Err(Error::NoSuchMethod(format!("{what} '{name}' is undefined")));
        }
        let mut nargs = args.len();
        if style == CallStyle::Method {
            state.push_copy(-2)?;
            nargs += 1;
        }
        for arg in args {
            state.push(arg);
        }
        state.call(nargs, Some(1)).map_err(script_error)?;
        Ok(Object::from_value(runtime, state.to_value(-1)?))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_segment() {
        assert_eq!(global_name("app.name"), "name");
        assert_eq!(global_name("a.b.c"), "c");
        assert_eq!(global_name("plain"), "plain");
        assert_eq!(global_name("trailing."), "");
    }

    #[test]
    fn one_plus_one() {
        let engine = ScriptEngine::new();
        assert_eq!(engine.eval("return 1+1").unwrap(), Object::Number(2.0));
        assert_eq!(engine.eval("local x = 1").unwrap(), Object::Nil);
    }

    #[test]
    fn chunk_name_defaults_to_null() {
        let engine = ScriptEngine::new();
        let Err(Error::Script(err)) = engine.eval("error('boom')") else {
            panic!("expected a script error");
        };
        assert_eq!(err.message, "null:1: boom");
        assert_eq!(err.source_name.as_deref(), Some("null"));
        assert_eq!(err.line_number, Some(1));
    }
}
