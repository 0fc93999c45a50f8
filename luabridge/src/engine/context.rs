use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use indexmap::IndexMap;
use luabridge_vm::SharedWriter;
use parking_lot::Mutex;

use crate::bindings::{Scope, SimpleBindings};
use crate::object::Object;

/// Source of the `reader` stream bound into scripts.
pub type SharedReader = Arc<Mutex<dyn BufRead + Send>>;

/// Per-evaluation settings: chunk name, scopes, arguments and streams.
///
/// Global scope bindings are copied into the runtime first, then engine
/// scope bindings, so the engine scope wins on conflicting names.
#[derive(Clone, Default)]
pub struct ScriptContext {
    filename: Option<String>,
    global_scope: Option<Scope>,
    engine_scope: Option<Scope>,
    argv: Option<Vec<Object>>,
    reader: Option<SharedReader>,
    writer: Option<SharedWriter>,
    error_writer: Option<SharedWriter>,
    attributes: IndexMap<String, Object>,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context attached to the process' standard streams.
    pub fn standard() -> Self {
        Self::new()
            .with_reader(Arc::new(Mutex::new(BufReader::new(io::stdin()))))
            .with_writer(Arc::new(Mutex::new(io::stdout())))
            .with_error_writer(Arc::new(Mutex::new(io::stderr())))
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_global_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.global_scope = Some(scope.into());
        self
    }

    pub fn with_engine_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.engine_scope = Some(scope.into());
        self
    }

    /// Arguments passed to the chunk, visible to it as `...`.
    pub fn with_argv(mut self, argv: Vec<Object>) -> Self {
        self.argv = Some(argv);
        self
    }

    pub fn with_reader(mut self, reader: SharedReader) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Also receives `print` output while the chunk runs.
    pub fn with_writer(mut self, writer: SharedWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_error_writer(mut self, writer: SharedWriter) -> Self {
        self.error_writer = Some(writer);
        self
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn set_filename(&mut self, filename: Option<String>) {
        self.filename = filename;
    }

    pub fn global_scope(&self) -> Option<&Scope> {
        self.global_scope.as_ref()
    }

    pub fn global_scope_mut(&mut self) -> Option<&mut Scope> {
        self.global_scope.as_mut()
    }

    pub fn set_global_scope(&mut self, scope: Option<Scope>) {
        self.global_scope = scope;
    }

    pub fn engine_scope(&self) -> Option<&Scope> {
        self.engine_scope.as_ref()
    }

    /// The engine scope, created empty when missing.
    pub fn engine_scope_mut(&mut self) -> &mut Scope {
        self.engine_scope
            .get_or_insert_with(|| Scope::Simple(SimpleBindings::new()))
    }

    pub fn set_engine_scope(&mut self, scope: Option<Scope>) {
        self.engine_scope = scope;
    }

    pub fn argv(&self) -> Option<&[Object]> {
        self.argv.as_deref()
    }

    pub fn set_argv(&mut self, argv: Option<Vec<Object>>) {
        self.argv = argv;
    }

    pub fn reader(&self) -> Option<&SharedReader> {
        self.reader.as_ref()
    }

    pub fn writer(&self) -> Option<&SharedWriter> {
        self.writer.as_ref()
    }

    pub fn error_writer(&self) -> Option<&SharedWriter> {
        self.error_writer.as_ref()
    }

    pub fn set_reader(&mut self, reader: Option<SharedReader>) {
        self.reader = reader;
    }

    pub fn set_writer(&mut self, writer: Option<SharedWriter>) {
        self.writer = writer;
    }

    pub fn set_error_writer(&mut self, writer: Option<SharedWriter>) {
        self.error_writer = writer;
    }

    /// Free-form attribute, not bound into scripts.
    pub fn attribute(&self, name: &str) -> Option<&Object> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<Object>) {
        let value = value.into();
        let name = name.into();
        if value.is_nil() {
            self.attributes.shift_remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Object> {
        self.attributes.shift_remove(name)
    }
}
