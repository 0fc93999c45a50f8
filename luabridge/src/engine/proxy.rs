use log::trace;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::runtime::Runtime;
use crate::table_map::TableSource;

use super::{call_field, CallStyle};

/// A fixed set of script functions callable from the host.
///
/// Over the global namespace each method is a global function; over a table
/// each method is a field called with the table as `self`. The proxy may be
/// moved to and used from any thread.
#[derive(Clone)]
pub struct InterfaceProxy {
    runtime: Runtime,
    target: TableSource,
    methods: Vec<String>,
}

impl InterfaceProxy {
    pub(crate) fn new(runtime: &Runtime, target: TableSource, methods: &[&str]) -> Self {
        Self {
            runtime: runtime.clone(),
            target,
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn implements(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub fn call(&self, method: &str, args: Vec<Object>) -> Result<Object> {
        if !self.implements(method) {
            return Err(Error::NoSuchMethod(format!(
                "method '{method}' is not part of the interface"
            )));
        }
        trace!("proxy call: {method}");
        let style = match self.target {
            TableSource::Globals => CallStyle::Function,
            TableSource::Table(_) => CallStyle::Method,
        };
        call_field(&self.runtime, self.target, method, style, args)
    }
}
