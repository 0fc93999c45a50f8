use super::ScriptEngine;
use crate::config::EngineConfig;

pub const ENGINE_NAME: &str = "luabridge";
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const LANGUAGE_NAME: &str = "Lua";
pub const LANGUAGE_VERSION: &str = "5.1";

const NAMES: &[&str] = &["lua", "Lua", "luabridge"];
const EXTENSIONS: &[&str] = &["lua"];
const MIME_TYPES: &[&str] = &["application/x-lua", "text/x-lua"];

/// Describes the engine and creates instances of it.
#[derive(Debug, Clone, Default)]
pub struct EngineFactory {
    config: EngineConfig,
}

impl EngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn engine_name(&self) -> &'static str {
        ENGINE_NAME
    }

    pub fn engine_version(&self) -> &'static str {
        ENGINE_VERSION
    }

    pub fn language_name(&self) -> &'static str {
        LANGUAGE_NAME
    }

    pub fn language_version(&self) -> &'static str {
        LANGUAGE_VERSION
    }

    pub fn names(&self) -> &'static [&'static str] {
        NAMES
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        EXTENSIONS
    }

    pub fn mime_types(&self) -> &'static [&'static str] {
        MIME_TYPES
    }

    /// Well-known parameters: `engine`, `engine_version`, `language`,
    /// `language_version` and `name`.
    pub fn parameter(&self, key: &str) -> Option<&'static str> {
        match key {
            "engine" => Some(ENGINE_NAME),
            "engine_version" => Some(ENGINE_VERSION),
            "language" => Some(LANGUAGE_NAME),
            "language_version" => Some(LANGUAGE_VERSION),
            "name" => NAMES.first().copied(),
            _ => None,
        }
    }

    /// `obj:m(a, b)`
    pub fn method_call_syntax(&self, obj: &str, method: &str, args: &[&str]) -> String {
        format!("{obj}:{method}({})", args.join(", "))
    }

    /// A statement printing `text` verbatim.
    pub fn output_statement(&self, text: &str) -> String {
        let mut quoted = String::with_capacity(text.len() + 2);
        for c in text.chars() {
            match c {
                '\\' => quoted.push_str("\\\\"),
                '"' => quoted.push_str("\\\""),
                '\n' => quoted.push_str("\\n"),
                '\r' => quoted.push_str("\\r"),
                '\0' => quoted.push_str("\\0"),
                c => quoted.push(c),
            }
        }
        format!("print(\"{quoted}\")")
    }

    /// Every statement on its own line, each ending with a newline.
    pub fn program(&self, statements: &[&str]) -> String {
        statements.iter().map(|s| format!("{s}\n")).collect()
    }

    pub fn script_engine(&self) -> ScriptEngine {
        ScriptEngine::with_config(self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;
    use pretty_assertions::assert_eq;

    #[test]
    fn syntax_helpers() {
        let f = EngineFactory::new();
        assert_eq!(f.method_call_syntax("obj", "m", &["a", "b"]), "obj:m(a, b)");
        assert_eq!(f.method_call_syntax("obj", "m", &[]), "obj:m()");
        assert_eq!(f.output_statement("say \"hi\"\n"), r#"print("say \"hi\"\n")"#);
        assert_eq!(f.program(&["a = 1", "return b"]), "a = 1\nreturn b\n");
        assert_eq!(f.program(&[]), "");
        assert_eq!(f.parameter("language"), Some("Lua"));
        assert_eq!(f.parameter("threading"), None);
        assert!(f.mime_types().contains(&"text/x-lua"));
    }

    #[test]
    fn generated_program_runs() {
        let f = EngineFactory::new();
        let engine = f.script_engine();
        let src = f.program(&["local t = { n = 2 }", "function t:twice(x) return x * self.n end", "return t:twice(21)"]);
        assert_eq!(engine.eval(&src).unwrap(), Object::Number(42.0));
    }
}
