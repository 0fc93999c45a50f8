use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luabridge::{
    CompiledChunk, EngineConfig, EngineConfigBuilder, Encoding, Error, LoggerConfig, Object,
    ScriptContext, ScriptEngine,
};

#[derive(Parser, Debug)]
#[command(name = "luab", version, about, long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Source encoding, overrides the configuration file
    #[clap(short, long)]
    encoding: Option<Encoding>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script or a precompiled chunk
    Run {
        file: PathBuf,
        /// Arguments passed to the chunk as `...`
        args: Vec<String>,
    },
    /// Precompile a script
    Compile {
        file: PathBuf,
        #[clap(short, long)]
        output: PathBuf,
    },
    /// Evaluate a chunk given on the command line
    Eval { source: String },
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::read(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(encoding) = args.encoding {
        config = EngineConfigBuilder::new()
            .with_default_chunk_name(config.default_chunk_name())
            .with_open_libs(config.open_libs())
            .with_source_encoding(encoding)
            .with_logger_config(config.logger_config().cloned().unwrap_or_default())
            .get();
    }
    Ok(config)
}

fn init_logger(config: Option<&LoggerConfig>) {
    let config = config.cloned().unwrap_or_default();
    env_logger::Builder::new()
        .filter_level(config.level_filter)
        .filter_module("luabridge", config.app_level_filter)
        .filter_module("luabridge_vm", config.app_level_filter)
        .filter_module("luab", config.app_level_filter)
        .parse_default_env()
        .init();
}

fn chunk_name(path: &Path) -> String {
    path.display().to_string()
}

fn run_file(engine: &ScriptEngine, path: &Path, args: &[String]) -> Result<Object> {
    let ctx = ScriptContext::standard()
        .with_filename(chunk_name(path))
        .with_argv(args.iter().map(|a| Object::from(a.as_str())).collect());
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let result = match CompiledChunk::from_bytes(bytes.clone()) {
        Ok(chunk) => engine.eval_chunk(&chunk, &ctx)?,
        Err(_) => engine.eval_reader(bytes.as_slice(), &ctx)?,
    };
    Ok(result)
}

fn compile_file(engine: &mut ScriptEngine, input: &Path, output: &Path) -> Result<usize> {
    engine.context_mut().set_filename(Some(chunk_name(input)));
    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let chunk = engine.compile_reader(BufReader::new(file))?;
    std::fs::write(output, chunk.as_bytes())
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(chunk.as_bytes().len())
}

fn execute(args: Args, config: EngineConfig) -> Result<()> {
    let mut engine = ScriptEngine::with_config(config);
    let result = match &args.command {
        Command::Run { file, args } => run_file(&engine, file, args)?,
        Command::Compile { file, output } => {
            let n = compile_file(&mut engine, file, output)?;
            log::info!("wrote {} ({n} bytes)", output.display());
            Object::Nil
        }
        Command::Eval { source } => {
            let ctx = ScriptContext::standard().with_filename("(command line)");
            engine.eval_with(source, &ctx)?
        }
    };
    if !result.is_nil() {
        println!("{result}");
    }
    Ok(())
}

/// Message plus the script traceback when there is one.
fn report(err: &anyhow::Error) -> String {
    match err.downcast_ref::<Error>() {
        Some(Error::Script(script)) => match &script.traceback {
            Some(traceback) => format!("{}\n{traceback}", script.message),
            None => script.message.clone(),
        },
        _ => format!("{err:#}"),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("luab: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logger(config.logger_config());
    match execute(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::debug!("failed: {e:?}");
            eprintln!("luab: {}", report(&e));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("luab-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn compile_then_run() {
        let src = scratch("double.lua");
        let out = scratch("double.luac");
        std::fs::write(&src, "local n = ...\nreturn tonumber(n) * 2").unwrap();

        let mut engine = ScriptEngine::new();
        assert!(compile_file(&mut engine, &src, &out).unwrap() > 0);
        let result = run_file(&engine, &out, &["21".to_string()]).unwrap();
        assert_eq!(result, Object::Number(42.0));
        let result = run_file(&engine, &src, &["4".to_string()]).unwrap();
        assert_eq!(result, Object::Number(8.0));
    }

    #[test]
    fn errors_name_the_file() {
        let src = scratch("broken.lua");
        std::fs::write(&src, "\n\nerror('bad')").unwrap();
        let engine = ScriptEngine::new();
        let err = run_file(&engine, &src, &[]).unwrap_err();
        let text = report(&err);
        assert!(text.starts_with(&format!("{}:3: bad", src.display())), "{text}");
        assert!(text.contains("stack traceback:"), "{text}");
    }

    #[test]
    fn arguments_parse() {
        let args = Args::try_parse_from(["luab", "-e", "shift_jis", "run", "a.lua", "x", "y"]).unwrap();
        assert_eq!(args.encoding, Some(Encoding::ShiftJis));
        let Command::Run { file, args } = args.command else {
            panic!("expected run");
        };
        assert_eq!(file, PathBuf::from("a.lua"));
        assert_eq!(args, vec!["x", "y"]);
    }
}
