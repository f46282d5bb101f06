//! The compiler capability.
//!
//! The cache treats compilation as opaque: a [`Compiler`] turns a script into
//! an [`Artifact`] at a path chosen by the caller, and describes its own
//! configuration through [`Compiler::fingerprint`] so that changing the
//! compiler changes every cache key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use hearth_core::CompilerConfig;

/// A compile failure, reported to the user as the script's own error.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{script}: {message}")]
pub struct CompileError {
    pub script: PathBuf,
    pub message: String,
}

impl CompileError {
    pub fn new(script: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            message: message.into(),
        }
    }
}

/// One compilation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRequest {
    pub script_path: PathBuf,
    pub source: String,
    /// Where the artifact must end up. Compilers write a sibling and rename.
    pub output: PathBuf,
}

/// A runnable compiled script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// Program (plus leading arguments) that runs `path`; empty means `path`
    /// is itself executable.
    #[serde(default)]
    pub runner: Vec<String>,
}

impl Artifact {
    /// Program and argument vector for running the artifact with `args`.
    pub fn command_line(&self, args: &[String]) -> (String, Vec<String>) {
        let path = self.path.to_string_lossy().into_owned();
        match self.runner.split_first() {
            Some((program, leading)) => {
                let mut argv = leading.to_vec();
                argv.push(path);
                argv.extend(args.iter().cloned());
                (program.clone(), argv)
            }
            None => (path, args.to_vec()),
        }
    }
}

pub trait Compiler: Send + Sync {
    /// Stable description of this compiler's configuration.
    fn fingerprint(&self) -> String;

    /// Pay one-time initialization cost. Called once when a session starts.
    fn warm_up(&self) -> Result<(), CompileError> {
        Ok(())
    }

    fn compile(&self, request: &CompileRequest) -> Result<Artifact, CompileError>;
}

/// Build the compiler selected by configuration.
pub fn from_config(config: &CompilerConfig) -> Box<dyn Compiler> {
    match &config.command {
        Some(command) => Box::new(CommandCompiler::new(command.clone())),
        None => Box::new(ScriptCompiler),
    }
}

// ---------------------------------------------------------------------------
// Built-in: shebang scripts
// ---------------------------------------------------------------------------

/// Materializes an interpreted script and runs it through its `#!` line.
///
/// The artifact is run as `<interpreter> [arg] <artifact> <args…>` rather than
/// executed directly, so a freshly written file is never `exec`ed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptCompiler;

impl ScriptCompiler {
    pub fn parse_shebang(source: &str) -> Option<Vec<String>> {
        let line = source.lines().next()?.strip_prefix("#!")?.trim();
        let mut parts = line.splitn(2, char::is_whitespace);
        let interpreter = parts.next().filter(|s| !s.is_empty())?;
        let mut runner = vec![interpreter.to_string()];
        // Linux passes everything after the interpreter as a single argument.
        if let Some(arg) = parts.next().map(str::trim).filter(|s| !s.is_empty()) {
            runner.push(arg.to_string());
        }
        Some(runner)
    }
}

impl Compiler for ScriptCompiler {
    fn fingerprint(&self) -> String {
        "script-v1".to_string()
    }

    fn compile(&self, request: &CompileRequest) -> Result<Artifact, CompileError> {
        let runner = Self::parse_shebang(&request.source).ok_or_else(|| {
            CompileError::new(&request.script_path, "missing #! interpreter line")
        })?;
        write_atomically(&request.output, request.source.as_bytes())
            .map_err(|err| CompileError::new(&request.script_path, err.to_string()))?;
        Ok(Artifact {
            path: request.output.clone(),
            runner,
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in: external compiler command
// ---------------------------------------------------------------------------

/// Runs an external command template such as `cc {source} -o {output}`.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    template: Vec<String>,
}

impl CommandCompiler {
    pub fn new(template: Vec<String>) -> Self {
        Self { template }
    }

    fn render(&self, source: &Path, output: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let output = output.to_string_lossy();
        self.template
            .iter()
            .map(|part| part.replace("{source}", &source).replace("{output}", &output))
            .collect()
    }
}

impl Compiler for CommandCompiler {
    fn fingerprint(&self) -> String {
        format!("command:{}", self.template.join("\u{1f}"))
    }

    fn warm_up(&self) -> Result<(), CompileError> {
        let Some(program) = self.template.first() else {
            return Err(CompileError::new("<config>", "empty compiler command"));
        };
        match Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(CompileError::new(
                "<config>",
                format!("compiler '{program}' not found"),
            )),
            // Anything else (odd --version handling) is the compiler's business.
            Err(_) => Ok(()),
        }
    }

    fn compile(&self, request: &CompileRequest) -> Result<Artifact, CompileError> {
        let fail = |message: String| CompileError::new(&request.script_path, message);

        if let Some(dir) = request.output.parent() {
            std::fs::create_dir_all(dir).map_err(|e| fail(e.to_string()))?;
        }
        let staging = staging_path(&request.output);
        let source_copy = staging.with_extension("src");
        std::fs::write(&source_copy, &request.source).map_err(|e| fail(e.to_string()))?;

        let argv = self.render(&source_copy, &staging);
        let Some((program, args)) = argv.split_first() else {
            return Err(fail("empty compiler command".to_string()));
        };
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output();
        let _ = std::fs::remove_file(&source_copy);
        let output = output.map_err(|e| fail(format!("failed to run '{program}': {e}")))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&staging);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(fail(format!(
                "compiler exited with {}: {detail}",
                output.status
            )));
        }

        std::fs::rename(&staging, &request.output).map_err(|e| fail(e.to_string()))?;
        Ok(Artifact {
            path: request.output.clone(),
            runner: Vec::new(),
        })
    }
}

fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    output.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let staging = staging_path(path);
    std::fs::write(&staging, bytes)?;
    std::fs::rename(&staging, path)
}
