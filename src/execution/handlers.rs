//! Step Handlers
//!
//! A step names a handler; the worker's [`HandlerRegistry`] maps that
//! name to a [`StepHandler`] implementation. Handlers receive the step
//! definition and the output of the previous step, and return the value
//! passed on to the next one.
//!
//! Built-in handlers:
//! - `shell`: runs `params.command` with `bash -c`
//! - `echo`: returns `params.value`, or passes its input through
//! - `sleep`: waits `params.ms` milliseconds, passes input through
//! - `fail`: always fails with `params.message`

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use serde_json::Value;

use crate::error::HandlerError;
use crate::workflow::Step;

/// Environment variable carrying the step input to shell commands.
pub const INPUT_ENV: &str = "RUNHUB_INPUT";

/// What a handler can do besides returning a value.
pub trait StepContext {
    /// Emits a log line attributed to the running step.
    fn log(&self, message: &str);
}

/// Executes one kind of step.
pub trait StepHandler: Send + Sync {
    fn run(&self, step: &Step, input: Value, ctx: &dyn StepContext) -> Result<Value, HandlerError>;
}

/// Name to handler lookup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("shell", ShellHandler);
        registry.register("echo", EchoHandler);
        registry.register("sleep", SleepHandler);
        registry.register("fail", FailHandler);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: impl StepHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StepHandler>, HandlerError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| HandlerError::UnknownHandler(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Renders a step input for command substitution: strings verbatim,
/// null as empty, everything else as compact JSON.
fn input_text(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs a shell command, logging each stdout line.
///
/// The step output is the command's stdout: parsed as JSON when it is
/// valid JSON, otherwise the trimmed text.
pub struct ShellHandler;

impl StepHandler for ShellHandler {
    fn run(&self, step: &Step, input: Value, ctx: &dyn StepContext) -> Result<Value, HandlerError> {
        let template = step
            .param_str("command")
            .ok_or_else(|| HandlerError::InvalidParams {
                step: step.id.clone(),
                message: "missing 'command'".to_string(),
            })?;

        let input_str = input_text(&input);
        let command_text = template.replace("{input}", &input_str);
        debug!("Step '{}' running: {}", step.id, command_text);

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&command_text)
            .env(INPUT_ENV, &input_str)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = step.param_str("working_dir") {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        // Drain stderr on its own thread so a chatty command cannot block
        let stderr_thread = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let mut captured = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                ctx.log(&line);
                captured.push(line);
            }
        }

        let status = child.wait()?;
        let stderr = stderr_thread
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            ctx.log(line);
        }

        if !status.success() {
            let detail = stderr.lines().last().unwrap_or("").trim();
            let mut message = match status.code() {
                Some(code) => format!("command exited with status {}", code),
                None => "command terminated by signal".to_string(),
            };
            if !detail.is_empty() {
                message.push_str(": ");
                message.push_str(detail);
            }
            return Err(HandlerError::Failed(message));
        }

        let text = captured.join("\n");
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

/// Returns `params.value` if present, otherwise the input unchanged.
pub struct EchoHandler;

impl StepHandler for EchoHandler {
    fn run(&self, step: &Step, input: Value, ctx: &dyn StepContext) -> Result<Value, HandlerError> {
        let output = step.params.get("value").cloned().unwrap_or(input);
        ctx.log(&format!("echo: {}", output));
        Ok(output)
    }
}

/// Sleeps for `params.ms` milliseconds.
pub struct SleepHandler;

impl StepHandler for SleepHandler {
    fn run(&self, step: &Step, input: Value, ctx: &dyn StepContext) -> Result<Value, HandlerError> {
        let ms = step.param_u64("ms").ok_or_else(|| HandlerError::InvalidParams {
            step: step.id.clone(),
            message: "missing or non-integer 'ms'".to_string(),
        })?;
        ctx.log(&format!("sleeping {} ms", ms));
        thread::sleep(Duration::from_millis(ms));
        Ok(input)
    }
}

/// Always fails.
pub struct FailHandler;

impl StepHandler for FailHandler {
    fn run(&self, step: &Step, _input: Value, _ctx: &dyn StepContext) -> Result<Value, HandlerError> {
        let message = step.param_str("message").unwrap_or("step failed");
        Err(HandlerError::Failed(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl StepContext for Collect {
        fn log(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    impl Collect {
        fn lines(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_registry_builtins() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["echo", "fail", "shell", "sleep"]);
        assert!(matches!(
            registry.get("nope"),
            Err(HandlerError::UnknownHandler(_))
        ));
    }

    #[test]
    fn test_echo_passes_input_or_value() {
        let ctx = Collect::default();
        let plain = Step::new("e", "echo");
        assert_eq!(EchoHandler.run(&plain, json!({"a": 1}), &ctx).unwrap(), json!({"a": 1}));

        let fixed = Step::new("e", "echo").with_params(json!({"value": [1, 2]}));
        assert_eq!(EchoHandler.run(&fixed, json!(null), &ctx).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_sleep_requires_ms() {
        let ctx = Collect::default();
        let step = Step::new("s", "sleep");
        assert!(matches!(
            SleepHandler.run(&step, json!(null), &ctx),
            Err(HandlerError::InvalidParams { .. })
        ));

        let step = Step::new("s", "sleep").with_params(json!({"ms": 1}));
        assert_eq!(SleepHandler.run(&step, json!("x"), &ctx).unwrap(), json!("x"));
    }

    #[test]
    fn test_fail_uses_message() {
        let ctx = Collect::default();
        let step = Step::new("f", "fail").with_params(json!({"message": "nope"}));
        let err = FailHandler.run(&step, json!(null), &ctx).unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn test_shell_parses_json_output_and_logs_lines() {
        let ctx = Collect::default();
        let step = Step::new("sh", "shell")
            .with_params(json!({"command": "echo working; echo '{\"n\": 3}'"}));

        // The second line is the output; the first is not JSON on its own
        let output = ShellHandler.run(&step, json!(null), &ctx).unwrap();
        assert_eq!(output, json!("working\n{\"n\": 3}"));
        assert_eq!(ctx.lines(), vec!["working", "{\"n\": 3}"]);

        let step = Step::new("sh", "shell").with_params(json!({"command": "echo '[1,2]'"}));
        assert_eq!(ShellHandler.run(&step, json!(null), &ctx).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_shell_substitutes_input() {
        let ctx = Collect::default();
        let step = Step::new("sh", "shell")
            .with_params(json!({"command": "echo \"got {input} and $RUNHUB_INPUT\""}));
        let output = ShellHandler.run(&step, json!("abc"), &ctx).unwrap();
        assert_eq!(output, json!("got abc and abc"));
    }

    #[test]
    fn test_shell_nonzero_exit_is_error() {
        let ctx = Collect::default();
        let step = Step::new("sh", "shell")
            .with_params(json!({"command": "echo bad >&2; exit 3"}));
        let err = ShellHandler.run(&step, json!(null), &ctx).unwrap_err();
        assert_eq!(err.to_string(), "command exited with status 3: bad");
        assert_eq!(ctx.lines(), vec!["bad"]);
    }

    #[test]
    fn test_shell_requires_command() {
        let ctx = Collect::default();
        let step = Step::new("sh", "shell");
        assert!(matches!(
            ShellHandler.run(&step, json!(null), &ctx),
            Err(HandlerError::InvalidParams { .. })
        ));
    }
}
