//! User-facing output.
//!
//! Commands report through [`Events`]. In `cli` mode each message is printed
//! as it happens (info to stdout, warnings and errors to stderr). In `json`
//! mode messages are collected and a single document is printed by
//! [`Events::finish`].
//!
//! Every message and every string in `additional_info` is scrubbed through
//! the [`SecretRegistry`] before it is printed or collected.

use std::io::{self, Stderr, Stdout, Write};
use std::sync::Arc;

use serde_json::{Value, json};

use elxr_pro_core::{Error, SecretRegistry};

use crate::cli::OutputFormat;

pub const JSON_SCHEMA_VERSION: &str = "0.1";

pub struct Events<O, E> {
    format: OutputFormat,
    out: O,
    err: E,
    secrets: Arc<SecretRegistry>,
    errors: Vec<Value>,
    warnings: Vec<Value>,
}

impl Events<Stdout, Stderr> {
    pub fn stdio(format: OutputFormat) -> Self {
        Self::new(format, io::stdout(), io::stderr())
    }
}

impl<O: Write, E: Write> Events<O, E> {
    pub fn new(format: OutputFormat, out: O, err: E) -> Self {
        Self {
            format,
            out,
            err,
            secrets: Arc::new(SecretRegistry::new()),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Scrub output with `secrets` instead of the static patterns alone.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<SecretRegistry>) -> Self {
        self.secrets = secrets;
        self
    }

    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn info(&mut self, msg: &str) -> io::Result<()> {
        if self.format == OutputFormat::Cli {
            writeln!(self.out, "{}", self.secrets.scrub(msg))?;
        }
        Ok(())
    }

    pub fn warning(&mut self, msg: &str) -> io::Result<()> {
        let msg = self.secrets.scrub(msg);
        match self.format {
            OutputFormat::Cli => writeln!(self.err, "{msg}"),
            OutputFormat::Json => {
                self.warnings.push(entry(&msg, None, json!({})));
                Ok(())
            }
        }
    }

    pub fn error(&mut self, error: &Error) -> io::Result<()> {
        let msg = self.secrets.scrub(&error.to_string());
        match self.format {
            OutputFormat::Cli => writeln!(self.err, "{msg}"),
            OutputFormat::Json => {
                let info = self.scrub_value(error.additional_info());
                self.errors.push(entry(&msg, Some(error.code()), info));
                Ok(())
            }
        }
    }

    /// Error that did not come from the core library.
    pub fn error_message(&mut self, msg: &str, code: &str) -> io::Result<()> {
        let msg = self.secrets.scrub(msg);
        match self.format {
            OutputFormat::Cli => writeln!(self.err, "{msg}"),
            OutputFormat::Json => {
                self.errors.push(entry(&msg, Some(code), json!({})));
                Ok(())
            }
        }
    }

    fn scrub_value(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.secrets.scrub(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.scrub_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.scrub_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    pub fn document(&self, success: bool) -> Value {
        json!({
            "_schema_version": JSON_SCHEMA_VERSION,
            "result": if success { "success" } else { "failure" },
            "errors": self.errors,
            "warnings": self.warnings,
        })
    }

    /// Print the collected JSON document. No-op in `cli` mode.
    pub fn finish(&mut self, success: bool) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            let doc = serde_json::to_string(&self.document(success)).map_err(io::Error::other)?;
            writeln!(self.out, "{doc}")?;
        }
        self.out.flush()
    }

    /// Writers, for tests.
    pub fn into_inner(self) -> (O, E) {
        (self.out, self.err)
    }
}

fn entry(msg: &str, code: Option<&str>, additional_info: Value) -> Value {
    json!({
        "message": msg,
        "message_code": code,
        "service": Value::Null,
        "type": "system",
        "additional_info": additional_info,
    })
}
