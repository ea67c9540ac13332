//! Command templates with `{placeholder}` expansion.
//!
//! Templates are written in config either as a single shell-words string or
//! as an argv array. Expansion happens per argument after splitting, so a
//! substituted path containing spaces stays one argument and no shell is
//! ever involved.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Values available to a template expansion.
pub type Vars = BTreeMap<&'static str, String>;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandTemplate {
    Line(String),
    Argv(Vec<String>),
}

impl CommandTemplate {
    /// Split the template into unexpanded argv entries.
    pub fn argv(&self) -> Result<Vec<String>, String> {
        let argv = match self {
            CommandTemplate::Line(line) => shell_words::split(line)
                .map_err(|err| format!("invalid command line {line:?}: {err}"))?,
            CommandTemplate::Argv(argv) => argv.clone(),
        };
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(argv),
            _ => Err("command template must name a program".to_string()),
        }
    }

    /// Program name as written in the template (first argv entry).
    pub fn program(&self) -> Result<String, String> {
        let argv = self.argv()?;
        Ok(argv[0].clone())
    }

    /// Program basename used as a producer tag (`sct_deepseg_sc`).
    pub fn program_tag(&self) -> Result<String, String> {
        let program = self.program()?;
        Ok(std::path::Path::new(&program)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or(program))
    }

    /// Check that every placeholder is one of `allowed`.
    pub fn check_placeholders(&self, allowed: &[&str]) -> Result<(), String> {
        for arg in self.argv()? {
            for name in placeholders(&arg) {
                if !allowed.contains(&name.as_str()) {
                    return Err(format!(
                        "unknown placeholder {{{name}}} in {arg:?} (allowed: {})",
                        allowed.join(", ")
                    ));
                }
            }
        }
        Ok(())
    }

    /// Expand every argument against `vars`.
    pub fn expand(&self, vars: &Vars) -> Result<Vec<String>, String> {
        self.argv()?
            .iter()
            .map(|arg| expand_str(arg, vars))
            .collect()
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"))
}

/// Placeholder names referenced in `text`, in order of appearance.
pub fn placeholders(text: &str) -> Vec<String> {
    placeholder_re()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitute `{name}` occurrences; an unknown name is an error.
pub fn expand_str(text: &str, vars: &Vars) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(text) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let name = &caps[1];
        let value = vars
            .get(name)
            .ok_or_else(|| format!("unknown placeholder {{{name}}} in {text:?}"))?;
        out.push_str(&text[last..whole.start]);
        out.push_str(value);
        last = whole.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Render argv for logs in a copy-pasteable form.
pub fn command_line(argv: &[String]) -> String {
    shell_words::join(argv)
}
