//! Command line construction for `marimo edit` / `marimo run`.
//!
//! The flag spelling and order must match what the marimo CLI accepts, so
//! the builder appends arguments in a fixed sequence regardless of the
//! order in which setters are called.

use std::fmt;

/// Which marimo subcommand to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarimoMode {
    #[default]
    Edit,
    Run,
}

impl fmt::Display for MarimoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarimoMode::Edit => write!(f, "edit"),
            MarimoMode::Run => write!(f, "run"),
        }
    }
}

/// How to invoke marimo itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Executable {
    /// Bare `marimo` from PATH.
    #[default]
    Marimo,
    /// An explicit path to the marimo executable.
    Path(String),
    /// `<python> -m marimo`.
    PythonModule(String),
}

impl Executable {
    /// Pick the executable from the configured marimo path, falling back to
    /// a python interpreter, then to `marimo` on PATH.
    pub fn resolve(marimo_path: Option<&str>, python_path: Option<&str>) -> Self {
        let non_empty = |s: &&str| !s.trim().is_empty();
        if let Some(path) = marimo_path.filter(non_empty) {
            return Executable::Path(path.to_string());
        }
        if let Some(python) = python_path.filter(non_empty) {
            return Executable::PythonModule(python.to_string());
        }
        Executable::Marimo
    }

    fn words(&self) -> Vec<String> {
        match self {
            Executable::Marimo => vec!["marimo".to_string()],
            Executable::Path(path) => vec![quote(path)],
            Executable::PythonModule(python) => {
                vec![quote(python), "-m".to_string(), "marimo".to_string()]
            }
        }
    }
}

/// Builder for the shell command that starts a marimo server.
#[derive(Debug, Clone, Default)]
pub struct MarimoCmdBuilder {
    executable: Executable,
    debug: bool,
    mode: MarimoMode,
    file_or_dir: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    headless: bool,
    enable_token: bool,
    token_password: Option<String>,
    sandbox: bool,
    watch: bool,
}

impl MarimoCmdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executable(mut self, executable: Executable) -> Self {
        self.executable = executable;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn mode(mut self, mode: MarimoMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn file_or_dir(mut self, file_or_dir: impl Into<String>) -> Self {
        self.file_or_dir = Some(file_or_dir.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn enable_token(mut self, enable_token: bool) -> Self {
        self.enable_token = enable_token;
        self
    }

    pub fn token_password(mut self, password: Option<String>) -> Self {
        self.token_password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Render the command as a single shell line.
    pub fn build(&self) -> String {
        let mut words = self.executable.words();
        if self.debug {
            words.push("-d".to_string());
        }
        words.push(self.mode.to_string());
        if let Some(ref target) = self.file_or_dir {
            words.push(quote(target));
        }
        if let Some(ref host) = self.host {
            if !host.is_empty() {
                words.push(format!("--host={}", quote(host)));
            }
        }
        if let Some(port) = self.port {
            words.push(format!("--port={}", port));
        }
        if self.headless {
            words.push("--headless".to_string());
        }
        // --no-token and --token-password are mutually exclusive
        if !self.enable_token {
            words.push("--no-token".to_string());
        } else if let Some(ref password) = self.token_password {
            words.push(format!("--token-password={}", quote(password)));
        }
        if self.sandbox {
            words.push("--sandbox".to_string());
        }
        if self.watch {
            words.push("--watch".to_string());
        }
        words.join(" ")
    }
}

/// Characters that never need quoting on a `sh -c` line.
fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ',')
}

/// Quote a single shell word. Plain words pass through unchanged; anything
/// else is double-quoted with `"`, `$`, backtick and backslash escaped.
fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_plain) {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '$' | '`' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Extract the `--port=` value from a command built by [`MarimoCmdBuilder`].
pub fn port_from_command(command: &str) -> Option<u16> {
    command
        .split_whitespace()
        .find_map(|word| word.strip_prefix("--port="))
        .and_then(|port| port.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> MarimoCmdBuilder {
        MarimoCmdBuilder::new()
            .mode(MarimoMode::Edit)
            .file_or_dir("path/to/file")
            .host("localhost")
            .port(2718)
            .headless(true)
    }

    #[test]
    fn test_build_without_token() {
        let cmd = base().debug(false).enable_token(false).build();
        assert_eq!(
            cmd,
            "marimo edit path/to/file --host=localhost --port=2718 --headless --no-token"
        );
    }

    #[test]
    fn test_build_with_debug_and_password() {
        let cmd = base()
            .debug(true)
            .enable_token(true)
            .token_password(Some("secret".to_string()))
            .build();
        assert_eq!(
            cmd,
            "marimo -d edit path/to/file --host=localhost --port=2718 --headless --token-password=secret"
        );
    }

    #[test]
    fn test_path_with_space_is_quoted() {
        let cmd = MarimoCmdBuilder::new()
            .file_or_dir("my notebooks/app.py")
            .port(2818)
            .build();
        assert_eq!(cmd, "marimo edit \"my notebooks/app.py\" --port=2818 --no-token");
    }

    #[test]
    fn test_password_with_space_is_one_word() {
        let cmd = MarimoCmdBuilder::new()
            .file_or_dir("nb.py")
            .port(2718)
            .enable_token(true)
            .token_password(Some("my secret".to_string()))
            .build();
        assert_eq!(
            cmd,
            "marimo edit nb.py --port=2718 --token-password=\"my secret\""
        );
    }

    #[test]
    fn test_shell_metacharacters_are_escaped() {
        assert_eq!(quote("plain-Value_1.py"), "plain-Value_1.py");
        assert_eq!(quote("a$b"), "\"a\\$b\"");
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote("`id`"), "\"\\`id\\`\"");
        assert_eq!(quote("a;b&c"), "\"a;b&c\"");
        assert_eq!(quote(""), "\"\"");
    }

    #[cfg(unix)]
    #[test]
    fn test_quoted_password_survives_the_shell() {
        let password = "p$ss \"w`o`rd\\";
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("printf %s {}", quote(password)))
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), password);
    }

    #[test]
    fn test_password_ignored_without_token() {
        let cmd = base()
            .enable_token(false)
            .token_password(Some("secret".to_string()))
            .build();
        assert!(cmd.ends_with("--no-token"));
        assert!(!cmd.contains("--token-password"));
    }

    #[test]
    fn test_sandbox_and_watch_flags() {
        let cmd = base().sandbox(true).watch(true).mode(MarimoMode::Run).build();
        assert_eq!(
            cmd,
            "marimo run path/to/file --host=localhost --port=2718 --headless --no-token --sandbox --watch"
        );
    }

    #[test]
    fn test_executable_resolution() {
        assert_eq!(Executable::resolve(None, None), Executable::Marimo);
        assert_eq!(
            Executable::resolve(Some("  "), Some("/usr/bin/python3")),
            Executable::PythonModule("/usr/bin/python3".into())
        );
        assert_eq!(
            Executable::resolve(Some("/opt/marimo"), Some("/usr/bin/python3")),
            Executable::Path("/opt/marimo".into())
        );
    }

    #[test]
    fn test_python_module_executable() {
        let cmd = MarimoCmdBuilder::new()
            .executable(Executable::PythonModule("/my env/python".into()))
            .file_or_dir("nb.py")
            .port(1)
            .build();
        assert!(cmd.starts_with("\"/my env/python\" -m marimo edit nb.py"));
    }

    #[test]
    fn test_port_from_command() {
        let cmd = base().build();
        assert_eq!(port_from_command(&cmd), Some(2718));
        assert_eq!(port_from_command("marimo edit"), None);
    }
}
