//! Assembly of the bash program piped to `/bin/bash -eu -`.
//!
//! The user's script is never handed to bash bare: it is wrapped in a
//! prelude that defines the control-marker functions, exports the
//! environment, and isolates the script body from the stdin stream that
//! carries the assembled program itself.

use std::fmt::Write;

use spread_core::Environment;

/// How a script's output is captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Combined stdout/stderr with `set -x` tracing enabled.
    Trace,
    /// Combined stdout/stderr.
    Combined,
    /// Separate stdout and stderr streams.
    Split,
    /// Interactive session on the caller's terminal.
    Shell,
}

const REBOOT_FN: &str = "REBOOT() { { set +xu; } 2> /dev/null; [ -z \"$1\" ] && echo '<REBOOT>' || echo \"<REBOOT $1>\"; exit 213; }\n";

const ADDRESS_FN: &str = "ADDRESS() { { set +xu; } 2> /dev/null; [ -z \"$1\" ] && echo '<ADDRESS>' || echo \"<ADDRESS $1>\"; }\n";
const FATAL_FN: &str = "FATAL() { { set +xu; } 2> /dev/null; [ -z \"$1\" ] && echo '<FATAL>' || echo \"<FATAL $@>\"; exit 213; }\n";
const ERROR_FN: &str = "ERROR() { { set +xu; } 2> /dev/null; [ -z \"$1\" ] && echo '<ERROR>' || echo \"<ERROR $@>\"; exit 213; }\n";

/// Assembles the stdin program for a remote session.
///
/// Returns empty bytes when the user script is blank; callers short-circuit
/// without opening a session.
#[must_use]
pub fn assemble_remote(script: &str, dir: &str, env: &Environment, mode: OutputMode) -> Vec<u8> {
    let script = script.trim();
    if script.is_empty() {
        return Vec::new();
    }

    let mut buf = String::new();
    if !dir.is_empty() {
        let _ = writeln!(buf, "cd \"{dir}\"");
    }
    buf.push_str(REBOOT_FN);
    push_exports(&mut buf, env);
    if mode == OutputMode::Shell {
        if let Some(ps1) = env.get("PS1").filter(|value| !value.is_empty()) {
            let _ = writeln!(buf, "echo PS1=\\''{ps1}'\\' > /root/.bashrc");
        }
    }
    push_trace(&mut buf, mode);
    push_body(&mut buf, script, mode != OutputMode::Shell);
    buf.into_bytes()
}

/// Assembles the stdin program for a locally spawned bash.
///
/// The working directory is handled by the process spawn, not the script,
/// and the control functions are the harness set: `ADDRESS`, `FATAL`,
/// `ERROR`.
#[must_use]
pub fn assemble_local(script: &str, env: &Environment, mode: OutputMode) -> Vec<u8> {
    let script = script.trim();
    if script.is_empty() {
        return Vec::new();
    }

    let mut buf = String::new();
    buf.push_str(ADDRESS_FN);
    buf.push_str(FATAL_FN);
    buf.push_str(ERROR_FN);
    push_exports(&mut buf, env);
    push_trace(&mut buf, mode);
    push_body(&mut buf, script, true);
    buf.into_bytes()
}

fn push_exports(buf: &mut String, env: &Environment) {
    buf.push_str("export DEBIAN_FRONTEND=noninteractive\n");
    buf.push_str("export DEBIAN_PRIORITY=critical\n");
    for key in env.keys() {
        let value = env.get(key).unwrap_or_default();
        // Values opening with a quote are taken as pre-quoted.
        if value.is_empty() || value.starts_with('"') || value.starts_with('\'') {
            let _ = writeln!(buf, "export {key}={value}");
        } else {
            let _ = writeln!(buf, "export {key}=\"{value}\"");
        }
    }
}

fn push_trace(buf: &mut String, mode: OutputMode) {
    if mode == OutputMode::Trace {
        // Tracing starts after the exports so secrets don't echo.
        buf.push_str("set -x\n");
    }
}

fn push_body(buf: &mut String, script: &str, isolate_stdin: bool) {
    if isolate_stdin {
        // The subshell reads from /dev/null so user commands cannot drain
        // the rest of the assembled program off the session's stdin.
        let _ = write!(buf, "\n(\n{script}\n\n) < /dev/null\n");
    } else {
        let _ = write!(buf, "\n{script}\n\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembled(script: &str, dir: &str, env: &Environment, mode: OutputMode) -> String {
        String::from_utf8(assemble_remote(script, dir, env, mode)).expect("utf-8 script")
    }

    #[test]
    fn blank_scripts_assemble_to_nothing() {
        let env = Environment::new();
        assert!(assemble_remote("  \n\t", "", &env, OutputMode::Combined).is_empty());
        assert!(assemble_local("", &env, OutputMode::Combined).is_empty());
    }

    #[test]
    fn working_directory_comes_first() {
        let env = Environment::new();
        let text = assembled("true", "/var/tmp", &env, OutputMode::Combined);
        assert!(text.starts_with("cd \"/var/tmp\"\n"));
    }

    #[test]
    fn remote_scripts_define_the_reboot_function() {
        let env = Environment::new();
        let text = assembled("true", "", &env, OutputMode::Combined);
        assert!(text.starts_with("REBOOT() {"));
        assert!(text.contains("exit 213"));
        assert!(!text.contains("FATAL()"));
    }

    #[test]
    fn local_scripts_define_the_harness_functions() {
        let env = Environment::new();
        let text =
            String::from_utf8(assemble_local("true", &env, OutputMode::Combined)).expect("utf-8");
        for name in ["ADDRESS()", "FATAL()", "ERROR()"] {
            assert!(text.contains(name), "missing {name}");
        }
        assert!(!text.contains("REBOOT()"));
    }

    #[test]
    fn exports_follow_declaration_order_with_the_quoting_rule() {
        let env: Environment = [("A", ""), ("B", "\"x\""), ("C", "y z")].into_iter().collect();
        let text = assembled("true", "", &env, OutputMode::Combined);
        let a = text.find("export A=\n").expect("raw empty export");
        let b = text.find("export B=\"x\"\n").expect("pre-quoted export");
        let c = text.find("export C=\"y z\"\n").expect("quoted export");
        assert!(a < b && b < c);
        assert_eq!(text.matches("export A=").count(), 1);
        assert_eq!(text.matches("export B=").count(), 1);
        assert_eq!(text.matches("export C=").count(), 1);
    }

    #[test]
    fn fixed_exports_are_always_present() {
        let env = Environment::new();
        let text = assembled("true", "", &env, OutputMode::Split);
        assert!(text.contains("export DEBIAN_FRONTEND=noninteractive\n"));
        assert!(text.contains("export DEBIAN_PRIORITY=critical\n"));
    }

    #[test]
    fn trace_mode_enables_xtrace_after_the_exports() {
        let env: Environment = [("SECRET", "hunter2")].into_iter().collect();
        let text = assembled("true", "", &env, OutputMode::Trace);
        let export = text.find("export SECRET=").expect("export present");
        let xtrace = text.find("set -x\n").expect("xtrace present");
        assert!(export < xtrace);
    }

    #[test]
    fn non_shell_bodies_are_isolated_from_stdin() {
        let env = Environment::new();
        let text = assembled("echo hi", "", &env, OutputMode::Combined);
        assert!(text.contains("\n(\necho hi\n\n) < /dev/null\n"));
    }

    #[test]
    fn shell_bodies_run_unwrapped() {
        let env = Environment::new();
        let text = assembled("echo hi", "", &env, OutputMode::Shell);
        assert!(!text.contains("< /dev/null"));
        assert!(text.ends_with("\necho hi\n\n"));
    }

    #[test]
    fn shell_mode_preserves_a_configured_prompt() {
        let env: Environment = [("PS1", "spread> ")].into_iter().collect();
        let text = assembled("true", "", &env, OutputMode::Shell);
        assert!(text.contains("echo PS1=\\''spread> '\\' > /root/.bashrc\n"));
        let no_prompt = assembled("true", "", &Environment::new(), OutputMode::Shell);
        assert!(!no_prompt.contains("/root/.bashrc"));
    }
}
