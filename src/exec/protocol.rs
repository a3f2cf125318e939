//! Shell-injection protocol.
//!
//! A session starts a bare shell in the container and drives it by writing
//! lines to its stdin: an optional `cd`, one `export` per variable, the quoted
//! command, then `exit` so the shell terminates once the command finishes.
//! The exit code comes from the channel, never from parsing output.

use crate::exec::env::{self, EnvMap};

/// Placeholder written in place of masked tokens in logged output.
pub const MASK: &str = "********";
pub const EXIT: &str = "exit";
pub const NEWLINE: &str = "\n";
/// Interrupt byte sent before `exit` when killing the remote process.
pub const CTRL_C: u8 = 0x03;
pub const LOG_PREFIX: &str = "Executing command: ";

/// Escape command tokens for embedding in double quotes: `$$` becomes `\$`
/// and `"` becomes `\"`.
pub fn fix_command_tokens<S: AsRef<str>>(tokens: &[S]) -> Vec<String> {
    tokens
        .iter()
        .map(|t| t.as_ref().replace("$$", r"\$").replace('"', r#"\""#))
        .collect()
}

pub fn cd_statement(dir: &str) -> String {
    format!("cd \"{}\"", dir)
}

/// The command as sent to the shell: every token double-quoted and followed
/// by a space.
pub fn command_line(tokens: &[String]) -> String {
    tokens.iter().map(|t| format!("\"{}\" ", t)).collect()
}

/// The command as logged: same shape as [`command_line`], with masked tokens
/// replaced by [`MASK`]. Tokens past the end of `masks` are not masked.
pub fn masked_command_line(tokens: &[String], masks: &[bool]) -> String {
    tokens
        .iter()
        .enumerate()
        .map(|(i, t)| {
            if masks.get(i).copied().unwrap_or(false) {
                format!("{} ", MASK)
            } else {
                format!("\"{}\" ", t)
            }
        })
        .collect()
}

/// Everything a session writes to the remote shell for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// `cd` and `export` lines, written while caller output is muted
    pub preamble: Vec<String>,
    /// Command line sent to the shell, unmasked
    pub command: String,
    /// Command line safe to log
    pub logged_command: String,
}

impl Script {
    pub fn build(working_dir: Option<&str>, env: &EnvMap, tokens: &[String], masks: &[bool]) -> Self {
        let mut preamble = Vec::new();
        if let Some(dir) = working_dir {
            preamble.push(cd_statement(dir));
        }
        preamble.extend(env::export_statements(env));

        let tokens = fix_command_tokens(tokens);
        Self {
            preamble,
            command: command_line(&tokens),
            logged_command: masked_command_line(&tokens, masks),
        }
    }

    pub fn preamble_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for line in &self.preamble {
            out.push_str(line);
            out.push_str(NEWLINE);
        }
        out.into_bytes()
    }

    /// Command line followed by the `exit` sentinel.
    pub fn command_bytes(&self) -> Vec<u8> {
        format!("{}{}{}{}", self.command, NEWLINE, EXIT, NEWLINE).into_bytes()
    }

    /// Diagnostic line recorded for the command.
    pub fn log_line(&self) -> String {
        format!("{}{}{}", LOG_PREFIX, self.logged_command, NEWLINE)
    }
}

/// Bytes written to stdin to kill the remote process.
pub fn kill_sequence() -> Vec<u8> {
    let mut bytes = vec![CTRL_C];
    bytes.extend_from_slice(EXIT.as_bytes());
    bytes.extend_from_slice(NEWLINE.as_bytes());
    bytes
}

/// Command killing every process whose environment carries `var=value`.
///
/// The backticks are escaped so the substitution runs in the inner `sh -c`,
/// not in the shell the command is typed into.
pub fn cookie_kill_command(var: &str, value: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "kill \\`grep -l '{}={}' /proc/*/environ | cut -d / -f 3 \\`",
            var, value
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn masked_tokens_are_replaced_in_log_only() {
        let cmd = tokens(&["deploy", "--token", "s3cr3t", "--verbose"]);
        let masks = [false, false, true, false];
        let script = Script::build(None, &EnvMap::new(), &cmd, &masks);

        assert_eq!(script.command, "\"deploy\" \"--token\" \"s3cr3t\" \"--verbose\" ");
        assert_eq!(script.logged_command, "\"deploy\" \"--token\" ******** \"--verbose\" ");
        assert!(!script.log_line().contains("s3cr3t"));
        assert!(String::from_utf8(script.command_bytes()).unwrap().contains("s3cr3t"));
    }

    #[test]
    fn unmasked_tokens_survive_byte_for_byte() {
        let cmd = tokens(&["a b", "ünï", "x"]);
        let logged = masked_command_line(&cmd, &[false, true, false]);
        let parts: Vec<&str> = logged.split("\" ").collect();
        assert_eq!(parts[0], "\"a b");
        assert!(logged.contains(MASK));
        assert!(logged.ends_with("\"x\" "));
    }

    #[test]
    fn short_mask_leaves_remaining_tokens_visible() {
        let cmd = tokens(&["one", "two", "three"]);
        assert_eq!(masked_command_line(&cmd, &[true]), "******** \"two\" \"three\" ");
        assert_eq!(masked_command_line(&cmd, &[]), command_line(&cmd));
    }

    #[test]
    fn command_tokens_are_escaped() {
        let fixed = fix_command_tokens(&["echo", "$$HOME", "say \"hi\""]);
        assert_eq!(fixed, vec!["echo", r"\$HOME", r#"say \"hi\""#]);
    }

    #[test]
    fn script_writes_cd_exports_command_and_exit() {
        let mut env = EnvMap::new();
        env.insert("FOO".to_string(), "it's".to_string());
        env.insert("not-valid".to_string(), "x".to_string());

        let script = Script::build(Some("/work/dir"), &env, &tokens(&["make", "test"]), &[]);
        assert_eq!(
            String::from_utf8(script.preamble_bytes()).unwrap(),
            "cd \"/work/dir\"\nexport FOO='it'\\''s'\n"
        );
        assert_eq!(
            String::from_utf8(script.command_bytes()).unwrap(),
            "\"make\" \"test\" \nexit\n"
        );
        assert_eq!(script.log_line(), "Executing command: \"make\" \"test\" \n");
    }

    #[test]
    fn cookie_kill_greps_process_environments() {
        let cmd = cookie_kill_command("BUILD_COOKIE", "abc123");
        assert_eq!(cmd[..2], ["sh", "-c"]);
        assert_eq!(
            cmd[2],
            r"kill \`grep -l 'BUILD_COOKIE=abc123' /proc/*/environ | cut -d / -f 3 \`"
        );
    }

    #[test]
    fn cookie_kill_substitution_survives_outer_quoting() {
        let command = cookie_kill_command("BUILD_COOKIE", "abc123");
        let script = Script::build(None, &EnvMap::new(), &command, &[]);
        let typed = String::from_utf8(script.command_bytes()).unwrap();
        assert!(typed.starts_with(
            r#""sh" "-c" "kill \`grep -l 'BUILD_COOKIE=abc123' /proc/*/environ | cut -d / -f 3 \`" "#
        ));
    }

    #[test]
    fn kill_sequence_is_interrupt_then_exit() {
        assert_eq!(kill_sequence(), b"\x03exit\n".to_vec());
    }
}
