use std::fmt::Display;

/// Per-connection request identifier, echoed back by the daemon in its reply.
pub type Token = u64;

pub const SEND_PROBE: &str = "send-probe";
pub const CHECK_SUPPORT: &str = "check-support";
pub const DNS_RESOLVE: &str = "dns-resolve";

/// A command to the probe daemon: a name plus ordered key/value arguments.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct CommandRecord {
    name: String,
    args: Vec<(String, String)>,
}

impl CommandRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Display) -> Self {
        self.args.push((key.into(), value.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn check_support(feature: &str) -> Self {
        Self::new(CHECK_SUPPORT).with_arg("feature", feature)
    }
}

/// Renders `command` as one newline-terminated protocol line.
pub fn encode(token: Token, command: &CommandRecord) -> String {
    let mut line = format!("{} {}", token, command.name);
    for (key, value) in &command.args {
        line.push(' ');
        line.push_str(key);
        line.push(' ');
        line.push_str(value);
    }
    line.push('\n');
    line
}
