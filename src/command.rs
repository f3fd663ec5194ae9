/// Command grammar of the interactive console.
///
/// Every command has a textual and a numeric spelling; both resolve to the
/// same [`CommandKind`]. Matching happens on the ASCII-lowercased input, so
/// `EXIT;`, `Exit;` and `04` are the same command.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Leave the console and resume normal operation.
    Work,
    Info,
    Help,
    /// Tear everything down and exit the process.
    Exit,
}

/// One row of the dispatch table.
#[derive(Debug)]
pub struct CommandSpec {
    pub kind: CommandKind,
    pub text: &'static str,
    pub code: &'static str,
    pub summary: &'static str,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        kind: CommandKind::Work,
        text: "work;",
        code: "01",
        summary: "leave command mode and resume work",
    },
    CommandSpec {
        kind: CommandKind::Info,
        text: "info;",
        code: "02",
        summary: "show system information",
    },
    CommandSpec {
        kind: CommandKind::Help,
        text: "help;",
        code: "03",
        summary: "show this help",
    },
    CommandSpec {
        kind: CommandKind::Exit,
        text: "exit;",
        code: "04",
        summary: "shut down and exit",
    },
];

impl CommandKind {
    /// Resolve an already normalized command string.
    pub fn lookup(normalized: &str) -> Option<CommandKind> {
        COMMANDS
            .iter()
            .find(|spec| spec.text == normalized || spec.code == normalized)
            .map(|spec| spec.kind)
    }

    pub fn spec(&self) -> &'static CommandSpec {
        // Every kind has exactly one row
        COMMANDS
            .iter()
            .find(|spec| spec.kind == *self)
            .unwrap_or(&COMMANDS[0])
    }
}

/// What the console should do with one line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Empty,
    Known(CommandKind),
    Unknown,
}

/// One line typed by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub raw_input: String,
    pub normalized: String,
}

impl CommandRecord {
    pub fn new(raw_input: impl Into<String>) -> Self {
        let raw_input = raw_input.into();
        let normalized = raw_input.to_ascii_lowercase();
        Self {
            raw_input,
            normalized,
        }
    }

    pub fn classify(&self) -> Classified {
        if self.normalized.is_empty() {
            return Classified::Empty;
        }
        match CommandKind::lookup(&self.normalized) {
            Some(kind) => Classified::Known(kind),
            None => Classified::Unknown,
        }
    }
}
