/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/start [context]`
    Start(Option<String>),
    Interrupt,
    Quit,
    /// Anything that is not a command is sent as a text turn.
    Say(String),
}

impl Command {
    /// Parses a prompt line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        let command = match head {
            "/start" => Command::Start((!rest.is_empty()).then(|| rest.to_string())),
            "/interrupt" => Command::Interrupt,
            "/quit" | "/exit" => Command::Quit,
            _ => Command::Say(line.to_string()),
        };
        Some(command)
    }
}
