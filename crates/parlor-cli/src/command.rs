/// One line of REPL input.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Rooms,
    Join(String),
    Leave,
    Resync,
    Typing,
    Quit,
    Say(String),
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Say(line.to_string());
        };

        let (verb, arg) = match rest.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (rest, ""),
        };
        match verb {
            "rooms" => Command::Rooms,
            "join" if !arg.is_empty() => Command::Join(arg.to_string()),
            "leave" => Command::Leave,
            "resync" => Command::Resync,
            "typing" => Command::Typing,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(Command::parse("/rooms"), Command::Rooms);
        assert_eq!(Command::parse("  /join  general "), Command::Join("general".into()));
        assert_eq!(Command::parse("/join"), Command::Unknown("/join".into()));
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("hello there"), Command::Say("hello there".into()));
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse("/nope"), Command::Unknown("/nope".into()));
    }
}
