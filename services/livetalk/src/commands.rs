/// One line typed at the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Start,
    Stop,
    Mute(bool),
    Voice(String),
    TextMode(bool),
    Say(String),
    Quit,
    Help,
    Nothing,
}

pub const HELP: &str = "commands: /start /stop /mute /unmute /voice <name> /text on|off /quit; anything else is sent as text";

impl HostCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Nothing);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::Say(line.to_string()));
        };

        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match (name, arg) {
            ("start", "") => Ok(Self::Start),
            ("stop", "") => Ok(Self::Stop),
            ("mute", "") => Ok(Self::Mute(true)),
            ("unmute", "") => Ok(Self::Mute(false)),
            ("voice", "") => Err("usage: /voice <name>".to_string()),
            ("voice", voice) => Ok(Self::Voice(voice.to_string())),
            ("text", "on") => Ok(Self::TextMode(true)),
            ("text", "off") => Ok(Self::TextMode(false)),
            ("text", _) => Err("usage: /text on|off".to_string()),
            ("quit" | "exit", "") => Ok(Self::Quit),
            ("help", _) => Ok(Self::Help),
            _ => Err(format!("unknown command '/{command}'")),
        }
    }
}
