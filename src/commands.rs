/// Control-channel commands accepted from the host application

#[derive(Debug, Clone)]
pub struct CommandSpec {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[CommandSpec] = &[
  CommandSpec {
    name: "activate-new-version",
    aliases: &["activate", "skip-waiting"],
    description: "Force immediate activation of this proxy generation",
  },
  CommandSpec {
    name: "pre-cache",
    aliases: &["precache"],
    description: "Fetch the given URLs into the static partition",
  },
  CommandSpec {
    name: "purge-all",
    aliases: &["purge"],
    description: "Delete every cache partition",
  },
];

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
  ActivateNewVersion,
  PreCache { urls: Vec<String> },
  PurgeAll,
}

/// One line per command, for host-facing error messages.
pub fn available() -> String {
  COMMANDS
    .iter()
    .map(|cmd| format!("{} ({})", cmd.name, cmd.description))
    .collect::<Vec<_>>()
    .join(", ")
}

/// Parse a command name (or alias) plus its arguments.
pub fn parse(name: &str, urls: &[String]) -> Option<ControlCommand> {
  let name = name.trim().to_lowercase();

  let spec = COMMANDS
    .iter()
    .find(|cmd| cmd.name == name || cmd.aliases.contains(&name.as_str()))?;

  match spec.name {
    "activate-new-version" => Some(ControlCommand::ActivateNewVersion),
    "pre-cache" => Some(ControlCommand::PreCache {
      urls: urls.to_vec(),
    }),
    "purge-all" => Some(ControlCommand::PurgeAll),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_by_name() {
    assert_eq!(
      parse("activate-new-version", &[]),
      Some(ControlCommand::ActivateNewVersion)
    );
    assert_eq!(parse("purge-all", &[]), Some(ControlCommand::PurgeAll));
  }

  #[test]
  fn test_parse_by_alias() {
    assert_eq!(parse("skip-waiting", &[]), Some(ControlCommand::ActivateNewVersion));
    assert_eq!(parse("purge", &[]), Some(ControlCommand::PurgeAll));
  }

  #[test]
  fn test_parse_is_case_insensitive() {
    assert_eq!(parse("  Purge-All ", &[]), Some(ControlCommand::PurgeAll));
  }

  #[test]
  fn test_pre_cache_carries_urls() {
    let urls = vec!["/".to_string(), "/assets/app.js".to_string()];
    assert_eq!(
      parse("pre-cache", &urls),
      Some(ControlCommand::PreCache { urls })
    );
  }

  #[test]
  fn test_unknown_command() {
    assert_eq!(parse("reboot", &[]), None);
  }
}
