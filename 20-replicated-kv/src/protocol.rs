//! REPL command parsing for the interactive shell.
//!
//! Data commands take an optional trailing consistency level, `strong` or
//! `eventual` (also `s` / `e`). Without one they default to eventual.

use anyhow::{Result, anyhow};

use crate::node::Consistency;

/// Commands that can be entered at the REPL prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Put {
        key: String,
        value: String,
        consistency: Consistency,
    },
    Get {
        key: String,
        consistency: Consistency,
    },
    Delete {
        key: String,
        consistency: Consistency,
    },
    /// Free text gossiped to every node's log.
    Announce {
        text: String,
    },
    Keys,
    Status,
    Campaign,
    Exit,
    Help,
}

pub const HELP: &str = "\
commands (case-insensitive, aliases in brackets):
  PUT <key> <value> [strong|eventual]   (p)  store a value
  GET <key> [strong|eventual]           (g)  read a value
  DEL <key> [strong|eventual]           (d)  delete a key
  ANNOUNCE <text...>                    (a)  gossip a note to every node
  KEYS                                  (k)  list keys in the local replica
  STATUS                                (s)  role, leader, peers and store
  CAMPAIGN                              (c)  start an election from this node
  HELP                                  (h)  this text
  EXIT                                  (e)  stop the node";

impl ConsoleCommand {
    /// Parses one line of user input.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "P" => "PUT",
            "G" => "GET",
            "D" | "DELETE" => "DEL",
            "A" => "ANNOUNCE",
            "K" => "KEYS",
            "S" => "STATUS",
            "C" => "CAMPAIGN",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", 1) => return Ok(ConsoleCommand::Exit),
            ("HELP", 1) => return Ok(ConsoleCommand::Help),
            ("STATUS", 1) => return Ok(ConsoleCommand::Status),
            ("CAMPAIGN", 1) => return Ok(ConsoleCommand::Campaign),
            ("KEYS", 1) => return Ok(ConsoleCommand::Keys),
            _ => {}
        }

        match (normalized_cmd, parts.len()) {
            ("PUT", 3 | 4) => Ok(ConsoleCommand::Put {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
                consistency: consistency(parts.get(3))?,
            }),
            ("GET", 2 | 3) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
                consistency: consistency(parts.get(2))?,
            }),
            ("DEL", 2 | 3) => Ok(ConsoleCommand::Delete {
                key: parts[1].to_string(),
                consistency: consistency(parts.get(2))?,
            }),
            ("ANNOUNCE", n) if n > 1 => Ok(ConsoleCommand::Announce {
                text: parts[1..].join(" "),
            }),
            ("PUT", _) => Err(anyhow!(
                "PUT requires a key and a value: PUT <key> <value> [strong|eventual]"
            )),
            ("GET", _) => Err(anyhow!("GET requires a key: GET <key> [strong|eventual]")),
            ("DEL", _) => Err(anyhow!("DEL requires a key: DEL <key> [strong|eventual]")),
            ("ANNOUNCE", _) => Err(anyhow!("ANNOUNCE requires some text")),
            ("EXIT" | "HELP" | "STATUS" | "CAMPAIGN" | "KEYS", _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: PUT/p, GET/g, DEL/d, ANNOUNCE/a, KEYS/k, STATUS/s, CAMPAIGN/c, HELP/h, EXIT/e"
            )),
        }
    }
}

fn consistency(word: Option<&&str>) -> Result<Consistency> {
    word.map_or(Ok(Consistency::default()), |word| word.parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_commands() {
        assert!(matches!(ConsoleCommand::parse("exit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("ExIt"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("status"), Ok(ConsoleCommand::Status)));
        assert!(matches!(ConsoleCommand::parse("Keys"), Ok(ConsoleCommand::Keys)));
        assert!(matches!(ConsoleCommand::parse("CAMPAIGN"), Ok(ConsoleCommand::Campaign)));
    }

    #[test]
    fn test_aliases() {
        assert!(matches!(ConsoleCommand::parse("e"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(ConsoleCommand::parse("h"), Ok(ConsoleCommand::Help)));
        assert!(matches!(ConsoleCommand::parse("s"), Ok(ConsoleCommand::Status)));
        assert!(matches!(ConsoleCommand::parse("k"), Ok(ConsoleCommand::Keys)));
        assert!(matches!(ConsoleCommand::parse("c"), Ok(ConsoleCommand::Campaign)));
        assert_eq!(
            ConsoleCommand::parse("d foo").ok(),
            Some(ConsoleCommand::Delete {
                key: "foo".into(),
                consistency: Consistency::Eventual
            })
        );
        assert_eq!(
            ConsoleCommand::parse("P KEY VAL").ok(),
            Some(ConsoleCommand::Put {
                key: "KEY".into(),
                value: "VAL".into(),
                consistency: Consistency::Eventual
            })
        );
    }

    #[test]
    fn test_consistency_suffix() {
        assert_eq!(
            ConsoleCommand::parse("put color blue strong").ok(),
            Some(ConsoleCommand::Put {
                key: "color".into(),
                value: "blue".into(),
                consistency: Consistency::Strong
            })
        );
        assert_eq!(
            ConsoleCommand::parse("GET color S").ok(),
            Some(ConsoleCommand::Get {
                key: "color".into(),
                consistency: Consistency::Strong
            })
        );
        assert_eq!(
            ConsoleCommand::parse("g color eventual").ok(),
            Some(ConsoleCommand::Get {
                key: "color".into(),
                consistency: Consistency::Eventual
            })
        );
        assert!(ConsoleCommand::parse("get color linearizable").is_err());
    }

    #[test]
    fn test_announce_keeps_the_whole_line() {
        assert_eq!(
            ConsoleCommand::parse("a  deploy   starts now").ok(),
            Some(ConsoleCommand::Announce {
                text: "deploy starts now".into()
            })
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(ConsoleCommand::parse("").is_err());
        assert!(ConsoleCommand::parse("   ").is_err());
        assert!(ConsoleCommand::parse("INVALID").is_err());
        assert!(ConsoleCommand::parse("GET").is_err());
        assert!(ConsoleCommand::parse("PUT key").is_err());
        assert!(ConsoleCommand::parse("PUT k v strong extra").is_err());
        assert!(ConsoleCommand::parse("DEL").is_err());
        assert!(ConsoleCommand::parse("status now").is_err());
        assert!(ConsoleCommand::parse("announce").is_err());
    }
}
