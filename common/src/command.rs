use thiserror::Error;

use crate::{
    config::RegulatorConfig,
    program::Program,
    topics::{TOPIC_CMD_LIST_FILES, TOPIC_CMD_PROGRAM, TOPIC_CMD_READ_FILE, TOPIC_CMD_TEMPERATURE},
};

pub const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetProgram(Program),
    Temperature(f32),
    ListFiles,
    ReadFile(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("invalid message on topic beer/program: `{0}`")]
    InvalidProgram(String),
    #[error("`{0}` does not look like a temperature")]
    NotATemperature(String),
    #[error("temperature {0} is outside the valid range")]
    OutOfRange(f32),
    #[error("payload on `{topic}` is not utf-8")]
    NotUtf8 { topic: String },
    #[error("payload on `{topic}` is too large ({len} bytes)")]
    Oversized { topic: String, len: usize },
}

/// Maps a received message to a command. Topics outside the command set
/// yield `Ok(None)`.
pub fn parse_command(
    topic: &str,
    payload: &[u8],
    config: &RegulatorConfig,
) -> Result<Option<Command>, CommandError> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        return Err(CommandError::Oversized {
            topic: topic.to_string(),
            len: payload.len(),
        });
    }

    let command = match topic {
        TOPIC_CMD_PROGRAM => match Program::from_message(payload) {
            Some(program) => Command::SetProgram(program),
            None => {
                return Err(CommandError::InvalidProgram(
                    String::from_utf8_lossy(payload).into_owned(),
                ))
            }
        },
        TOPIC_CMD_TEMPERATURE => {
            let message = utf8(topic, payload)?;
            Command::Temperature(parse_temperature(message, config)?)
        }
        TOPIC_CMD_LIST_FILES => Command::ListFiles,
        TOPIC_CMD_READ_FILE => Command::ReadFile(utf8(topic, payload)?.trim().to_string()),
        _ => return Ok(None),
    };

    Ok(Some(command))
}

/// Accepts digits and `.` with an optional leading `-`. Whitespace is rejected.
pub fn parse_temperature(message: &str, config: &RegulatorConfig) -> Result<f32, CommandError> {
    let digits = message.strip_prefix('-').unwrap_or(message);

    let looks_numeric = !digits.is_empty()
        && digits.chars().any(|c| c.is_ascii_digit())
        && digits.chars().all(|c| c.is_ascii_digit() || c == '.');
    if !looks_numeric {
        return Err(CommandError::NotATemperature(message.to_string()));
    }

    let temp = message
        .parse::<f32>()
        .map_err(|_| CommandError::NotATemperature(message.to_string()))?;

    if !config.is_valid_reading(temp) {
        return Err(CommandError::OutOfRange(temp));
    }
    Ok(temp)
}

fn utf8<'a>(topic: &str, payload: &'a [u8]) -> Result<&'a str, CommandError> {
    core::str::from_utf8(payload).map_err(|_| CommandError::NotUtf8 {
        topic: topic.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(topic: &str, payload: &[u8]) -> Result<Option<Command>, CommandError> {
        parse_command(topic, payload, &RegulatorConfig::default())
    }

    #[test]
    fn program_topic_selects_by_first_byte() {
        assert_eq!(
            parse("beer/program", b"F").unwrap(),
            Some(Command::SetProgram(Program::Fermentation))
        );
        assert_eq!(
            parse("beer/program", b"Priming").unwrap(),
            Some(Command::SetProgram(Program::Priming))
        );
        assert_eq!(
            parse("beer/program", b"x"),
            Err(CommandError::InvalidProgram("x".to_string()))
        );
        assert_eq!(
            parse("beer/program", b""),
            Err(CommandError::InvalidProgram(String::new()))
        );
    }

    #[test]
    fn temperature_accepts_plain_decimals() {
        assert_eq!(
            parse("beer/temperature", b"18.5").unwrap(),
            Some(Command::Temperature(18.5))
        );
        assert_eq!(
            parse("beer/temperature", b"21").unwrap(),
            Some(Command::Temperature(21.0))
        );
        assert_eq!(
            parse("beer/temperature", b"-1.5").unwrap(),
            Some(Command::Temperature(-1.5))
        );
    }

    #[test]
    fn temperature_rejects_non_numeric_payloads() {
        for payload in [
            "", "abc", "18.5C", "1e3", "+4", "--2", ".", "1.2.3", "NaN", " 21 ", "21\r\n",
            "21\n", "\t-1.5", "- 1",
        ] {
            assert!(
                matches!(
                    parse("beer/temperature", payload.as_bytes()),
                    Err(CommandError::NotATemperature(_))
                ),
                "expected `{payload}` to be rejected"
            );
        }
    }

    #[test]
    fn temperature_rejects_out_of_range() {
        assert_eq!(
            parse("beer/temperature", b"120"),
            Err(CommandError::OutOfRange(120.0))
        );
    }

    #[test]
    fn file_topics() {
        assert_eq!(parse("beer/ls", b"").unwrap(), Some(Command::ListFiles));
        assert_eq!(
            parse("beer/ini", b"/flash/program.ini").unwrap(),
            Some(Command::ReadFile("/flash/program.ini".to_string()))
        );
    }

    #[test]
    fn non_utf8_payloads_are_rejected() {
        for topic in ["beer/temperature", "beer/ini"] {
            assert_eq!(
                parse(topic, &[0xff, 0xfe, b'1']),
                Err(CommandError::NotUtf8 {
                    topic: topic.to_string(),
                })
            );
        }
    }

    #[test]
    fn payload_at_size_limit_is_accepted() {
        let name = "a".repeat(MAX_MQTT_PAYLOAD_BYTES);

        assert_eq!(
            parse("beer/ini", name.as_bytes()).unwrap(),
            Some(Command::ReadFile(name.clone()))
        );
    }

    #[test]
    fn unknown_topics_are_ignored() {
        assert_eq!(parse("beer/unknown", b"F").unwrap(), None);
        assert_eq!(parse("freezer/alive", b"Alive").unwrap(), None);
    }

    #[test]
    fn oversized_payload_is_dropped() {
        let payload = vec![b'1'; MAX_MQTT_PAYLOAD_BYTES + 1];

        assert!(matches!(
            parse("beer/temperature", &payload),
            Err(CommandError::Oversized { len, .. }) if len == MAX_MQTT_PAYLOAD_BYTES + 1
        ));
    }
}
