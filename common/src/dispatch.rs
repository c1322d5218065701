use serde::Serialize;
use thiserror::Error;

use crate::{
    command::{parse_command, Command, CommandError},
    config::StorageConfig,
    program::Program,
    regulator::Regulator,
    storage::{FlashStore, StorageError},
    types::FileEntry,
};

pub const EVENT_PROGRAM_CORRUPT: &str = "program file is empty or corrupted";
pub const EVENT_INVALID_PROGRAM_MESSAGE: &str = "invalid message on topic beer/program";
pub const EVENT_NETWORK_FAILURE: &str = "network connection failed";

/// Upper bound on file content echoed back for `beer/ini`.
pub const MAX_FILE_REPLY_BYTES: usize = 256;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("{cause} (event log unavailable: {log_error})")]
    Unrecorded {
        cause: Box<DispatchError>,
        log_error: StorageError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FileReply {
    Found {
        name: String,
        size: u64,
        content: String,
        truncated: bool,
    },
    NotFound {
        name: String,
        files: Vec<FileEntry>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    ProgramApplied(Program),
    ReadingAccepted(f32),
    Files(Vec<FileEntry>),
    File(FileReply),
    Ignored,
}

/// Routes incoming messages to the regulator and the flash store.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    flash: FlashStore,
    storage: StorageConfig,
}

impl Dispatcher {
    pub fn new(flash: FlashStore, storage: StorageConfig) -> Self {
        Self { flash, storage }
    }

    pub fn flash(&self) -> &FlashStore {
        &self.flash
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn log_event(&self, message: &str) -> Result<(), StorageError> {
        self.flash.append_event(&self.storage.event_log_file, message)
    }

    /// Applies the stored program, if any. A corrupt file is logged as an
    /// event and leaves the regulator untouched.
    pub fn restore_program(
        &self,
        regulator: &mut Regulator,
    ) -> Result<Option<Program>, DispatchError> {
        match self.flash.load_program(&self.storage.program_file) {
            Ok(Some(program)) => {
                regulator.set_program(program);
                Ok(Some(program))
            }
            Ok(None) => Ok(None),
            Err(err @ StorageError::Corrupt(_)) => {
                Err(self.record(EVENT_PROGRAM_CORRUPT, err.into()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn define_program(
        &self,
        regulator: &mut Regulator,
        program: Program,
    ) -> Result<Program, DispatchError> {
        self.flash
            .save_program(&self.storage.program_file, program)?;
        match self.restore_program(regulator)? {
            Some(loaded) => Ok(loaded),
            None => Err(StorageError::NotFound(self.storage.program_file.clone()).into()),
        }
    }

    pub fn handle(
        &self,
        regulator: &mut Regulator,
        topic: &str,
        payload: &[u8],
        now_ms: u64,
    ) -> Result<Outcome, DispatchError> {
        let command = match parse_command(topic, payload, &regulator.config) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(Outcome::Ignored),
            Err(err @ CommandError::InvalidProgram(_)) => {
                return Err(self.record(EVENT_INVALID_PROGRAM_MESSAGE, err.into()));
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = match command {
            Command::SetProgram(program) => {
                Outcome::ProgramApplied(self.define_program(regulator, program)?)
            }
            Command::Temperature(temp_c) => {
                regulator.update_temperature(temp_c, now_ms);
                Outcome::ReadingAccepted(temp_c)
            }
            Command::ListFiles => Outcome::Files(self.flash.list()?),
            Command::ReadFile(name) => Outcome::File(self.read_file(&name)?),
        };

        Ok(outcome)
    }

    /// Appends `event` to the log; a failed append travels with `cause`.
    fn record(&self, event: &str, cause: DispatchError) -> DispatchError {
        match self.log_event(event) {
            Ok(()) => cause,
            Err(log_error) => DispatchError::Unrecorded {
                cause: Box::new(cause),
                log_error,
            },
        }
    }

    pub fn read_file(&self, name: &str) -> Result<FileReply, StorageError> {
        let bare = FlashStore::normalize_name(name)?.to_string();

        let files = self.flash.list()?;
        let Some(entry) = files.iter().find(|entry| entry.name == bare) else {
            return Ok(FileReply::NotFound { name: bare, files });
        };

        let contents = self.flash.read_prefix(&bare, MAX_FILE_REPLY_BYTES)?;
        Ok(FileReply::Found {
            size: entry.size,
            truncated: entry.size > contents.len() as u64,
            content: String::from_utf8_lossy(&contents).into_owned(),
            name: bare,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::RegulatorConfig, program::ProgramTable};

    fn setup() -> (tempfile::TempDir, Dispatcher, Regulator) {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(
            FlashStore::new(dir.path().join("flash")),
            StorageConfig::default(),
        );
        let regulator = Regulator::new(
            RegulatorConfig::default(),
            ProgramTable::default(),
            Program::default(),
        );
        (dir, dispatcher, regulator)
    }

    fn events(dispatcher: &Dispatcher) -> Vec<String> {
        match dispatcher.flash().read("events.log") {
            Ok(raw) => String::from_utf8(raw)
                .unwrap()
                .lines()
                .map(|line| line.split_once(' ').unwrap().1.to_string())
                .collect(),
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn program_message_persists_flag_and_applies_thresholds() {
        let (_dir, dispatcher, mut regulator) = setup();

        let outcome = dispatcher
            .handle(&mut regulator, "beer/program", b"M", 0)
            .unwrap();

        assert_eq!(outcome, Outcome::ProgramApplied(Program::Maturation));
        assert_eq!(regulator.program(), Program::Maturation);
        assert_eq!(regulator.thresholds().max_c, 2.0);
        assert_eq!(dispatcher.flash().read("program.ini").unwrap(), b"M".to_vec());
    }

    #[test]
    fn invalid_program_message_is_logged() {
        let (_dir, dispatcher, mut regulator) = setup();

        let err = dispatcher
            .handle(&mut regulator, "beer/program", b"Z", 0)
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Command(CommandError::InvalidProgram(_))
        ));
        assert_eq!(regulator.program(), Program::Fermentation);
        assert!(!dispatcher.flash().exists("program.ini"));
        assert_eq!(events(&dispatcher), vec![EVENT_INVALID_PROGRAM_MESSAGE]);
    }

    #[test]
    fn temperature_message_updates_reading() {
        let (_dir, dispatcher, mut regulator) = setup();

        let outcome = dispatcher
            .handle(&mut regulator, "beer/temperature", b"18.25", 5_000)
            .unwrap();

        assert_eq!(outcome, Outcome::ReadingAccepted(18.25));
        assert_eq!(regulator.current_temp_c(), Some(18.25));
        assert!(regulator.is_sensor_data_valid(5_000));
    }

    #[test]
    fn rejected_temperature_leaves_state_untouched() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher
            .handle(&mut regulator, "beer/temperature", b"20", 0)
            .unwrap();

        let err = dispatcher
            .handle(&mut regulator, "beer/temperature", b"hot", 10)
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Command(CommandError::NotATemperature(_))
        ));
        assert_eq!(regulator.current_temp_c(), Some(20.0));
        assert!(events(&dispatcher).is_empty());
    }

    #[test]
    fn boot_restores_stored_program() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher.flash().write("program.ini", b"P").unwrap();

        let restored = dispatcher.restore_program(&mut regulator).unwrap();

        assert_eq!(restored, Some(Program::Priming));
        assert_eq!(regulator.program(), Program::Priming);
    }

    #[test]
    fn boot_with_corrupt_program_keeps_default() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher.flash().write("program.ini", b"?").unwrap();

        assert!(matches!(
            dispatcher.restore_program(&mut regulator),
            Err(DispatchError::Storage(StorageError::Corrupt(_)))
        ));
        assert_eq!(regulator.program(), Program::Fermentation);
        assert_eq!(events(&dispatcher), vec![EVENT_PROGRAM_CORRUPT]);
    }

    #[test]
    fn ls_lists_flash_files() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher
            .handle(&mut regulator, "beer/program", b"F", 0)
            .unwrap();

        let outcome = dispatcher.handle(&mut regulator, "beer/ls", b"", 0).unwrap();

        assert_eq!(
            outcome,
            Outcome::Files(vec![FileEntry {
                name: "program.ini".to_string(),
                size: 1,
            }])
        );
    }

    #[test]
    fn ini_reads_named_file() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher
            .handle(&mut regulator, "beer/program", b"P", 0)
            .unwrap();

        let outcome = dispatcher
            .handle(&mut regulator, "beer/ini", b"/flash/program.ini", 0)
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::File(FileReply::Found {
                name: "program.ini".to_string(),
                size: 1,
                content: "P".to_string(),
                truncated: false,
            })
        );
    }

    #[test]
    fn ini_reports_missing_file_with_listing() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher
            .handle(&mut regulator, "beer/program", b"F", 0)
            .unwrap();

        let outcome = dispatcher
            .handle(&mut regulator, "beer/ini", b"missing.ini", 0)
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::File(FileReply::NotFound {
                name: "missing.ini".to_string(),
                files: vec![FileEntry {
                    name: "program.ini".to_string(),
                    size: 1,
                }],
            })
        );
    }

    #[test]
    fn ini_truncates_large_files() {
        let (_dir, dispatcher, _regulator) = setup();
        let big = vec![b'a'; MAX_FILE_REPLY_BYTES + 10];
        dispatcher.flash().write("big.txt", &big).unwrap();

        let FileReply::Found {
            size,
            content,
            truncated,
            ..
        } = dispatcher.read_file("big.txt").unwrap()
        else {
            panic!("expected file to be found");
        };

        assert_eq!(size, (MAX_FILE_REPLY_BYTES + 10) as u64);
        assert_eq!(content.len(), MAX_FILE_REPLY_BYTES);
        assert!(truncated);
    }

    #[test]
    fn unwritable_event_log_is_reported_with_cause() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher.flash().write("program.ini", b"?").unwrap();
        std::fs::create_dir(dispatcher.flash().root().join("events.log")).unwrap();

        let err = dispatcher.restore_program(&mut regulator).unwrap_err();

        let DispatchError::Unrecorded { cause, log_error } = err else {
            panic!("expected the event log failure to be reported");
        };
        assert!(matches!(
            *cause,
            DispatchError::Storage(StorageError::Corrupt(_))
        ));
        assert!(matches!(log_error, StorageError::Io { .. }));
        assert_eq!(regulator.program(), Program::Fermentation);
    }

    #[test]
    fn invalid_program_with_unwritable_log_keeps_command_error() {
        let (_dir, dispatcher, mut regulator) = setup();
        dispatcher.flash().ensure_root().unwrap();
        std::fs::create_dir(dispatcher.flash().root().join("events.log")).unwrap();

        let err = dispatcher
            .handle(&mut regulator, "beer/program", b"Q", 0)
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Unrecorded { ref cause, .. }
                if matches!(**cause, DispatchError::Command(CommandError::InvalidProgram(_)))
        ));
    }

    #[test]
    fn ini_rejects_path_escapes() {
        let (_dir, dispatcher, mut regulator) = setup();

        for name in ["../x", "/flash/../x", "sub/x"] {
            assert!(
                matches!(
                    dispatcher.handle(&mut regulator, "beer/ini", name.as_bytes(), 0),
                    Err(DispatchError::Storage(StorageError::InvalidName(_)))
                ),
                "expected `{name}` to be rejected"
            );
        }
    }

    #[test]
    fn foreign_topics_are_ignored() {
        let (_dir, dispatcher, mut regulator) = setup();

        assert_eq!(
            dispatcher
                .handle(&mut regulator, "beer/status", b"whatever", 0)
                .unwrap(),
            Outcome::Ignored
        );
    }
}
