pub mod command;
pub mod config;
pub mod dispatch;
pub mod program;
pub mod regulator;
pub mod storage;
pub mod topics;
pub mod types;

pub use command::{parse_command, Command, CommandError};
pub use config::{RegulatorConfig, RelayConfig, RuntimeConfig, StorageConfig};
pub use dispatch::{Dispatcher, DispatchError, FileReply, Outcome};
pub use program::{Program, ProgramTable, Thresholds};
pub use regulator::Regulator;
pub use storage::{FlashStore, StorageError};
pub use topics::*;
pub use types::{FileEntry, RegulatorState, RegulatorStatePayload, RegulatorStatus, Relay, RelayAction};
