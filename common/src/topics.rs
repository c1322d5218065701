pub const TOPIC_SUBSCRIPTION: &str = "beer/#";

pub const TOPIC_CMD_PROGRAM: &str = "beer/program";
pub const TOPIC_CMD_TEMPERATURE: &str = "beer/temperature";
pub const TOPIC_CMD_LIST_FILES: &str = "beer/ls";
pub const TOPIC_CMD_READ_FILE: &str = "beer/ini";

// Outbound topics stay outside `beer/` so the device never hears itself.
pub const TOPIC_ALIVE: &str = "freezer/alive";
pub const TOPIC_STATE: &str = "freezer/state";
pub const TOPIC_FILES: &str = "freezer/files";
pub const TOPIC_FILE: &str = "freezer/file";

pub const ALIVE_STARTING: &str = "Starting";
pub const ALIVE_RUNNING: &str = "Alive";
