mod settings;

pub use settings::{load_config_file, ConfigFile, ConfigProtocol, GatewayEntry, Settings};
