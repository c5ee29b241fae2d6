use std::{env, path::PathBuf};

use dirs;

/// Configuration directory name under the user's `.config` directory
pub const CONFIG_DIR_NAME: &str = "telestream";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config";

/// Environment variable overriding the configuration file location
pub const CONFIG_FILE_ENV: &str = "TELESTREAM_CONFIG_FILE";

/// Environment variable overriding the configured password
pub const PASSWORD_ENV: &str = "TELESTREAM_PASSWORD";

/// Path of the MQTT-over-WebSocket endpoint
pub const MQTT_PATH: &str = "/mqtt";

/// WebSocket subprotocol announced during the upgrade
pub const MQTT_SUBPROTOCOL: &str = "mqtt";

/// Signing scope service name of the AWS IoT data plane
pub const IOT_SERVICE_NAME: &str = "iotdevicegateway";

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Prefix of the per-attempt MQTT client identifier
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "telestream";

/// Envelope `type` values that mark protocol chatter rather than telemetry
pub const CONTROL_MESSAGE_TYPES: &[&str] = &["heartbeat", "connection_ack", "connected", "ping"];

/// Get the configuration file path
/// Respects TELESTREAM_CONFIG_FILE environment variable if set
pub fn get_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_FILE_ENV) {
        return Some(PathBuf::from(path));
    }

    // ~/.config/telestream/config on every platform
    dirs::home_dir().map(|home| {
        home.join(".config")
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_config_path_with_env() {
        let original = env::var(CONFIG_FILE_ENV).ok();

        unsafe {
            env::set_var(CONFIG_FILE_ENV, "/custom/telestream/config");
        }
        let path = get_config_path();
        assert_eq!(path, Some(PathBuf::from("/custom/telestream/config")));

        unsafe {
            match original {
                Some(val) => env::set_var(CONFIG_FILE_ENV, val),
                None => env::remove_var(CONFIG_FILE_ENV),
            }
        }
    }

    #[test]
    #[serial]
    fn test_get_config_path_default() {
        let original = env::var(CONFIG_FILE_ENV).ok();

        unsafe {
            env::remove_var(CONFIG_FILE_ENV);
        }
        let path = get_config_path();

        if let Some(p) = path {
            let path_str = p.to_string_lossy();
            assert!(path_str.contains(CONFIG_DIR_NAME));
            assert!(path_str.ends_with(CONFIG_FILE_NAME));
        }

        unsafe {
            if let Some(val) = original {
                env::set_var(CONFIG_FILE_ENV, val);
            }
        }
    }
}
