use crate::protocol::SERVER_TO_CLIENT_CAP;

const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Version this client was built against. When set, a first session
    /// announcing a newer server version forces a reload; later sessions are
    /// checked against the previously recorded server version.
    pub client_version: Option<String>,
    pub outbound_queue_cap: usize,
    pub max_inbound_frame: usize,
    /// Enables the debug control entry point.
    pub debug_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_version: None,
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            max_inbound_frame: SERVER_TO_CLIENT_CAP,
            debug_enabled: false,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            client_version: lookup("SCRIPTSYNC_CLIENT_VERSION")
                .map(|raw| raw.trim().to_string())
                .filter(|value| !value.is_empty())
                .or(defaults.client_version),
            outbound_queue_cap: parse_positive(lookup("SCRIPTSYNC_OUTBOUND_QUEUE_CAP"))
                .unwrap_or(defaults.outbound_queue_cap),
            max_inbound_frame: parse_positive(lookup("SCRIPTSYNC_MAX_FRAME"))
                .unwrap_or(defaults.max_inbound_frame),
            debug_enabled: lookup("SCRIPTSYNC_DEBUG")
                .map(|raw| is_truthy(&raw))
                .unwrap_or(defaults.debug_enabled),
        }
    }
}

fn parse_positive(raw: Option<String>) -> Option<usize> {
    raw.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> SessionConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SessionConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(config_from(&[]), SessionConfig::default());
    }

    #[test]
    fn env_overrides_are_parsed() {
        let config = config_from(&[
            ("SCRIPTSYNC_CLIENT_VERSION", " 1.30.0 "),
            ("SCRIPTSYNC_OUTBOUND_QUEUE_CAP", "16"),
            ("SCRIPTSYNC_DEBUG", "Yes"),
        ]);
        assert_eq!(config.client_version.as_deref(), Some("1.30.0"));
        assert_eq!(config.outbound_queue_cap, 16);
        assert!(config.debug_enabled);
    }

    #[test]
    fn invalid_capacity_falls_back() {
        let config = config_from(&[
            ("SCRIPTSYNC_OUTBOUND_QUEUE_CAP", "0"),
            ("SCRIPTSYNC_MAX_FRAME", "lots"),
        ]);
        assert_eq!(config.outbound_queue_cap, DEFAULT_OUTBOUND_QUEUE_CAP);
        assert_eq!(config.max_inbound_frame, SERVER_TO_CLIENT_CAP);
    }
}
