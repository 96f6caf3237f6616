//! Version information for forkpool.

/// forkpool version from Cargo.toml
pub const FORKPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision of the master/worker wire protocol.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub forkpool: &'static str,
    pub protocol: u32,
    /// Name of the job handler the binary runs, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            forkpool: FORKPOOL_VERSION,
            protocol: PROTOCOL_VERSION,
            handler: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.forkpool, FORKPOOL_VERSION);
        assert!(info.handler.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            forkpool: "0.1.0",
            protocol: 1,
            handler: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "forkpool": "0.1.0",
          "protocol": 1
        }
        "#);
    }

    #[test]
    fn version_info_serializes_with_handler() {
        let info = VersionInfo {
            forkpool: "0.1.0",
            protocol: 1,
            handler: None,
        }
        .with_handler("command");
        insta::assert_json_snapshot!(info, @r#"
        {
          "forkpool": "0.1.0",
          "protocol": 1,
          "handler": "command"
        }
        "#);
    }
}
