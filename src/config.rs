//! CLI configuration, generalized from the teacher's `Args` derive struct
//! (`local_port`, `peer`) to the full set of startup parameters spec.md's
//! ambient config layer needs (§3 `EndpointConfig`).

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "intercom-endpoint", about = "Full-duplex voice intercom endpoint")]
pub struct EndpointConfig {
    /// TCP port to listen on.
    #[arg(short = 'l', long, default_value_t = 6054)]
    pub listen_port: u16,

    /// Dial this peer (<host:port>) instead of waiting for an inbound call.
    #[arg(short = 'p', long)]
    pub peer: Option<String>,

    /// Answer an inbound call automatically instead of ringing.
    #[arg(long, default_value_t = false)]
    pub auto_answer: bool,

    /// Enable acoustic echo cancellation.
    #[arg(long, default_value_t = true)]
    pub aec_enabled: bool,

    /// AEC reference delay in milliseconds (clamped 20-100).
    #[arg(long, default_value_t = 80)]
    pub ref_delay_ms: u32,

    /// Ringing / outgoing timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    pub ringing_timeout_ms: i64,

    /// Mic preprocessor gain, in dB.
    #[arg(long, default_value_t = 0)]
    pub mic_gain_db: i8,

    /// Playback volume, percent.
    #[arg(long, default_value_t = 100)]
    pub volume_pct: u8,

    /// Display name announced to the peer in `START`.
    #[arg(long, default_value = "intercom")]
    pub display_name: String,

    /// Path to the settings JSON file.
    #[arg(long, default_value = "settings.json")]
    pub settings_path: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EndpointConfig::parse_from(["intercom-endpoint"]);
        assert_eq!(cfg.listen_port, 6054);
        assert_eq!(cfg.ringing_timeout_ms, 10_000);
        assert_eq!(cfg.ref_delay_ms, 80);
        assert!(!cfg.auto_answer);
        assert!(cfg.aec_enabled);
    }

    #[test]
    fn peer_flag_enables_client_dial_mode() {
        let cfg = EndpointConfig::parse_from([
            "intercom-endpoint",
            "--peer",
            "10.0.0.5:6054",
        ]);
        assert_eq!(cfg.peer.as_deref(), Some("10.0.0.5:6054"));
    }
}
