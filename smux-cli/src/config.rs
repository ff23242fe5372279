//! Engine configuration from file and command line

use std::path::Path;

use anyhow::{bail, Context};
use smux_engine::MuxConfig;
use tracing::{debug, info};

use crate::EngineArgs;

/// Load the engine configuration, then apply command line overrides
pub fn load(path: Option<&Path>, args: &EngineArgs) -> anyhow::Result<MuxConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: MuxConfig = serde_json::from_str(&text)
                .with_context(|| format!("parsing config {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        None => MuxConfig::default(),
    };

    if args.power_collapse {
        config.power_collapse = true;
    }
    validate(&config, args.channel)?;
    debug!("Engine configuration: {:?}", config);
    Ok(config)
}

fn validate(config: &MuxConfig, channel: u8) -> anyhow::Result<()> {
    if channel >= config.num_channels {
        bail!(
            "channel {} out of range, engine has {} channels",
            channel,
            config.num_channels
        );
    }
    if config.tx_wm_low >= config.tx_wm_high {
        bail!(
            "tx_wm_low ({}) must be below tx_wm_high ({})",
            config.tx_wm_low,
            config.tx_wm_high
        );
    }
    if config.rx_wm_low >= config.rx_wm_high {
        bail!(
            "rx_wm_low ({}) must be below rx_wm_high ({})",
            config.rx_wm_low,
            config.rx_wm_high
        );
    }
    if config.wakeup_delay_min_us == 0 || config.wakeup_delay_min_us > config.wakeup_delay_max_us {
        bail!("wakeup delay bounds are inconsistent");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(channel: u8) -> EngineArgs {
        EngineArgs {
            channel,
            power_collapse: false,
            remote_loopback: false,
        }
    }

    #[test]
    fn defaults_without_file() {
        let config = load(None, &args(0)).unwrap();
        assert_eq!(config, MuxConfig::default());
    }

    #[test]
    fn flag_overrides_file() {
        let dir = std::env::temp_dir().join(format!("smux-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("mux.json");
        std::fs::write(&path, r#"{ "num_channels": 4, "power_collapse": false }"#).unwrap();

        let mut overrides = args(3);
        overrides.power_collapse = true;
        let config = load(Some(&path), &overrides).unwrap();
        assert_eq!(config.num_channels, 4);
        assert!(config.power_collapse);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn channel_must_exist() {
        let config = MuxConfig {
            num_channels: 2,
            ..MuxConfig::default()
        };
        assert!(validate(&config, 2).is_err());
        assert!(validate(&config, 1).is_ok());
    }

    #[test]
    fn watermarks_must_be_ordered() {
        let config = MuxConfig {
            tx_wm_low: 4,
            tx_wm_high: 4,
            ..MuxConfig::default()
        };
        assert!(validate(&config, 0).is_err());
    }
}
