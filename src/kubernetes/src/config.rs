use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use rosterd_ipam::range::Range;

use crate::error::{ConfigError, Error};

pub const DEFAULT_RECONCILER_CRON: &str = "30 4 * * *";

/// The `ipam` section of a network attachment definition, also accepted as a
/// standalone flatfile. Key casing follows the wire format: most keys are
/// snake_case, `ipRanges` is not.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IPAMConfig {
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub range_start: Option<String>,
    #[serde(default)]
    pub range_end: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default, rename = "ipRanges")]
    pub ip_ranges: Vec<RangeConfiguration>,
    #[serde(default = "default_true")]
    pub enable_overlapping_ranges: bool,
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_reconciler_cron")]
    pub reconciler_cron_expression: String,
    #[serde(default = "default_leader_lease_duration")]
    pub leader_lease_duration: u32,
    #[serde(default = "default_leader_renew_deadline")]
    pub leader_renew_deadline: u32,
    #[serde(default = "default_leader_retry_period")]
    pub leader_retry_period: u32,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for IPAMConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// One allocatable range. A top-level `range` in the config is folded into
/// this form during normalization.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RangeConfiguration {
    pub range: String,
    #[serde(default)]
    pub range_start: Option<String>,
    #[serde(default)]
    pub range_end: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl RangeConfiguration {
    pub fn to_range(&self) -> Result<Range, Error> {
        let range = Range::parse(&self.range)?
            .with_bounds(self.range_start.as_deref(), self.range_end.as_deref())?
            .with_exclusions(&self.exclude)?;
        Ok(range)
    }
}

/// The envelope this plugin receives on a CNI invocation. Only the `ipam`
/// section is interpreted here.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    #[serde(default)]
    pub name: Option<String>,
    pub ipam: IPAMConfig,
}

impl IPAMConfig {
    /// Parses a full network configuration and returns its normalized `ipam`
    /// section. The network name becomes the pool scope unless the config
    /// carries an explicit `network_name`.
    pub fn from_net_conf(bytes: &[u8]) -> Result<IPAMConfig, Error> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(ConfigError::InvalidFormat(e)))?;
        let mut ipam = conf.ipam;
        if ipam.network_name.is_none() {
            ipam.network_name = conf.name;
        }
        ipam.normalize()
    }

    /// Reads a standalone flatfile configuration, e.g. the mounted file the
    /// reconciler watches for cron changes. No ranges are required there.
    pub fn from_flatfile(path: &Path) -> Result<IPAMConfig, Error> {
        let bytes =
            std::fs::read(path).map_err(|e| Error::Config(ConfigError::FailedToLoad(e)))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Config(ConfigError::InvalidFormat(e)))
    }

    /// Folds the top-level single-range form into `ip_ranges` and rejects a
    /// config with no range at all.
    pub fn normalize(mut self) -> Result<IPAMConfig, Error> {
        if let Some(range) = self.range.take() {
            let folded = RangeConfiguration {
                range,
                range_start: self.range_start.take(),
                range_end: self.range_end.take(),
                exclude: std::mem::take(&mut self.exclude),
                gateway: self.gateway,
            };
            self.ip_ranges.insert(0, folded);
        }
        if self.ip_ranges.is_empty() {
            return Err(Error::Config(ConfigError::MissingRange));
        }
        Ok(self)
    }
}

fn default_true() -> bool {
    true
}

fn default_reconciler_cron() -> String {
    DEFAULT_RECONCILER_CRON.to_string()
}

fn default_leader_lease_duration() -> u32 {
    1500
}

fn default_leader_renew_deadline() -> u32 {
    1000
}

fn default_leader_retry_period() -> u32 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_net_conf_with_leading_zeros_and_bounds() {
        let conf = r#"{
          "name": "testnet",
          "ipam": {
            "range": "00192.00168.1.0/24",
            "range_start": "00192.00168.1.44",
            "range_end": "00192.00168.01.209",
            "leader_lease_duration": 3000,
            "leader_renew_deadline": 2000,
            "leader_retry_period": 1000
          }
        }"#;
        let ipam = IPAMConfig::from_net_conf(conf.as_bytes()).unwrap();
        assert_eq!(ipam.network_name.as_deref(), Some("testnet"));
        assert_eq!(ipam.leader_lease_duration, 3000);
        assert_eq!(ipam.leader_renew_deadline, 2000);
        assert_eq!(ipam.leader_retry_period, 1000);
        assert_eq!(ipam.ip_ranges.len(), 1);

        let range = ipam.ip_ranges[0].to_range().unwrap();
        assert_eq!(range.to_string(), "192.168.1.0/24");
        assert_eq!(range.effective_interval().unwrap(), (44, 209));
    }

    #[test]
    fn works_defaults() {
        let conf = r#"{"ipam": {"range": "10.0.0.0/8"}}"#;
        let ipam = IPAMConfig::from_net_conf(conf.as_bytes()).unwrap();
        assert!(ipam.enable_overlapping_ranges);
        assert_eq!(ipam.reconciler_cron_expression, DEFAULT_RECONCILER_CRON);
        assert_eq!(ipam.leader_lease_duration, 1500);
        assert_eq!(ipam.leader_renew_deadline, 1000);
        assert_eq!(ipam.leader_retry_period, 500);
    }

    #[test]
    fn works_overlapping_ranges_flag_disable() {
        let conf = r#"{"ipam": {"range": "10.0.0.0/8", "enable_overlapping_ranges": false}}"#;
        let ipam = IPAMConfig::from_net_conf(conf.as_bytes()).unwrap();
        assert!(!ipam.enable_overlapping_ranges);
    }

    #[test]
    fn works_multiple_ranges() {
        let conf = r#"{
          "ipam": {
            "range": "192.168.1.0/24",
            "ipRanges": [
              {"range": "10.0.0.0/24", "exclude": ["10.0.0.0/28"]}
            ]
          }
        }"#;
        let ipam = IPAMConfig::from_net_conf(conf.as_bytes()).unwrap();
        assert_eq!(ipam.ip_ranges.len(), 2);
        // the folded top-level range comes first
        assert_eq!(ipam.ip_ranges[0].range, "192.168.1.0/24");
        assert_eq!(ipam.ip_ranges[1].exclude, vec!["10.0.0.0/28".to_string()]);
    }

    #[test]
    fn works_cron_expression_passthrough() {
        let conf =
            r#"{"ipam": {"range": "10.0.0.0/8", "reconciler_cron_expression": "30 4 * * *"}}"#;
        let ipam = IPAMConfig::from_net_conf(conf.as_bytes()).unwrap();
        assert_eq!(ipam.reconciler_cron_expression, "30 4 * * *");
    }

    #[test]
    fn fails_without_any_range() {
        let conf = r#"{"ipam": {}}"#;
        assert!(IPAMConfig::from_net_conf(conf.as_bytes()).is_err());
    }
}
