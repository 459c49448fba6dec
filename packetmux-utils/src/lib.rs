use color_eyre::eyre::{bail, Result, WrapErr};
use eui48::MacAddress;
use hashbrown::HashMap;
use tracing::Level;
use tracing_subscriber;
use tracing_subscriber::{filter::LevelFilter, FmtSubscriber};
use yaml_rust::YamlLoader;

#[macro_export]
macro_rules! test_init(
        () => {
            let subscriber = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::EnvFilter::from_default_env())
                .with(ErrorLayer::default());
            let _guard = subscriber.set_default();
            color_eyre::install().unwrap_or_else(|_| ());
        }
    );

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl std::str::FromStr for TraceLevel {
    type Err = color_eyre::eyre::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "debug" => TraceLevel::Debug,
            "info" => TraceLevel::Info,
            "warn" => TraceLevel::Warn,
            "error" => TraceLevel::Error,
            "off" => TraceLevel::Off,
            x => bail!("unknown TRACE level {:?}", x),
        })
    }
}

pub fn global_debug_init(trace_level: TraceLevel) -> Result<()> {
    color_eyre::install()?;
    let subscriber = match trace_level {
        TraceLevel::Debug => FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish(),
        TraceLevel::Info => FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish(),
        TraceLevel::Warn => FmtSubscriber::builder()
            .with_max_level(Level::WARN)
            .finish(),
        TraceLevel::Error => FmtSubscriber::builder()
            .with_max_level(Level::ERROR)
            .finish(),
        TraceLevel::Off => FmtSubscriber::builder()
            .with_max_level(LevelFilter::OFF)
            .finish(),
    };
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    Ok(())
}

/// Default egress budget (packets drained per scheduler visit).
pub const DEFAULT_BUDGET: usize = 32;
/// Default per-VNIC packet pool size in bytes (2 MiB).
pub const DEFAULT_POOL_SIZE: usize = 0x200000;
/// Default bandwidth ceiling, 1 Gbit/s.
pub const DEFAULT_BANDWIDTH: u64 = 1_000_000_000;
/// Default ingress/egress queue capacity in packets.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
/// Default head/tail padding in bytes.
pub const DEFAULT_PADDING: u16 = 32;

/// One VNIC attribute profile, as loaded from a YAML config file.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VnicProfile {
    pub device: String,
    pub mac: MacAddress,
    pub budget: usize,
    pub pool_size: usize,
    pub rx_bandwidth: u64,
    pub tx_bandwidth: u64,
    pub rx_queue_size: usize,
    pub tx_queue_size: usize,
    pub padding_head: u16,
    pub padding_tail: u16,
}

impl Default for VnicProfile {
    fn default() -> Self {
        VnicProfile {
            device: String::new(),
            mac: MacAddress::nil(),
            budget: DEFAULT_BUDGET,
            pool_size: DEFAULT_POOL_SIZE,
            rx_bandwidth: DEFAULT_BANDWIDTH,
            tx_bandwidth: DEFAULT_BANDWIDTH,
            rx_queue_size: DEFAULT_QUEUE_SIZE,
            tx_queue_size: DEFAULT_QUEUE_SIZE,
            padding_head: DEFAULT_PADDING,
            padding_tail: DEFAULT_PADDING,
        }
    }
}

/// Parses VNIC profiles out of a YAML document of the form:
///
/// ```yaml
/// vnics:
///   - device: eth0
///     mac: 00:11:22:33:44:55
///     budget: 32
/// ```
///
/// Unset fields fall back to the defaults above. Two profiles sharing a MAC
/// on the same device are rejected here rather than at attach time.
pub fn parse_vnic_profiles(contents: &str) -> Result<Vec<VnicProfile>> {
    let docs = YamlLoader::load_from_str(contents).wrap_err("Failed to parse yaml")?;
    if docs.is_empty() {
        bail!("Empty yaml document");
    }
    let doc = &docs[0];
    let entries = match doc["vnics"].as_vec() {
        Some(v) => v,
        None => bail!("Yaml config has no `vnics` list"),
    };

    let mut seen: HashMap<(String, MacAddress), ()> = HashMap::default();
    let mut profiles = Vec::with_capacity(entries.len());
    for entry in entries.iter() {
        let device = match entry["device"].as_str() {
            Some(s) => s.to_string(),
            None => bail!("Vnic profile missing `device`"),
        };
        let mac = match entry["mac"].as_str() {
            Some(s) => MacAddress::parse_str(s).wrap_err("Failed to parse mac address")?,
            None => bail!("Vnic profile missing `mac`"),
        };
        if seen.insert((device.clone(), mac), ()).is_some() {
            bail!("Duplicate mac {:?} for device {}", mac, device);
        }

        let mut profile = VnicProfile {
            device,
            mac,
            ..Default::default()
        };
        if let Some(x) = entry["budget"].as_i64() {
            profile.budget = x as usize;
        }
        if let Some(x) = entry["pool_size"].as_i64() {
            profile.pool_size = x as usize;
        }
        if let Some(x) = entry["rx_bandwidth"].as_i64() {
            profile.rx_bandwidth = x as u64;
        }
        if let Some(x) = entry["tx_bandwidth"].as_i64() {
            profile.tx_bandwidth = x as u64;
        }
        if let Some(x) = entry["rx_queue_size"].as_i64() {
            profile.rx_queue_size = x as usize;
        }
        if let Some(x) = entry["tx_queue_size"].as_i64() {
            profile.tx_queue_size = x as usize;
        }
        if let Some(x) = entry["padding_head"].as_i64() {
            profile.padding_head = x as u16;
        }
        if let Some(x) = entry["padding_tail"].as_i64() {
            profile.padding_tail = x as u16;
        }
        profiles.push(profile);
    }
    Ok(profiles)
}

/// Reads and parses a YAML VNIC profile file.
pub fn parse_vnic_profiles_file(path: &str) -> Result<Vec<VnicProfile>> {
    let contents = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read config file {}", path))?;
    parse_vnic_profiles(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_profiles_with_defaults() {
        let yaml = r#"
vnics:
  - device: eth0
    mac: 00:11:22:33:44:55
    budget: 2
  - device: eth0
    mac: 00:11:22:33:44:56
"#;
        let profiles = parse_vnic_profiles(yaml).unwrap();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].device, "eth0");
        assert_eq!(profiles[0].budget, 2);
        assert_eq!(profiles[0].pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(profiles[1].budget, DEFAULT_BUDGET);
        assert_eq!(profiles[1].rx_queue_size, DEFAULT_QUEUE_SIZE);
    }

    #[test]
    fn reject_duplicate_mac_on_one_device() {
        let yaml = r#"
vnics:
  - device: eth0
    mac: 00:11:22:33:44:55
  - device: eth0
    mac: 00:11:22:33:44:55
"#;
        assert!(parse_vnic_profiles(yaml).is_err());
    }

    #[test]
    fn same_mac_on_different_devices_is_fine() {
        let yaml = r#"
vnics:
  - device: eth0
    mac: 00:11:22:33:44:55
  - device: eth1
    mac: 00:11:22:33:44:55
"#;
        assert!(parse_vnic_profiles(yaml).is_ok());
    }

    #[test]
    fn missing_vnics_list_is_an_error() {
        assert!(parse_vnic_profiles("devices: []").is_err());
    }
}
