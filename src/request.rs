//! Client request types: attach configuration and discovery session configs.
//!
//! Values are validated before any HAL traffic is generated.  Bounded byte
//! fields use `heapless` containers so an oversized service name or filter is
//! rejected at construction time rather than deep inside the dispatcher.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::types::{Capabilities, Role};

// ── Attach configuration ──────────────────────────────────────

pub const CLUSTER_ID_MIN: u16 = 0;
pub const CLUSTER_ID_MAX: u16 = 0xFFFF;

pub const DW_INTERVAL_MIN: u8 = 1;
pub const DW_INTERVAL_MAX: u8 = 5;

/// Discovery bands, in the index order used by [`ConfigRequest::discovery_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Band24Ghz = 0,
    Band5Ghz = 1,
    Band6Ghz = 2,
}

pub const BAND_COUNT: usize = 3;

/// Vendor-specific configuration blob keyed by OUI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorData {
    pub oui: u32,
    pub data: Vec<u8>,
}

/// Per-client attach configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub cluster_low: u16,
    pub cluster_high: u16,
    /// 0 means "no preference".
    pub master_preference: u8,
    pub support_5g: bool,
    pub support_6g: bool,
    /// Discovery window interval per band; `None` leaves the band unset.
    pub discovery_window: [Option<u8>; BAND_COUNT],
    pub vendor_data: Vec<VendorData>,
}

impl Default for ConfigRequest {
    fn default() -> Self {
        Self {
            cluster_low: CLUSTER_ID_MIN,
            cluster_high: CLUSTER_ID_MAX,
            master_preference: 0,
            support_5g: true,
            support_6g: false,
            discovery_window: [None; BAND_COUNT],
            vendor_data: Vec::new(),
        }
    }
}

impl ConfigRequest {
    /// Builder-style helper for the per-band discovery window interval.
    pub fn with_discovery_window(mut self, band: Band, interval: u8) -> Self {
        self.discovery_window[band as usize] = Some(interval);
        self
    }

    /// True when the request leaves the cluster range at its full default span.
    pub fn has_default_cluster_range(&self) -> bool {
        self.cluster_low == CLUSTER_ID_MIN && self.cluster_high == CLUSTER_ID_MAX
    }

    pub fn validate(&self) -> Result<()> {
        if self.master_preference == 1 || self.master_preference == 255 {
            return Err(ConfigError::ReservedMasterPreference(self.master_preference));
        }
        if self.cluster_low > self.cluster_high {
            return Err(ConfigError::ClusterRangeInverted {
                low: self.cluster_low,
                high: self.cluster_high,
            });
        }
        for (band, interval) in self.discovery_window.iter().enumerate() {
            if let Some(value) = *interval {
                if !(DW_INTERVAL_MIN..=DW_INTERVAL_MAX).contains(&value) {
                    return Err(ConfigError::DiscoveryWindowOutOfRange { band, value });
                }
            }
        }
        Ok(())
    }
}

// ── Discovery session configuration ───────────────────────────

/// Upper bound on any single discovery field, matching the HAL wire limit.
pub const MAX_FIELD_LEN: usize = 255;

pub type ServiceName = heapless::String<MAX_FIELD_LEN>;
pub type FieldBytes = heapless::Vec<u8, MAX_FIELD_LEN>;

/// Parameters common to publish and subscribe sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryParams {
    pub service_name: ServiceName,
    pub service_specific_info: FieldBytes,
    pub match_filter: FieldBytes,
    /// Session lifetime in seconds; 0 runs until terminated.
    pub ttl_sec: u32,
    pub suspendable: bool,
}

impl DiscoveryParams {
    pub fn new(service_name: &str) -> Result<Self> {
        let mut name = ServiceName::new();
        name.push_str(service_name)
            .map_err(|()| ConfigError::FieldTooLong("service name"))?;
        Ok(Self {
            service_name: name,
            ..Default::default()
        })
    }

    pub fn with_service_specific_info(mut self, info: &[u8]) -> Result<Self> {
        self.service_specific_info = FieldBytes::from_slice(info)
            .map_err(|()| ConfigError::FieldTooLong("service specific info"))?;
        Ok(self)
    }

    pub fn with_match_filter(mut self, filter: &[u8]) -> Result<Self> {
        self.match_filter =
            FieldBytes::from_slice(filter).map_err(|()| ConfigError::FieldTooLong("match filter"))?;
        Ok(self)
    }

    /// Check field lengths against the limits the HAL reported.
    pub fn validate(&self, caps: &Capabilities) -> Result<()> {
        if self.service_name.is_empty() || self.service_name.len() > caps.max_service_name_len {
            return Err(ConfigError::FieldTooLong("service name"));
        }
        if self.service_specific_info.len() > caps.max_service_specific_info_len {
            return Err(ConfigError::FieldTooLong("service specific info"));
        }
        if self.match_filter.len() > caps.max_match_filter_len {
            return Err(ConfigError::FieldTooLong("match filter"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PublishType {
    #[default]
    Unsolicited,
    Solicited,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscribeType {
    #[default]
    Passive,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    pub params: DiscoveryParams,
    pub publish_type: PublishType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeConfig {
    pub params: DiscoveryParams,
    pub subscribe_type: SubscribeType,
}

impl PublishConfig {
    pub fn new(service_name: &str) -> Result<Self> {
        Ok(Self {
            params: DiscoveryParams::new(service_name)?,
            publish_type: PublishType::default(),
        })
    }
}

impl SubscribeConfig {
    pub fn new(service_name: &str) -> Result<Self> {
        Ok(Self {
            params: DiscoveryParams::new(service_name)?,
            subscribe_type: SubscribeType::default(),
        })
    }
}

/// Current configuration of a discovery session; the variant fixes its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionConfig {
    Publish(PublishConfig),
    Subscribe(SubscribeConfig),
}

impl SessionConfig {
    pub fn role(&self) -> Role {
        match self {
            Self::Publish(_) => Role::Publish,
            Self::Subscribe(_) => Role::Subscribe,
        }
    }

    pub fn params(&self) -> &DiscoveryParams {
        match self {
            Self::Publish(c) => &c.params,
            Self::Subscribe(c) => &c.params,
        }
    }
}
