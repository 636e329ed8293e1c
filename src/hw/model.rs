use std::fmt;

use serde::Serialize;

/// A discovered BLE peripheral that matched a scan predicate.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct FoundDevice {
    adapter_name: String,
    device_id: String,
    local_name: Option<String>,
    rssi: Option<i16>,
}

impl FoundDevice {
    /// Creates a new discovered-device record.
    #[must_use]
    pub fn new(
        adapter_name: impl Into<String>,
        device_id: impl Into<String>,
        local_name: Option<String>,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            device_id: device_id.into(),
            local_name,
            rssi,
        }
    }

    /// Returns the adapter name used to discover this device.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Returns the backend-specific device identifier (the MAC address on Linux).
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns whether this device is the one `target` selects.
    #[must_use]
    pub fn matches(&self, target: &DeviceTarget) -> bool {
        match target {
            DeviceTarget::Address(address) => self.device_id.eq_ignore_ascii_case(address),
            DeviceTarget::Name(name) => self.local_name.as_deref() == Some(name.as_str()),
            DeviceTarget::NamePrefix(prefix) => self
                .local_name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str())),
        }
    }
}

/// Which appliance to connect to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceTarget {
    /// Exact BLE address or backend device id.
    Address(String),
    /// Exact advertised local name.
    Name(String),
    /// First device whose local name starts with this prefix.
    NamePrefix(String),
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self::NamePrefix(DEFAULT_NAME_PREFIX.to_string())
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "address `{address}`"),
            Self::Name(name) => write!(f, "name `{name}`"),
            Self::NamePrefix(prefix) => write!(f, "name prefix `{prefix}*`"),
        }
    }
}

/// Local-name prefix advertised by Boneco appliances.
pub(crate) const DEFAULT_NAME_PREFIX: &str = "BONECO";

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    /// Creates a characteristic description.
    #[must_use]
    pub fn new(uuid: impl Into<String>, properties: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            properties,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns property labels such as `write` or `notify`.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub(crate) fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceInfo {
    uuid: String,
    primary: bool,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Creates a service description.
    #[must_use]
    pub fn new(
        uuid: impl Into<String>,
        primary: bool,
        characteristics: Vec<CharacteristicInfo>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            primary,
            characteristics,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }
}
