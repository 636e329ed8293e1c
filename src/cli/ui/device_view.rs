use std::fmt::{self, Display, Formatter};

use crate::hw::FoundDevice;
use crate::utils::format_rssi;

use super::painter::Painter;

/// Renders a [`FoundDevice`] on one line.
pub(crate) struct DeviceView<'a> {
    device: &'a FoundDevice,
    painter: &'a Painter,
}

impl<'a> DeviceView<'a> {
    pub(crate) fn new(device: &'a FoundDevice, painter: &'a Painter) -> Self {
        Self { device, painter }
    }
}

impl Display for DeviceView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = self.device.local_name().unwrap_or("<unknown>");
        write!(
            f,
            "{} {} {}",
            self.painter.value(name),
            self.painter.muted(format!("({})", self.device.device_id())),
            self.painter.muted(format!(
                "via {} rssi {}",
                self.device.adapter_name(),
                format_rssi(self.device.rssi())
            )),
        )
    }
}
