use serde::Serialize;

use super::device::DeviceId;
use crate::power::variable::{Phase, PowerType};

/// Write side of the device link.
///
/// Writes are fire-and-forget from the arbiter's point of view: an error is
/// logged and the cycle continues.
#[cfg_attr(test, mockall::automock)]
pub trait OutboundChannel {
    fn write(
        &mut self,
        device: &DeviceId,
        phase: Phase,
        power_type: PowerType,
        value: f64,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedWrite {
    pub device: DeviceId,
    pub phase: Phase,
    pub power_type: PowerType,
    pub value: f64,
}

/// Channel that keeps every write in memory. Used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    writes: Vec<RecordedWrite>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> &[RecordedWrite] {
        &self.writes
    }

    /// Most recent value written to one variable
    pub fn value(&self, device: &DeviceId, phase: Phase, power_type: PowerType) -> Option<f64> {
        self.writes
            .iter()
            .rev()
            .find(|w| &w.device == device && w.phase == phase && w.power_type == power_type)
            .map(|w| w.value)
    }

    pub fn take(&mut self) -> Vec<RecordedWrite> {
        std::mem::take(&mut self.writes)
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }
}

impl OutboundChannel for RecordingChannel {
    fn write(
        &mut self,
        device: &DeviceId,
        phase: Phase,
        power_type: PowerType,
        value: f64,
    ) -> anyhow::Result<()> {
        self.writes.push(RecordedWrite {
            device: device.clone(),
            phase,
            power_type,
            value,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_channel_keeps_latest() {
        let mut channel = RecordingChannel::new();
        let id = DeviceId::from("ess0");
        channel.write(&id, Phase::All, PowerType::Active, 100.0).unwrap();
        channel.write(&id, Phase::All, PowerType::Active, 200.0).unwrap();

        assert_eq!(channel.writes().len(), 2);
        assert_eq!(channel.value(&id, Phase::All, PowerType::Active), Some(200.0));
        assert_eq!(channel.value(&id, Phase::All, PowerType::Reactive), None);

        let taken = channel.take();
        assert_eq!(taken.len(), 2);
        assert!(channel.writes().is_empty());
    }
}
