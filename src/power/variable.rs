use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString};

use crate::domain::device::DeviceId;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Phase {
    L1,
    L2,
    L3,
    /// Aggregate of all three phases
    All,
}

impl Phase {
    pub const SINGLE: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum PowerType {
    /// Watts, positive = discharge
    #[default]
    Active,
    /// var, positive = inductive
    Reactive,
}

/// One decision variable: the set-point of a device on one phase for one
/// kind of power.
///
/// Ordering is by device, then phase, then power type; solver output and
/// outbound writes follow it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable {
    pub device: DeviceId,
    pub phase: Phase,
    pub power_type: PowerType,
}

impl Variable {
    pub fn new(device: impl Into<DeviceId>, phase: Phase, power_type: PowerType) -> Self {
        Self {
            device: device.into(),
            phase,
            power_type,
        }
    }

    pub fn active(device: impl Into<DeviceId>, phase: Phase) -> Self {
        Self::new(device, phase, PowerType::Active)
    }

    pub fn reactive(device: impl Into<DeviceId>, phase: Phase) -> Self {
        Self::new(device, phase, PowerType::Reactive)
    }

    pub fn with_phase(&self, phase: Phase) -> Self {
        Self {
            device: self.device.clone(),
            phase,
            power_type: self.power_type,
        }
    }

    /// The other power type on the same device and phase
    pub fn counterpart(&self) -> Self {
        let power_type = match self.power_type {
            PowerType::Active => PowerType::Reactive,
            PowerType::Reactive => PowerType::Active,
        };
        Self {
            device: self.device.clone(),
            phase: self.phase,
            power_type,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.device, self.phase, self.power_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_display() {
        let var = Variable::active("ess0", Phase::All);
        assert_eq!(var.to_string(), "ess0.ALL.ACTIVE");
        assert_eq!(var.counterpart().to_string(), "ess0.ALL.REACTIVE");
    }

    #[test]
    fn test_parse_phase() {
        assert_eq!("L2".parse::<Phase>().unwrap(), Phase::L2);
        assert_eq!("ALL".parse::<Phase>().unwrap(), Phase::All);
        assert_eq!(Phase::iter().count(), 4);
    }

    #[test]
    fn test_ordering_is_device_phase_type() {
        let mut vars = vec![
            Variable::reactive("ess1", Phase::L1),
            Variable::active("ess0", Phase::L2),
            Variable::reactive("ess0", Phase::L1),
            Variable::active("ess0", Phase::L1),
        ];
        vars.sort();
        assert_eq!(vars[0], Variable::active("ess0", Phase::L1));
        assert_eq!(vars[1], Variable::reactive("ess0", Phase::L1));
        assert_eq!(vars[2], Variable::active("ess0", Phase::L2));
        assert_eq!(vars[3], Variable::reactive("ess1", Phase::L1));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Variable::reactive("ess0", Phase::L3)).unwrap();
        assert_eq!(json, r#"{"device":"ess0","phase":"L3","power_type":"REACTIVE"}"#);
    }
}
