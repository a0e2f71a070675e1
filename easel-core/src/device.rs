use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compute device pipelines are placed on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown device `{0}`, expected `cpu`, `cuda[:N]`, `metal[:N]` or `auto`")]
pub struct DeviceParseError(String);

impl FromStr for Device {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| DeviceParseError(s.to_string()))?;
                (kind, ordinal)
            }
            None => (lower.as_str(), 0),
        };
        match kind {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" => Ok(Self::Metal(ordinal)),
            // No accelerator probing is wired in; `auto` selects the CPU and
            // accelerators are opted into explicitly.
            "auto" => Ok(Self::Cpu),
            _ => Err(DeviceParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = DeviceParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

/// Per-device knobs applied when a pipeline is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub precision: Precision,
    /// Render in row bands to bound peak memory.
    pub sliced_rendering: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// f64 accumulators.
    Full,
    /// f32 accumulators, the reduced-precision path for accelerators.
    Half,
}

impl PipelineOptions {
    pub fn for_device(device: Device) -> Self {
        if device.is_cpu() {
            Self {
                precision: Precision::Full,
                sliced_rendering: true,
            }
        } else {
            Self {
                precision: Precision::Half,
                sliced_rendering: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_strings() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("metal:2".parse::<Device>().unwrap(), Device::Metal(2));
        assert_eq!("auto".parse::<Device>().unwrap(), Device::Cpu);
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for device in [Device::Cpu, Device::Cuda(1), Device::Metal(0)] {
            assert_eq!(device.to_string().parse::<Device>().unwrap(), device);
        }
    }

    #[test]
    fn cpu_gets_full_precision_and_slicing() {
        let options = PipelineOptions::for_device(Device::Cpu);
        assert_eq!(options.precision, Precision::Full);
        assert!(options.sliced_rendering);

        let options = PipelineOptions::for_device(Device::Cuda(0));
        assert_eq!(options.precision, Precision::Half);
        assert!(!options.sliced_rendering);
    }
}
