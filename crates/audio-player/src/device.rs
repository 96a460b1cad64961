//! Output device discovery and stream-config selection for cpal.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Upper bound for fixed device buffers, in frames.
const MAX_BUFFER_FRAMES: u32 = 4_096;

/// Output device summary for the `devices` listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub default_rate: Option<u32>,
    pub min_rate: u32,
    pub max_rate: u32,
    pub is_default: bool,
}

/// First output device whose name contains `needle` (case-insensitive), or the default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle.filter(|n| !n.trim().is_empty()) {
        let found = host
            .output_devices()
            .context("enumerate output devices")?
            .find(|d| {
                device_name(d)
                    .map(|name| matches_device_name(&name, needle))
                    .unwrap_or(false)
            });
        return found.ok_or_else(|| anyhow!("no output device matched {needle:?}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("no default output device"))
}

pub fn device_name(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|d| d.name().to_string())
}

/// Choose a stream config.
///
/// With a target rate, prefer the highest supported rate not above it, then the lowest
/// rate above it. Without one, take the highest rate. Ties go to the better sample format.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in device
        .supported_output_configs()
        .context("query output configs")?
    {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            not_above: target_rate.map(|t| rate <= t).unwrap_or(true),
            rate,
            format_rank: sample_format_rank(range.sample_format()),
        };
        let replace = best
            .as_ref()
            .map(|(current, _)| candidate.beats(current, target_rate))
            .unwrap_or(true);
        if replace {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }
    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("device reports no output configs"))
}

/// Fixed buffer size when the device advertises a range, capped to keep latency low.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed((*max).min(MAX_BUFFER_FRAMES).max(*min)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Current default rate of the device, if the host will say.
pub fn default_output_rate(device: &cpal::Device) -> Option<u32> {
    device.default_output_config().ok().map(|c| c.sample_rate())
}

pub fn list_device_infos(host: &cpal::Host) -> Result<Vec<DeviceInfo>> {
    let default_name = host.default_output_device().as_ref().and_then(device_name);
    let mut out = Vec::new();
    for device in host.output_devices().context("enumerate output devices")? {
        let Some(name) = device_name(&device) else {
            continue;
        };
        let (mut min_rate, mut max_rate) = (u32::MAX, 0u32);
        if let Ok(ranges) = device.supported_output_configs() {
            for r in ranges {
                min_rate = min_rate.min(r.min_sample_rate());
                max_rate = max_rate.max(r.max_sample_rate());
            }
        }
        let default_rate = default_output_rate(&device);
        if max_rate == 0 {
            let Some(rate) = default_rate else {
                tracing::warn!(device = %name, "skipping device without usable sample rates");
                continue;
            };
            (min_rate, max_rate) = (rate, rate);
        }
        out.push(DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            default_rate,
            min_rate,
            max_rate,
        });
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    not_above: bool,
    rate: u32,
    format_rank: u8,
}

impl Candidate {
    fn beats(&self, other: &Candidate, target_rate: Option<u32>) -> bool {
        if self.not_above != other.not_above {
            return self.not_above;
        }
        if self.rate != other.rate {
            // Below target: closer is higher. Above target: closer is lower.
            return if self.not_above || target_rate.is_none() {
                self.rate > other.rate
            } else {
                self.rate < other.rate
            };
        }
        self.format_rank < other.format_rank
    }
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(t) => t.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    !needle.is_empty() && name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(not_above: bool, rate: u32, format_rank: u8) -> Candidate {
        Candidate {
            not_above,
            rate,
            format_rank,
        }
    }

    #[test]
    fn device_name_match_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", "  "));
    }

    #[test]
    fn rate_is_clamped_into_range() {
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(48_000)), 48_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(22_050)), 44_100);
        assert_eq!(pick_rate_for_range(44_100, 96_000, Some(192_000)), 96_000);
        assert_eq!(pick_rate_for_range(44_100, 96_000, None), 96_000);
    }

    #[test]
    fn candidates_prefer_not_above_target() {
        let target = Some(48_000);
        assert!(cand(true, 44_100, 2).beats(&cand(false, 96_000, 0), target));
        assert!(cand(true, 48_000, 2).beats(&cand(true, 44_100, 0), target));
        assert!(cand(false, 88_200, 0).beats(&cand(false, 96_000, 0), target));
        assert!(cand(true, 48_000, 0).beats(&cand(true, 48_000, 2), target));
    }
}
