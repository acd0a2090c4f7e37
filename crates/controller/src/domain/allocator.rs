//! GPU set parsing, overlap detection, split vectors and port assignment.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use super::error::LifecycleError;
use super::error::Result;

/// Normalized, ascending, duplicate free set of GPU indices.
///
/// Two sets compare equal regardless of the order the indices were given in.
/// The canonical string form joins the indices with commas (`"0,1"`) and is the
/// key used by the registry document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuSet(Vec<u32>);

impl GpuSet {
    /// Parse without a device bound. Used for keys read back from disk; live
    /// requests go through [`Allocator::parse`].
    pub fn parse_unbounded(spec: &str) -> Result<Self> {
        let invalid = |reason: String| LifecycleError::InvalidGpuSpec {
            spec: spec.to_string(),
            reason,
        };

        let mut indices = BTreeSet::new();
        for token in spec
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
        {
            let not_an_index = || invalid(format!("'{token}' is not a non-negative integer"));
            if !token.bytes().all(|b| b.is_ascii_digit()) {
                return Err(not_an_index());
            }
            let index: u32 = token.parse().map_err(|_| not_an_index())?;
            if !indices.insert(index) {
                return Err(invalid(format!("GPU {index} listed more than once")));
            }
        }

        if indices.is_empty() {
            return Err(invalid("no GPU indices given".to_string()));
        }
        Ok(GpuSet(indices.into_iter().collect()))
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowest member, which drives port math and `--main-gpu`.
    pub fn min(&self) -> u32 {
        self.0.first().copied().unwrap_or_default()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.0.binary_search(&index).is_ok()
    }

    pub fn intersects(&self, other: &GpuSet) -> bool {
        self.0.iter().any(|index| other.contains(*index))
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

impl FromStr for GpuSet {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        GpuSet::parse_unbounded(s)
    }
}

impl Serialize for GpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        GpuSet::parse_unbounded(&raw).map_err(serde::de::Error::custom)
    }
}

/// True iff `requested` shares at least one device with any of `active`.
pub fn conflicts<'a, I>(requested: &GpuSet, active: I) -> bool
where
    I: IntoIterator<Item = &'a GpuSet>,
{
    active.into_iter().any(|set| set.intersects(requested))
}

/// Per-device share vector of length `total_devices`.
///
/// Members get `1/|set|`, everything else `0`. The highest member gets
/// `1.0 - sum(others)` where the others are summed in ascending order, so the
/// vector summed front to back is exactly `1.0`. Members at or beyond
/// `total_devices` are not representable and are skipped.
pub fn compute_split(set: &GpuSet, total_devices: usize) -> Vec<f64> {
    let mut split = vec![0.0; total_devices];
    let members: Vec<usize> = set
        .indices()
        .iter()
        .map(|index| *index as usize)
        .filter(|index| *index < total_devices)
        .collect();
    let Some((&last, others)) = members.split_last() else {
        return split;
    };

    let share = 1.0 / members.len() as f64;
    let mut assigned = 0.0;
    for &index in others {
        split[index] = share;
        assigned += share;
    }
    split[last] = 1.0 - assigned;
    split
}

/// `--tensor-split` rendering, e.g. `0.5,0.5` or `1,0`.
pub fn format_split(split: &[f64]) -> String {
    split
        .iter()
        .map(|share| share.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Port layout for launched instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPolicy {
    pub base_port: u16,
    pub port_stride: u16,
    /// Fixed port for multi-device sets, when configured
    pub shared_port: Option<u16>,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            base_port: 8080,
            port_stride: 1,
            shared_port: None,
        }
    }
}

/// Validates GPU specs against the host's device count and derives launch
/// parameters from a [`GpuSet`].
#[derive(Debug, Clone)]
pub struct Allocator {
    device_count: u32,
    ports: PortPolicy,
}

impl Allocator {
    pub fn new(device_count: u32, ports: PortPolicy) -> Self {
        Self {
            device_count,
            ports,
        }
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    /// Parse `spec` and reject indices outside `[0, device_count - 1]`.
    pub fn parse(&self, spec: &str) -> Result<GpuSet> {
        let set = GpuSet::parse_unbounded(spec)?;
        if let Some(index) = set.indices().iter().find(|i| **i >= self.device_count) {
            return Err(LifecycleError::InvalidGpuSpec {
                spec: spec.to_string(),
                reason: format!(
                    "GPU {index} is out of range, {} device(s) available",
                    self.device_count
                ),
            });
        }
        Ok(set)
    }

    pub fn compute_split(&self, set: &GpuSet) -> Vec<f64> {
        compute_split(set, self.device_count as usize)
    }

    /// `base + stride * min(set)`, or the shared port for multi-device sets.
    pub fn assign_port(&self, set: &GpuSet) -> Result<u16> {
        if set.len() > 1 {
            if let Some(port) = self.ports.shared_port {
                return Ok(port);
            }
        }

        let port = u64::from(self.ports.base_port)
            + u64::from(self.ports.port_stride) * u64::from(set.min());
        u16::try_from(port).map_err(|_| LifecycleError::InvalidGpuSpec {
            spec: set.key(),
            reason: format!("derived port {port} exceeds 65535"),
        })
    }
}
