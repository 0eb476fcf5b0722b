//! Parsing of driver-reported name lists and range tables.
//!
//! The driver reports devices and physical channels as comma separated
//! strings, and voltage ranges as a flat `[min, max, ...]` array.

use serde::Serialize;

/// Split a comma separated driver list into trimmed, non-empty names.
///
/// ```
/// use daqmx_hal::names::parse_name_list;
///
/// assert_eq!(parse_name_list("Dev1, Dev2,,"), vec!["Dev1", "Dev2"]);
/// ```
pub fn parse_name_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand a physical channel list with `a:b` ranges into single channels.
///
/// `"Dev1/ai0:2, Dev1/ai5"` gives `Dev1/ai0`, `Dev1/ai1`, `Dev1/ai2`,
/// `Dev1/ai5`. Items that do not parse as a range are kept verbatim.
pub fn expand_channel_list(list: &str) -> Vec<String> {
    let mut out = Vec::new();
    for item in parse_name_list(list) {
        match split_range(&item) {
            Some((prefix, first, last)) => {
                if first <= last {
                    out.extend((first..=last).map(|n| format!("{prefix}{n}")));
                } else {
                    out.extend((last..=first).rev().map(|n| format!("{prefix}{n}")));
                }
            }
            None => out.push(item),
        }
    }
    out
}

fn split_range(item: &str) -> Option<(&str, u32, u32)> {
    let (left, right) = item.split_once(':')?;
    let digits_at = left.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, first) = left.split_at(digits_at);
    let last_digits_at = right.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let last = &right[last_digits_at..];
    Some((prefix, first.parse().ok()?, last.parse().ok()?))
}

/// Join names into the comma separated form the driver accepts.
pub fn join_name_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

/// Strip a leading device prefix (`"Dev1/ai0"` → `"ai0"`, `"/Dev1/PFI7"` → `"PFI7"`).
pub fn strip_device<'a>(full_name: &'a str, device: &str) -> &'a str {
    let trimmed = full_name.trim_start_matches('/');
    trimmed
        .strip_prefix(device)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(trimmed)
}

/// Prefix a terminal or channel with its device, unless already qualified.
///
/// Terminals (leading `/`) keep their absolute form: `("PFI7", "Dev1", true)`
/// gives `"/Dev1/PFI7"`.
pub fn qualify(name: &str, device: &str, terminal: bool) -> String {
    let bare = strip_device(name, device);
    if terminal {
        format!("/{device}/{bare}")
    } else {
        format!("{device}/{bare}")
    }
}

/// One voltage range supported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoltageRange {
    /// Lower bound in volts
    pub min: f64,
    /// Upper bound in volts
    pub max: f64,
}

impl VoltageRange {
    /// Span (max - min) of this range.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }
}

/// Pair up a flat `[min, max, min, max, ...]` range table.
///
/// A trailing unpaired value is ignored.
pub fn parse_range_table(flat: &[f64]) -> Vec<VoltageRange> {
    flat.chunks_exact(2)
        .map(|pair| VoltageRange {
            min: pair[0],
            max: pair[1],
        })
        .collect()
}

/// The range with the highest upper bound, if any.
pub fn widest_range(ranges: &[VoltageRange]) -> Option<VoltageRange> {
    ranges
        .iter()
        .copied()
        .filter(|r| r.max.is_finite())
        .max_by(|a, b| a.max.total_cmp(&b.max))
}
