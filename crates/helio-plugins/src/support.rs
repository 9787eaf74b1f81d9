//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Helpers shared by the concrete device plugins.


use std::collections::{BTreeMap, HashMap, HashSet};

use helio_protocol::RawValue;
use tracing::warn;

/// Alert categories in display order.
pub const ALERT_CATEGORIES: &[&str] = &["status", "grid", "eps", "battery", "inverter", "bms"];

/// Infers MPPT count from which DC inputs show real voltage across the
/// first successful polls. Devices without a model-code register get their
/// channel count this way.
#[derive(Debug)]
pub struct MpptDetector {
    min_voltage: f64,
    default_count: u32,
    polls_seen: u32,
    highest_active: u32,
}

impl MpptDetector {
    /// Polls to observe before the count is considered settled.
    pub const SETTLE_POLLS: u32 = 3;

    pub fn new(min_voltage: f64, default_count: u32) -> Self {
        Self {
            min_voltage,
            default_count: default_count.max(1),
            polls_seen: 0,
            highest_active: 0,
        }
    }

    /// Feed the per-channel DC voltages of one poll, lowest channel first.
    pub fn observe(&mut self, voltages: &[Option<f64>]) {
        if self.polls_seen >= Self::SETTLE_POLLS {
            return;
        }
        self.polls_seen += 1;
        for (index, voltage) in voltages.iter().enumerate() {
            if voltage.is_some_and(|v| v > self.min_voltage) {
                self.highest_active = self.highest_active.max(index as u32 + 1);
            }
        }
    }

    /// Current best estimate. Inverters ship MPPTs in pairs, so the count
    /// rounds up to 2 or 4.
    pub fn count(&self) -> u32 {
        if self.highest_active == 0 {
            return self.default_count;
        }
        let rounded = if self.highest_active <= 2 { 2 } else { 4 };
        rounded.max(self.default_count)
    }

    pub fn settled(&self) -> bool {
        self.polls_seen >= Self::SETTLE_POLLS
    }
}

/// Decoded raw registers for one poll, with take-semantics so that
/// whatever standardisation leaves behind can be reported as unknown.
pub struct RawReading {
    values: HashMap<&'static str, RawValue>,
}

impl RawReading {
    pub fn new(values: HashMap<&'static str, RawValue>) -> Self {
        Self { values }
    }

    pub fn take_f64(&mut self, key: &'static str) -> Option<f64> {
        self.values.remove(key).and_then(|v| v.as_f64())
    }

    pub fn take_i64(&mut self, key: &'static str) -> Option<i64> {
        self.values.remove(key).and_then(|v| v.as_i64())
    }

    pub fn take_u16(&mut self, key: &'static str) -> Option<u16> {
        self.values.remove(key).and_then(|v| v.as_u16())
    }

    pub fn take_text(&mut self, key: &'static str) -> Option<String> {
        match self.values.remove(key) {
            Some(RawValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn peek_f64(&self, key: &'static str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.as_f64())
    }

    /// Warn once per session about raw keys the standardisation step did
    /// not consume; they are dropped, not forwarded.
    pub fn finish(self, instance: &str, warned: &mut HashSet<&'static str>) {
        for key in self.values.into_keys() {
            if warned.insert(key) {
                warn!(instance, raw_key = key, "raw key has no standard mapping, dropping");
            }
        }
    }
}

/// Expand bitfield words into categorized alert labels.
///
/// `maps` associates a raw register key with its category and bit labels;
/// bits without a label get a generic `<category> bit N` text.
pub fn decode_bitfield_alerts(
    bitfields: &[(&'static str, u16)],
    maps: &[(&'static str, &'static str, &'static [(u8, &'static str)])],
) -> (Vec<i64>, BTreeMap<String, Vec<String>>) {
    let mut codes = Vec::new();
    let mut categorized: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (raw_key, value) in bitfields {
        let Some((_, category, labels)) = maps.iter().find(|(key, _, _)| key == raw_key) else {
            continue;
        };
        for bit in 0..16u8 {
            if value >> bit & 1 == 0 {
                continue;
            }
            codes.push(((*value as i64) << 16) | bit as i64);
            let label = labels
                .iter()
                .find(|(b, _)| *b == bit)
                .map(|(_, text)| (*text).to_owned())
                .unwrap_or_else(|| format!("{category} bit {bit}"));
            categorized.entry((*category).to_owned()).or_default().push(label);
        }
    }

    for labels in categorized.values_mut() {
        labels.sort();
        labels.dedup();
    }
    (codes, categorized)
}
