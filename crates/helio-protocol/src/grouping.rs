//! ---
//! helio_section: "04-device-connectivity"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Wire protocol codecs and register-group planning."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Fuses register descriptors into wire read requests.
//!
//! Devices answer one span per request, so the planner packs as many
//! registers as the device allows into each read while never bridging a
//! gap large enough to hit an unreadable hole. Plugins compute the plan
//! once at init and cache it.

use crate::registers::{RegisterDescriptor, RegisterFunction};

/// A contiguous or near-contiguous run of registers read in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroup {
    pub function: RegisterFunction,
    pub start: u16,
    pub count: u16,
    /// Member keys in address order.
    pub keys: Vec<&'static str>,
}

/// Plan read groups for a descriptor list.
///
/// Sorts by (function, address) and sweeps left to right, extending the
/// current group while the total span stays within `max_regs_per_read` and
/// the gap to the previous end stays within `max_register_gap`. A function
/// change always forces a break.
pub fn build_read_groups(
    descriptors: &[RegisterDescriptor],
    max_regs_per_read: u16,
    max_register_gap: u16,
) -> Vec<ReadGroup> {
    let mut sorted: Vec<&RegisterDescriptor> = descriptors.iter().collect();
    sorted.sort_by_key(|d| (d.function, d.address));

    let mut groups: Vec<ReadGroup> = Vec::new();
    let mut current: Option<ReadGroup> = None;

    for desc in sorted {
        let width = desc.word_count();
        let fits_current = current.as_ref().is_some_and(|group| {
            group.function == desc.function
                && (desc.address + width).saturating_sub(group.start) <= max_regs_per_read
                && desc.address.saturating_sub(group.start + group.count) <= max_register_gap
        });

        if fits_current {
            let group = current.as_mut().expect("checked above");
            group.count = (desc.address + width) - group.start;
            group.keys.push(desc.key);
        } else {
            if let Some(done) = current.take() {
                groups.push(done);
            }
            current = Some(ReadGroup {
                function: desc.function,
                start: desc.address,
                count: width,
                keys: vec![desc.key],
            });
        }
    }
    if let Some(done) = current {
        groups.push(done);
    }
    groups
}
