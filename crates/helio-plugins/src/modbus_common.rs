//! ---
//! helio_section: "05-device-plugins"
//! helio_subsection: "module"
//! helio_type: "source"
//! helio_scope: "code"
//! helio_description: "Device plugin contract, poll workers and concrete drivers."
//! helio_version: "v0.4.2"
//! helio_owner: "tbd"
//! ---
//! Shared machinery for Modbus-backed plugins: transport construction,
//! cached read-group plans, per-group retries and raw decoding.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use helio_common::config::{ConnectionKind, InstanceConfig};
use helio_protocol::{
    build_read_groups, decode_register, ModbusClient, ModbusMode, ProtocolError, RawValue,
    ReadGroup, RegisterDescriptor, WordOrder,
};
use helio_transport::{SerialTransport, TcpTransport};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{PluginError, Result};

/// Which communication tuning keys the user pinned in the instance
/// section; pinned values are never auto-adjusted.
#[derive(Debug, Clone, Copy)]
struct PinnedTuning {
    timeout: bool,
    inter_read_delay: bool,
    max_regs_per_read: bool,
}

impl PinnedTuning {
    fn from_instance(instance: &InstanceConfig) -> Self {
        Self {
            timeout: instance.raw.contains_key("modbus_timeout_seconds"),
            inter_read_delay: instance.raw.contains_key("inter_read_delay_ms"),
            max_regs_per_read: instance.raw.contains_key("max_regs_per_read"),
        }
    }
}

/// Which cached group plan a read covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSet {
    Static,
    Dynamic,
}

/// One Modbus device driven through cached read groups.
#[derive(Debug)]
pub struct ModbusDriver {
    instance: String,
    client: ModbusClient,
    word_order: WordOrder,
    timeout: Duration,
    inter_read_delay: Duration,
    max_retries: u32,
    registers: &'static [RegisterDescriptor],
    max_regs_per_read: u16,
    max_register_gap: u16,
    pinned: PinnedTuning,
    descriptors: HashMap<&'static str, RegisterDescriptor>,
    static_groups: Vec<ReadGroup>,
    dynamic_groups: Vec<ReadGroup>,
    /// Group starts the device answered with an exception; skipped until
    /// the next reconnect.
    unreadable: HashSet<u16>,
}

impl ModbusDriver {
    /// Build the driver from instance config and a register map. The group
    /// plan is computed here once and cached.
    pub fn new(
        instance: &InstanceConfig,
        registers: &'static [RegisterDescriptor],
        word_order: WordOrder,
    ) -> Self {
        let (transport, mode): (Box<dyn helio_transport::ByteTransport>, ModbusMode) =
            match instance.connection {
                ConnectionKind::Tcp => (
                    Box::new(TcpTransport::new(instance.tcp_host.clone(), instance.tcp_port)),
                    ModbusMode::Tcp,
                ),
                ConnectionKind::Serial => (
                    Box::new(SerialTransport::new(
                        instance.serial_port.clone(),
                        instance.baud_rate,
                    )),
                    ModbusMode::Rtu,
                ),
            };
        let client = ModbusClient::new(transport, mode, instance.slave_address);

        let statics: Vec<RegisterDescriptor> =
            registers.iter().filter(|d| d.is_static).copied().collect();
        let dynamics: Vec<RegisterDescriptor> =
            registers.iter().filter(|d| !d.is_static).copied().collect();

        Self {
            instance: instance.name.clone(),
            client,
            word_order,
            timeout: instance.modbus_timeout,
            inter_read_delay: instance.inter_read_delay,
            max_retries: instance.max_read_retries_per_group,
            registers,
            max_regs_per_read: instance.max_regs_per_read,
            max_register_gap: instance.max_register_gap,
            pinned: PinnedTuning::from_instance(instance),
            descriptors: registers.iter().map(|d| (d.key, *d)).collect(),
            static_groups: build_read_groups(
                &statics,
                instance.max_regs_per_read,
                instance.max_register_gap,
            ),
            dynamic_groups: build_read_groups(
                &dynamics,
                instance.max_regs_per_read,
                instance.max_register_gap,
            ),
            unreadable: HashSet::new(),
        }
    }

    /// Adapt unpinned communication tuning to the measured link RTT. A
    /// slow converter gets longer gaps between requests and smaller
    /// register windows; both directly reduce retry storms.
    fn auto_adjust(&mut self, rtt: Duration) {
        let rtt_ms = rtt.as_millis() as u64;

        if !self.pinned.inter_read_delay {
            let delay_ms = (rtt_ms * 12 / 10 + 50).clamp(20, 1000);
            self.inter_read_delay = Duration::from_millis(delay_ms);
        }

        if !self.pinned.max_regs_per_read {
            let max_regs = if rtt_ms > 200 {
                30
            } else if rtt_ms > 80 {
                45
            } else {
                self.max_regs_per_read
            };
            if max_regs != self.max_regs_per_read {
                self.max_regs_per_read = max_regs;
                self.rebuild_groups();
            }
        }

        if !self.pinned.timeout {
            let floor = Duration::from_secs(5);
            self.timeout = (self.inter_read_delay * 2 + Duration::from_secs(2)).max(floor);
        }

        info!(
            instance = %self.instance,
            rtt_ms,
            delay_ms = self.inter_read_delay.as_millis() as u64,
            max_regs = self.max_regs_per_read,
            timeout_s = self.timeout.as_secs(),
            "communication tuning adjusted to link"
        );
    }

    fn rebuild_groups(&mut self) {
        let statics: Vec<RegisterDescriptor> =
            self.registers.iter().filter(|d| d.is_static).copied().collect();
        let dynamics: Vec<RegisterDescriptor> =
            self.registers.iter().filter(|d| !d.is_static).copied().collect();
        self.static_groups =
            build_read_groups(&statics, self.max_regs_per_read, self.max_register_gap);
        self.dynamic_groups =
            build_read_groups(&dynamics, self.max_regs_per_read, self.max_register_gap);
    }

    pub fn describe(&self) -> String {
        self.client.describe()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn connect(&mut self, deadline: Duration) -> Result<bool> {
        self.client.connect(deadline).await?;
        // A fresh connection gets a fresh chance at previously refused groups.
        self.unreadable.clear();
        if let Some(rtt) = self.client.measured_rtt() {
            self.auto_adjust(rtt);
        }
        Ok(true)
    }

    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }

    /// Read and decode one group set. Per-group retries with a fixed
    /// inter-read delay; a protocol exception marks the group unreadable
    /// for this connection and the sweep continues with the rest.
    pub async fn read_groups(&mut self, which: GroupSet) -> Result<HashMap<&'static str, RawValue>> {
        let groups = match which {
            GroupSet::Static => self.static_groups.clone(),
            GroupSet::Dynamic => self.dynamic_groups.clone(),
        };
        let mut decoded: HashMap<&'static str, RawValue> = HashMap::new();

        for (index, group) in groups.iter().enumerate() {
            if self.unreadable.contains(&group.start) {
                continue;
            }

            let words = match self.read_one_group(group).await {
                Ok(words) => words,
                Err(PluginError::ExceptionResponse { code }) => {
                    warn!(
                        instance = %self.instance,
                        start = group.start,
                        count = group.count,
                        code,
                        "device rejected register group, skipping until reconnect"
                    );
                    self.unreadable.insert(group.start);
                    continue;
                }
                Err(err) if decoded.is_empty() => return Err(err),
                Err(err) => {
                    // Earlier groups already produced data this cycle.
                    return Err(PluginError::PartialGroup {
                        start: group.start,
                        reason: err.to_string(),
                    });
                }
            };

            for key in &group.keys {
                let Some(desc) = self.descriptors.get(key) else {
                    continue;
                };
                let offset = (desc.address - group.start) as usize;
                let end = offset + desc.word_count() as usize;
                if end > words.len() {
                    continue;
                }
                match decode_register(desc, &words[offset..end], self.word_order) {
                    Ok(value) => {
                        decoded.insert(*key, value);
                    }
                    Err(err) => {
                        // The affected key is omitted; the read still counts.
                        warn!(
                            instance = %self.instance,
                            key,
                            words = ?&words[offset..end],
                            error = %err,
                            "register failed to decode"
                        );
                    }
                }
            }

            if !self.inter_read_delay.is_zero() && index < groups.len() - 1 {
                sleep(self.inter_read_delay).await;
            }
        }

        Ok(decoded)
    }

    async fn read_one_group(&mut self, group: &ReadGroup) -> Result<Vec<u16>> {
        let mut attempt = 0u32;
        loop {
            match self
                .client
                .read_registers(group.function, group.start, group.count, self.timeout)
                .await
            {
                Ok(words) => return Ok(words),
                Err(ProtocolError::Exception { code }) => {
                    return Err(PluginError::ExceptionResponse { code });
                }
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        instance = %self.instance,
                        start = group.start,
                        attempt,
                        error = %err,
                        "group read retry"
                    );
                    sleep(self.inter_read_delay).await;
                }
                Err(err) => {
                    // Retries exhausted: drop the connection so the worker
                    // reconnects instead of hammering a dead link.
                    self.client.disconnect().await;
                    return Err(err.into());
                }
            }
        }
    }
}
