//! Read planning
//!
//! Points are grouped by register table, sorted by address and coalesced
//! into range reads while the gap between neighbours stays within `max_gap`
//! and the merged span within `max_span`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bms_types::{Point, PointAddress, RegisterKind};

/// Most registers one read may request (function codes 3 and 4)
pub const MAX_READ_REGISTERS: u16 = 125;
/// Most coils or discrete inputs one read may request (function codes 1 and 2)
pub const MAX_READ_BITS: u16 = 2000;

/// One range read and the points it serves
#[derive(Debug, Clone)]
pub struct ReadBatch {
    pub kind: RegisterKind,
    pub start: u16,
    pub quantity: u16,
    pub points: Vec<Arc<Point>>,
}

impl ReadBatch {
    /// Offset of a point's first register within the batch
    pub fn offset_of(&self, address: u16) -> usize {
        usize::from(address - self.start)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlannerConfig {
    pub max_gap: u16,
    pub max_span: u16,
}

/// Number of table entries a point occupies
pub fn width_of(point: &Point, kind: RegisterKind) -> u16 {
    if kind.is_bit() {
        1
    } else {
        point.data_type.register_count()
    }
}

/// Plan range reads for Modbus points. Non-Modbus points are ignored.
pub fn plan_reads(config: PlannerConfig, points: &[Arc<Point>]) -> Vec<ReadBatch> {
    let mut groups: BTreeMap<RegisterKind, Vec<(u16, Arc<Point>)>> = BTreeMap::new();
    for point in points {
        if let PointAddress::Modbus { register, address } = point.address {
            groups
                .entry(register)
                .or_default()
                .push((address, Arc::clone(point)));
        }
    }

    let mut batches = Vec::new();
    for (kind, mut group) in groups {
        group.sort_by_key(|(address, _)| *address);
        let limit = if kind.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        };
        let max_span = config.max_span.clamp(1, limit);

        let mut current: Option<(u16, u16, Vec<Arc<Point>>)> = None;
        for (address, point) in group {
            let end = address.saturating_add(width_of(&point, kind) - 1);
            current = match current.take() {
                Some((start, batch_end, mut members))
                    if address.saturating_sub(batch_end) <= config.max_gap.saturating_add(1)
                        && end.max(batch_end) - start < max_span =>
                {
                    members.push(point);
                    Some((start, end.max(batch_end), members))
                }
                Some((start, batch_end, members)) => {
                    batches.push(ReadBatch {
                        kind,
                        start,
                        quantity: batch_end - start + 1,
                        points: members,
                    });
                    Some((address, end, vec![point]))
                }
                None => Some((address, end, vec![point])),
            };
        }
        if let Some((start, batch_end, members)) = current {
            batches.push(ReadBatch {
                kind,
                start,
                quantity: batch_end - start + 1,
                points: members,
            });
        }
    }
    batches
}
