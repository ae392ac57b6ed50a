//! Queues: named, shaped buffers living in device DRAM or host memory

use serde::{Deserialize, Serialize};

use crate::format::{DataFormat, Dim, GridShape, TileDim};
use crate::op::Tm;

/// Producer name for queues written by the host
pub const HOST_INPUT: &str = "HOST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueType {
    Queue,
    Ram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueLayout {
    Tilized,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueLocation {
    Dram,
    Host,
}

/// One buffer of a queue: a channel and byte address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocInfo {
    pub channel: u32,
    pub address: u64,
    pub read_port: Option<u32>,
    pub write_port: Option<u32>,
}

impl AllocInfo {
    pub fn new(channel: u32, address: u64) -> Self {
        Self {
            channel,
            address,
            read_port: None,
            write_port: None,
        }
    }
}

/// Who writes a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueSource {
    Host,
    /// Written by a chip-to-chip relay outside this netlist
    Relay(String),
    Op(String),
}

impl QueueSource {
    pub fn from_input(input: &str) -> Self {
        if input == HOST_INPUT {
            QueueSource::Host
        } else if input.contains("net2net") {
            QueueSource::Relay(input.to_string())
        } else {
            QueueSource::Op(input.to_string())
        }
    }

    pub fn producer_op(&self) -> Option<&str> {
        match self {
            QueueSource::Op(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub input: String,
    pub source: QueueSource,
    pub input_tms: Vec<Tm>,
    pub entries: u32,
    pub grid_size: GridShape,
    pub dim: Dim,
    pub target_device: u32,
    pub loc: QueueLocation,
    pub alloc_info: Vec<AllocInfo>,
    pub queue_type: QueueType,
    pub layout: QueueLayout,
    pub alias: Option<String>,
    pub data_format: DataFormat,
    pub tile_dim: TileDim,

    // Filled by derivation
    pub input_count: Option<u32>,
    pub src_device: Option<u32>,
}

impl QueueInfo {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        let input = input.into();
        Self {
            name: name.into(),
            source: QueueSource::from_input(&input),
            input,
            input_tms: Vec::new(),
            entries: 1,
            grid_size: GridShape::new(1, 1),
            dim: Dim::default(),
            target_device: 0,
            loc: QueueLocation::Dram,
            alloc_info: Vec::new(),
            queue_type: QueueType::Queue,
            layout: QueueLayout::Tilized,
            alias: None,
            data_format: DataFormat::Float16_b,
            tile_dim: TileDim::default(),
            input_count: None,
            src_device: None,
        }
    }

    /// Rename the producer, keeping `source` in sync
    pub fn set_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
        self.source = QueueSource::from_input(&self.input);
    }

    pub fn is_ram(&self) -> bool {
        self.queue_type == QueueType::Ram
    }

    pub fn is_fed_by_op(&self) -> bool {
        matches!(self.source, QueueSource::Op(_))
    }

    /// A single-entry RAM holding parameters or constants
    pub fn is_param_or_constant(&self) -> bool {
        self.is_ram() && self.entries == 1
    }

    /// Elements across every entry, used to compare aliased storage
    pub fn total_elements(&self) -> u64 {
        self.dim.mblock_tiles()
            * u64::from(self.dim.t)
            * u64::from(self.tile_dim.elements())
            * u64::from(self.grid_size.cores())
            * u64::from(self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_classification() {
        assert_eq!(QueueInfo::new("q0", "HOST").source, QueueSource::Host);
        assert!(matches!(
            QueueInfo::new("q1", "chip0_net2net_3").source,
            QueueSource::Relay(_)
        ));
        let q = QueueInfo::new("q2", "matmul0");
        assert!(q.is_fed_by_op());
        assert_eq!(q.source.producer_op(), Some("matmul0"));
    }

    #[test]
    fn test_total_elements() {
        let mut q = QueueInfo::new("q", "HOST");
        q.entries = 2;
        q.grid_size = GridShape::new(2, 1);
        q.dim.ublock_rt = 2;
        q.dim.mblock_n = 3;
        q.tile_dim = TileDim::R16C32;
        assert_eq!(q.total_elements(), 2 * 3 * 512 * 2 * 2);
    }
}
