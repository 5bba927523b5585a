//! Demo application message broadcast by the node.

use chrono::{DateTime, Utc};
use mesh_wire::{Message, PackReader, PackWriter, Unpack, WireError};

/// Wire name of [`Heartbeat`]
pub const HEARTBEAT: &str = "mesh-node.heartbeat";

/// Periodic liveness announcement
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    /// Short id of the sending node
    pub node: String,
    /// Increments with every heartbeat
    pub sequence: u64,
    /// Sender clock
    pub sent_at: DateTime<Utc>,
}

impl Message for Heartbeat {
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
        writer.put_str(&self.node)?;
        writer.put_u64(self.sequence);
        writer.put_time(self.sent_at);
        Ok(())
    }
}

impl Unpack for Heartbeat {
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        Ok(Self {
            node: reader.get_str()?,
            sequence: reader.get_u64()?,
            sent_at: reader.get_time()?,
        })
    }
}
