//! Message types and option presets shared by the mesh tests.

use crate::options::{MeshOptions, MeshOptionsBuilder};
use mesh_session::ProtocolOptions;
use mesh_wire::{Message, PackReader, PackWriter, Unpack, WireError};
use std::time::Duration;

pub const NOTE: &str = "test.note";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note(pub String);

impl Note {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl Message for Note {
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
        writer.put_str(&self.0)
    }
}

impl Unpack for Note {
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        Ok(Self(reader.get_str()?))
    }
}

/// `Note` mapped, short timings for loopback runs
pub fn fast_options() -> MeshOptionsBuilder {
    let protocol = ProtocolOptions::builder().map::<Note>(NOTE).expect("fresh registry");
    MeshOptions::builder(protocol)
        .network_id(&b"test-net"[..])
        .connection_timeout(Duration::from_secs(2))
        .reconnect_delay(Duration::from_millis(20))
        .tick_interval(Duration::from_millis(5))
}
