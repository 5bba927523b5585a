//! Message types shared by the loopback tests.

use crate::options::ProtocolOptions;
use mesh_wire::{Message, PackReader, PackWriter, Unpack, WireError};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Text(pub String);

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl Message for Text {
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError> {
        writer.put_str(&self.0)
    }
}

impl Unpack for Text {
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError> {
        Ok(Self(reader.get_str()?))
    }
}

#[derive(Debug)]
pub struct Unknown;

impl Message for Unknown {
    fn pack(&self, _writer: &mut PackWriter) -> Result<(), WireError> {
        Ok(())
    }
}

pub fn echo_options() -> Arc<ProtocolOptions> {
    ProtocolOptions::builder()
        .map::<Text>("test.text")
        .expect("fresh registry")
        .build()
}
