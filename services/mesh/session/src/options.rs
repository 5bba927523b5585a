//! Protocol options shared by every connection of one protocol instance.

use chrono::{DateTime, Utc};
use mesh_wire::{ByteOrder, Message, PackConfig, TypeRegistry, Unpack, WireError, DEFAULT_MAX_CHUNK_SIZE};
use std::sync::Arc;

/// Default capacity of incoming message queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Immutable protocol configuration
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Reference point for timestamp fields
    pub epoch: DateTime<Utc>,
    /// Byte order of packed integer fields
    pub byte_order: ByteOrder,
    /// Capacity of each incoming message queue
    pub queue_capacity: usize,
    /// Largest accepted chunk payload
    pub max_chunk_size: usize,
    /// Wire name to message type mapping
    pub registry: TypeRegistry,
}

impl ProtocolOptions {
    /// Start building options from defaults
    pub fn builder() -> ProtocolOptionsBuilder {
        ProtocolOptionsBuilder::default()
    }

    /// Field encoding settings derived from these options
    pub fn pack_config(&self) -> PackConfig {
        PackConfig {
            byte_order: self.byte_order,
            epoch: self.epoch,
        }
    }
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            epoch: DateTime::<Utc>::UNIX_EPOCH,
            byte_order: ByteOrder::Little,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            registry: TypeRegistry::new(),
        }
    }
}

/// Builder for [`ProtocolOptions`]
#[derive(Debug, Default)]
pub struct ProtocolOptionsBuilder {
    options: ProtocolOptions,
}

impl ProtocolOptionsBuilder {
    /// Set the timestamp reference epoch
    pub fn epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.options.epoch = epoch;
        self
    }

    /// Set the field byte order
    pub fn byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.options.byte_order = byte_order;
        self
    }

    /// Set the incoming queue capacity (at least 1)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.options.queue_capacity = capacity.max(1);
        self
    }

    /// Set the largest accepted chunk payload
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.options.max_chunk_size = size;
        self
    }

    /// Map a message type to a wire name
    pub fn map<T: Message + Unpack>(mut self, name: impl Into<String>) -> Result<Self, WireError> {
        self.options.registry.map::<T>(name, false)?;
        Ok(self)
    }

    /// Map a message type, replacing any existing association
    pub fn map_override<T: Message + Unpack>(mut self, name: impl Into<String>) -> Result<Self, WireError> {
        self.options.registry.map::<T>(name, true)?;
        Ok(self)
    }

    /// Mutable access to the registry while building
    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.options.registry
    }

    /// Freeze the options
    pub fn build(self) -> Arc<ProtocolOptions> {
        Arc::new(self.options)
    }
}
