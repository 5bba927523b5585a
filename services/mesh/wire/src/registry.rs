//! Two-way mapping between wire type names and local message types.
//!
//! Each mapped type contributes a decode function that is looked up by the
//! incoming type name, so no runtime reflection is needed to construct
//! messages on receipt.

use crate::codec::{PackReader, PackWriter};
use crate::error::WireError;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-erasure helper implemented for every `'static` type
pub trait AsAny: Any {
    /// Borrow as `dyn Any`
    fn as_any(&self) -> &dyn Any;
    /// Rust type name, for diagnostics
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A value that can travel inside a message envelope
pub trait Message: AsAny + Send + Sync + fmt::Debug {
    /// Write this message's fields
    fn pack(&self, writer: &mut PackWriter) -> Result<(), WireError>;
}

/// Construct a message from its packed fields
pub trait Unpack: Sized {
    /// Read the fields written by [`Message::pack`]
    fn unpack(reader: &mut PackReader) -> Result<Self, WireError>;
}

impl dyn Message {
    /// Concrete type id of the message behind the trait object
    pub fn message_type_id(&self) -> TypeId {
        AsAny::as_any(self).type_id()
    }

    /// Whether the message is a `T`
    pub fn is<T: Message>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }

    /// Borrow the message as a `T` if it is one
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }
}

type DecodeFn = fn(&mut PackReader) -> Result<Arc<dyn Message>, WireError>;

fn decode_as<T: Message + Unpack>(reader: &mut PackReader) -> Result<Arc<dyn Message>, WireError> {
    Ok(Arc::new(T::unpack(reader)?))
}

#[derive(Clone)]
struct NameEntry {
    type_id: TypeId,
    decode: DecodeFn,
}

/// Registry of message types known to one protocol instance
#[derive(Clone, Default)]
pub struct TypeRegistry {
    by_name: HashMap<String, NameEntry>,
    by_type: HashMap<TypeId, String>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry").field("names", &names).finish()
    }
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `T` with `name` in both directions.
    ///
    /// Fails with [`WireError::AlreadyMapped`] if either side already has
    /// an association, unless `override_existing` is set, in which case the
    /// previous associations of both the name and the type are replaced.
    pub fn map<T: Message + Unpack>(
        &mut self,
        name: impl Into<String>,
        override_existing: bool,
    ) -> Result<(), WireError> {
        let name = name.into();
        let type_id = TypeId::of::<T>();

        if !override_existing {
            if self.by_name.contains_key(&name) {
                return Err(WireError::AlreadyMapped(name));
            }
            if let Some(existing) = self.by_type.get(&type_id) {
                return Err(WireError::AlreadyMapped(existing.clone()));
            }
        } else {
            if let Some(old) = self.by_name.remove(&name) {
                self.by_type.remove(&old.type_id);
            }
            if let Some(old_name) = self.by_type.remove(&type_id) {
                self.by_name.remove(&old_name);
            }
        }

        self.by_name.insert(
            name.clone(),
            NameEntry {
                type_id,
                decode: decode_as::<T>,
            },
        );
        self.by_type.insert(type_id, name);
        Ok(())
    }

    /// Remove both associations of `T`; returns whether it was mapped
    pub fn unmap<T: Message>(&mut self) -> bool {
        match self.by_type.remove(&TypeId::of::<T>()) {
            Some(name) => {
                self.by_name.remove(&name);
                true
            }
            None => false,
        }
    }

    /// Local type registered under `name`
    pub fn resolve_type(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).map(|entry| entry.type_id)
    }

    /// Wire name registered for a local type
    pub fn resolve_name(&self, type_id: TypeId) -> Option<&str> {
        self.by_type.get(&type_id).map(String::as_str)
    }

    /// Wire name registered for `T`
    pub fn name_of<T: Message>(&self) -> Option<&str> {
        self.resolve_name(TypeId::of::<T>())
    }

    /// Wire name of a message instance
    pub fn name_for(&self, message: &dyn Message) -> Result<&str, WireError> {
        self.resolve_name(message.message_type_id())
            .ok_or(WireError::Unmapped(message.type_name()))
    }

    /// Decode a body using the type registered under `name`
    pub fn decode(&self, name: &str, reader: &mut PackReader) -> Result<Arc<dyn Message>, WireError> {
        let entry = self
            .by_name
            .get(name)
            .ok_or_else(|| WireError::UnknownType(name.to_string()))?;
        (entry.decode)(reader)
    }

    /// Number of mapped types
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether no types are mapped
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
