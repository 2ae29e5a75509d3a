//! Type registry shared by the message-format protocols
//!
//! Maps a Rust message type to a stable wire identifier and back. Each entry
//! carries the encode/decode functions for one format's intermediate
//! representation `R` (a JSON value, a protobuf body, ...).

use crate::error::{NetError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// A message of any registered type
pub type AnyMessage = Box<dyn Any + Send + Sync>;

/// Encodes a message known to be of the entry's type
pub type EncodeFn<R> = fn(&(dyn Any + Send + Sync)) -> Result<R>;

/// Decodes the intermediate representation into the entry's type
pub type DecodeFn<R> = fn(R) -> Result<AnyMessage>;

struct Entry<I, R> {
    id: I,
    type_name: &'static str,
    encode: EncodeFn<R>,
    decode: DecodeFn<R>,
}

/// Bidirectional registry between message types and wire identifiers
pub struct MessageRegistry<I, R> {
    by_type: HashMap<TypeId, Entry<I, R>>,
    by_id: HashMap<I, TypeId>,
}

impl<I: Debug, R> Debug for MessageRegistry<I, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field(
                "types",
                &self
                    .by_type
                    .values()
                    .map(|e| (&e.id, e.type_name))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<I, R> Default for MessageRegistry<I, R> {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            by_id: HashMap::new(),
        }
    }
}

impl<I, R> MessageRegistry<I, R>
where
    I: Clone + Eq + Hash + Display,
{
    /// Register `T` under `id`. Both must be new to the registry.
    pub fn register<T: Any>(&mut self, id: I, encode: EncodeFn<R>, decode: DecodeFn<R>) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        if self.by_id.contains_key(&id) {
            return Err(NetError::DuplicateRegistration(format!("id {}", id)));
        }
        if self.by_type.contains_key(&type_id) {
            return Err(NetError::DuplicateRegistration(format!("type {}", type_name)));
        }
        self.by_id.insert(id.clone(), type_id);
        self.by_type.insert(
            type_id,
            Entry {
                id,
                type_name,
                encode,
                decode,
            },
        );
        Ok(())
    }

    /// Encode `msg`, returning its wire identifier alongside
    pub fn encode(&self, msg: &(dyn Any + Send + Sync)) -> Result<(I, R)> {
        let entry = self
            .by_type
            .get(&msg.type_id())
            .ok_or_else(|| NetError::NotRegistered(self.unknown_type_message()))?;
        Ok((entry.id.clone(), (entry.encode)(msg)?))
    }

    /// `dyn Any` carries no type name, so list the registered ones
    fn unknown_type_message(&self) -> String {
        if self.by_type.is_empty() {
            return "message type is unknown; registry is empty".to_string();
        }
        let mut names: Vec<_> = self.by_type.values().map(|e| e.type_name).collect();
        names.sort_unstable();
        format!("message type is none of the registered types: {}", names.join(", "))
    }

    /// Decode `raw` as the type registered under `id`
    pub fn decode(&self, id: &I, raw: R) -> Result<AnyMessage> {
        let entry = self
            .by_id
            .get(id)
            .and_then(|type_id| self.by_type.get(type_id))
            .ok_or_else(|| NetError::NotRegistered(format!("id {}", id)))?;
        (entry.decode)(raw)
    }

    /// Wire identifier registered for `T`
    pub fn id_of<T: Any>(&self) -> Option<&I> {
        self.by_type.get(&TypeId::of::<T>()).map(|e| &e.id)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Downcast helper used by the generated encode functions
pub(crate) fn downcast<T: Any>(msg: &(dyn Any + Send + Sync)) -> Result<&T> {
    msg.downcast_ref::<T>()
        .ok_or_else(|| NetError::NotRegistered(std::any::type_name::<T>().to_string()))
}
