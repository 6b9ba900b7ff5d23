//! Flat keyed containers for the in-memory domain graph.
//!
//! Aggregates never hold owning pointers into each other; they store ids and
//! the server resolves them through these maps on access.

use std::collections::hash_map::{self, Entry, HashMap};
use std::fmt;
use std::iter::FromIterator;
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;

use crate::model::ids::Id;

/// A `HashMap` keyed by the ids of the values it holds.
#[derive(Debug, Clone)]
pub struct IdMap<T: Id>(HashMap<T::Id, T>);

#[allow(clippy::needless_pass_by_value)]
impl<T: Id> IdMap<T> {
    pub fn get<I: Id<Id=T::Id>>(&self, id: I) -> Option<&T> {
        self.0.get(&id.id())
    }

    pub fn contains<I: Id<Id=T::Id>>(&self, id: I) -> bool {
        self.0.contains_key(&id.id())
    }

    pub fn insert(&mut self, new: T) {
        self.0.insert(new.id(), new);
    }

    pub fn extend<I: IntoIterator<Item=T>>(&mut self, new: I) {
        self.0.extend(
            new.into_iter()
                .map(|t| (t.id(), t))
        );
    }

    pub fn get_mut<I: Id<Id=T::Id>>(&mut self, id: I) -> Option<&mut T> {
        self.0.get_mut(&id.id())
    }

    pub fn entry<I: Id<Id=T::Id>>(&mut self, id: I) -> Entry<T::Id, T> {
        self.0.entry(id.id())
    }

    pub fn remove<I: Id<Id=T::Id>>(&mut self, id: I) -> Option<T> {
        self.0.remove(&id.id())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Values<T::Id, T> {
        self.0.values()
    }

    pub fn iter_mut(&mut self) -> hash_map::ValuesMut<T::Id, T> {
        self.0.values_mut()
    }
}

impl<T: Id> Default for IdMap<T> {
    fn default() -> Self {
        Self(HashMap::default())
    }
}

impl<T: Id> IntoIterator for IdMap<T> {
    type Item = T;

    type IntoIter = hash_map::IntoValues<T::Id, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_values()
    }
}

impl<'a, T: Id> IntoIterator for &'a IdMap<T> {
    type Item = &'a T;
    type IntoIter = hash_map::Values<'a, T::Id, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<I: Id + Serialize> Serialize for IdMap<I> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(self.0.len()))?;
        self.iter().try_for_each(|i| seq.serialize_element(i))?;
        seq.end()
    }
}

impl<I: Id> FromIterator<I> for IdMap<I> {
    fn from_iter<T: IntoIterator<Item=I>>(iter: T) -> Self {
        let map = iter.into_iter()
            .map(|i| (i.id(), i))
            .collect();
        Self(map)
    }
}

struct IdMapVisitor<I>(PhantomData<I>);

impl<'de, I: Id + Deserialize<'de>> Visitor<'de> for IdMapVisitor<I> {
    type Value = IdMap<I>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of objects with ids")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut this = IdMap::default();

        while let Some(item) = seq.next_element()? {
            this.insert(item);
        }

        Ok(this)
    }
}

impl<'de, I: Id + Deserialize<'de>> Deserialize<'de> for IdMap<I> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_seq(IdMapVisitor(PhantomData))
    }
}
