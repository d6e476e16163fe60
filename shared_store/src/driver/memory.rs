//! In-process shared-store backend.
//!
//! Cells live in a `DashMap` keyed by the schema's typed keys; the map's
//! entry API holds the shard lock for the duration of each primitive, which
//! is what makes every primitive atomic per key.

use std::collections::{HashMap, HashSet};

use dashmap::{mapref::entry::Entry, DashMap};

use super::{Error, SharedStore};
use crate::keys::Key;

#[derive(Debug)]
enum Cell {
    Counter(i64),
    Bytes(Vec<u8>),
    Set(HashSet<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
}

impl Cell {
    fn kind(&self) -> &'static str {
        match self {
            Cell::Counter(_) => "counter",
            Cell::Bytes(_) => "bytes",
            Cell::Set(_) => "set",
            Cell::Hash(_) => "hash",
        }
    }
}

fn wrong_kind(key: &Key, expected: &'static str, found: &Cell) -> Error {
    Error::WrongKind {
        key: key.to_string(),
        expected,
        found: found.kind(),
    }
}

#[derive(Default)]
pub struct MemoryDriver {
    cells: DashMap<Key, Cell>,
}

impl SharedStore for MemoryDriver {
    fn atomic_increment(&self, key: &Key, delta: i64) -> Result<i64, Error> {
        let mut cell = self
            .cells
            .entry(key.clone())
            .or_insert(Cell::Counter(0));
        match cell.value_mut() {
            Cell::Counter(value) => {
                *value += delta;
                Ok(*value)
            }
            other => Err(wrong_kind(key, "counter", other)),
        }
    }

    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, Error> {
        match self.cells.get(key) {
            Some(cell) => match cell.value() {
                Cell::Bytes(bytes) => Ok(Some(bytes.clone())),
                other => Err(wrong_kind(key, "bytes", other)),
            },
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        key: &Key,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, Error> {
        match self.cells.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(new) = new {
                    vacant.insert(Cell::Bytes(new.to_vec()));
                }
                Ok(true)
            }
            Entry::Occupied(mut occupied) => {
                let current = match occupied.get() {
                    Cell::Bytes(bytes) => bytes,
                    other => return Err(wrong_kind(key, "bytes", other)),
                };
                if expected != Some(current.as_slice()) {
                    return Ok(false);
                }
                match new {
                    Some(new) => {
                        *occupied.get_mut() = Cell::Bytes(new.to_vec());
                    }
                    None => {
                        occupied.remove();
                    }
                }
                Ok(true)
            }
        }
    }

    fn delete(&self, key: &Key) -> Result<bool, Error> {
        Ok(self.cells.remove(key).is_some())
    }

    fn set_add(&self, key: &Key, member: &[u8]) -> Result<bool, Error> {
        let mut cell = self
            .cells
            .entry(key.clone())
            .or_insert_with(|| Cell::Set(HashSet::new()));
        match cell.value_mut() {
            Cell::Set(members) => Ok(members.insert(member.to_vec())),
            other => Err(wrong_kind(key, "set", other)),
        }
    }

    fn atomic_pop_from_set(&self, key: &Key) -> Result<Option<Vec<u8>>, Error> {
        match self.cells.entry(key.clone()) {
            Entry::Vacant(_) => Ok(None),
            Entry::Occupied(mut occupied) => {
                let members = match occupied.get_mut() {
                    Cell::Set(members) => members,
                    other => {
                        let err = wrong_kind(key, "set", other);
                        return Err(err);
                    }
                };
                let popped = members.iter().next().cloned();
                let popped = match popped {
                    Some(member) => {
                        members.remove(&member);
                        member
                    }
                    None => return Ok(None),
                };
                if members.is_empty() {
                    occupied.remove();
                }
                Ok(Some(popped))
            }
        }
    }

    fn set_remove(&self, key: &Key, member: &[u8]) -> Result<bool, Error> {
        match self.cells.entry(key.clone()) {
            Entry::Vacant(_) => Ok(false),
            Entry::Occupied(mut occupied) => {
                let members = match occupied.get_mut() {
                    Cell::Set(members) => members,
                    other => {
                        let err = wrong_kind(key, "set", other);
                        return Err(err);
                    }
                };
                let removed = members.remove(member);
                if members.is_empty() {
                    occupied.remove();
                }
                Ok(removed)
            }
        }
    }

    fn hash_get(&self, key: &Key, field: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.cells.get(key) {
            Some(cell) => match cell.value() {
                Cell::Hash(fields) => Ok(fields.get(field).cloned()),
                other => Err(wrong_kind(key, "hash", other)),
            },
            None => Ok(None),
        }
    }

    fn hash_set(&self, key: &Key, field: &str, value: &[u8]) -> Result<bool, Error> {
        let mut cell = self
            .cells
            .entry(key.clone())
            .or_insert_with(|| Cell::Hash(HashMap::new()));
        match cell.value_mut() {
            Cell::Hash(fields) => Ok(fields.insert(field.to_string(), value.to_vec()).is_none()),
            other => Err(wrong_kind(key, "hash", other)),
        }
    }
}
