//! Name interning.
//!
//! Channel names (and other protocol identifiers) travel as compact integer
//! handles when both peers pre-registered them, or as literal strings
//! otherwise. [`NameTable`] is an injectable service — constructed once and
//! shared by reference, never a process-wide singleton — seeded with the
//! fixed well-known table so the hardcoded wire indices match what peers
//! expect.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// The fixed pre-registered table. Order defines the wire index of each
/// entry; appending is safe, reordering is a protocol break.
pub const HARDCODED_NAMES: &[&str] = &[
    "None",
    "Control",
    "Actor",
    "Voice",
    "Tick",
    "PlayerController",
    "GameNetDriver",
    "BeaconNetDriver",
];

/// Compact handle for an interned name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NameHandle(pub u32);

struct Inner {
    by_name: HashMap<String, u32>,
    by_index: Vec<String>,
}

/// Interning service mapping canonical identifiers to integer handles.
pub struct NameTable {
    inner: RwLock<Inner>,
}

impl NameTable {
    /// A table seeded with [`HARDCODED_NAMES`].
    pub fn new() -> Self {
        let mut by_name = HashMap::new();
        let mut by_index = Vec::with_capacity(HARDCODED_NAMES.len());
        for (i, name) in HARDCODED_NAMES.iter().enumerate() {
            by_name.insert((*name).to_string(), i as u32);
            by_index.push((*name).to_string());
        }
        Self {
            inner: RwLock::new(Inner { by_name, by_index }),
        }
    }

    /// Intern `name`, returning its stable handle.
    pub fn intern(&self, name: &str) -> NameHandle {
        if let Ok(inner) = self.inner.read() {
            if let Some(index) = inner.by_name.get(name) {
                return NameHandle(*index);
            }
        }
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(index) = inner.by_name.get(name) {
            return NameHandle(*index);
        }
        let index = inner.by_index.len() as u32;
        inner.by_index.push(name.to_string());
        inner.by_name.insert(name.to_string(), index);
        NameHandle(index)
    }

    /// Resolve a handle back to its string, if it was ever interned here.
    pub fn resolve(&self, handle: NameHandle) -> Option<String> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_index.get(handle.0 as usize).cloned()
    }

    /// Whether `handle` is in the pre-registered range and may travel as a
    /// bare index.
    pub fn is_hardcoded(&self, handle: NameHandle) -> bool {
        (handle.0 as usize) < HARDCODED_NAMES.len()
    }

    /// Look up a name without interning it.
    pub fn find(&self, name: &str) -> Option<NameHandle> {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.by_name.get(name).copied().map(NameHandle)
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f.debug_struct("NameTable")
            .field("len", &inner.by_index.len())
            .finish()
    }
}
