//! # IDs
//! Strokes, documents, scratch stores and filter cookies all need process-unique handles. These are provided by
//! `FuzzID<T>`, namespaced by the marker type `T` so that a `StrokeID` can never be confused with a `DocumentID`.
//!
//! IDs are never reused within one execution, which is what makes them safe to hold onto after the thing they
//! name has gone away: a stale ID simply fails to look anything up.

// Next free value, per namespace. Only ever grows.
static ID_SERVER: parking_lot::RwLock<
    std::collections::BTreeMap<std::any::TypeId, std::sync::atomic::AtomicU64>,
> = parking_lot::const_rwlock(std::collections::BTreeMap::new());

/// ID that is guarunteed unique within this execution of the program, within the namespace `T`.
pub struct FuzzID<T: std::any::Any> {
    id: std::num::NonZeroU64,
    _phantom: std::marker::PhantomData<T>,
}
impl<T: std::any::Any> Clone for FuzzID<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: std::any::Any> Copy for FuzzID<T> {}
impl<T: std::any::Any> PartialEq for FuzzID<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T: std::any::Any> Eq for FuzzID<T> {}
impl<T: std::any::Any> PartialOrd for FuzzID<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: std::any::Any> Ord for FuzzID<T> {
    /// Allocation order. Handy for logs, meaningless otherwise.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

// Safety - only a number lives in here. The marker `T` is never stored,
// so its auto traits must not leak onto the ID.
unsafe impl<T: std::any::Any> Send for FuzzID<T> {}
unsafe impl<T: std::any::Any> Sync for FuzzID<T> {}

impl<T: std::any::Any> std::hash::Hash for FuzzID<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T: std::any::Any> FuzzID<T> {
    /// Get the raw numeric value of this ID.
    /// IDs from differing namespaces may share the same numeric ID!
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id.get()
    }
    /// Allocate the next ID of this namespace.
    #[must_use]
    pub fn next() -> Self {
        let ty = std::any::TypeId::of::<T>();
        let value = {
            let read = ID_SERVER.upgradable_read();
            if let Some(counter) = read.get(&ty) {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            } else {
                // First ID of this namespace. Happens a handful of times per process.
                let mut write = parking_lot::RwLockUpgradableReadGuard::upgrade(read);
                // Another thread may have raced us between the upgrade.
                write
                    .entry(ty)
                    .or_insert_with(|| 1.into())
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            }
        };
        // 2^64 allocations would take centuries, but a wrapped ID would silently alias a live one.
        let Some(id) = std::num::NonZeroU64::new(value) else {
            panic!("{} ID overflow!", std::any::type_name::<T>());
        };
        Self {
            id,
            _phantom: std::marker::PhantomData,
        }
    }
}
impl<T: std::any::Any> Default for FuzzID<T> {
    fn default() -> Self {
        Self::next()
    }
}
impl<T: std::any::Any> std::fmt::Display for FuzzID<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = std::any::type_name::<T>();
        // rsplit always yields at least one element.
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "{short}#{}", self.id)
    }
}
impl<T: std::any::Any> std::fmt::Debug for FuzzID<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}
