// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The handle table: an arena of resources dispatched through a small,
//! closed set of interfaces -- "integer handle -> virtual dispatch". A
//! generation-checked [`slab::Slab`] stands in for a hand-rolled handle
//! table, and a trait object stands in for pointer-compared type tags.

use crate::{
    fail::Fail,
    sock::{ByteStream, Message},
    timer::Deadline,
};
use slab::Slab;
use std::{
    cell::RefCell,
    future::Future,
    io::{IoSlice, IoSliceMut},
    pin::Pin,
    rc::Rc,
};

pub type DoneFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Fail>> + 'a>>;

/// Optional outbound half-close a value wrapped in the handle table (a raw
/// transport, or a protocol adapter sitting on one) may implement --
/// `TcpStream::close`'s FIN-and-drain, or `term`/`hup`'s terminator
/// message. [`Resource::done`]'s generic impls forward here; types with
/// nothing graceful to do just inherit the default.
pub trait Donable {
    fn done<'a>(&'a mut self, _deadline: Deadline) -> DoneFuture<'a> {
        Box::pin(std::future::ready(Err(Fail::NotSupported {
            details: "done() is not supported by this handle",
        })))
    }
}

/// Opaque handle. Low 32 bits are the slab index, high 32 bits are the slot
/// generation -- a handle from a closed slot never aliases a later resource
/// that happens to reuse the same index.
pub type Handle = u64;

fn pack(index: usize, generation: u32) -> Handle {
    (index as u64) | ((generation as u64) << 32)
}

fn unpack(h: Handle) -> (usize, u32) {
    ((h & 0xffff_ffff) as usize, (h >> 32) as u32)
}

/// The interfaces a resource may expose. `query` dispatches on this rather
/// than on pointer-compared sentinel values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interface {
    ByteStream,
    Message,
}

/// Every handle-table entry implements this. Objects opt in to the
/// interfaces they support by overriding `as_bytestream`/`as_message`.
pub trait Resource {
    fn as_bytestream(&mut self) -> Option<&mut dyn ByteStream> {
        None
    }

    fn as_message(&mut self) -> Option<&mut dyn Message> {
        None
    }

    /// Releases every resource this object owns, including any inner
    /// handle. Must not block -- blocking teardown belongs in `done` or in
    /// a protocol adapter's `detach`.
    fn close(&mut self) -> Result<(), Fail>;

    /// Outbound half-close. Not every resource supports this.
    fn done<'a>(&'a mut self, _deadline: Deadline) -> DoneFuture<'a> {
        Box::pin(std::future::ready(Err(Fail::NotSupported {
            details: "done() is not supported by this handle",
        })))
    }

    /// Unwraps the resource back to a concrete, owned value -- the
    /// counterpart to [`HandleTable::take`], used by adapters that
    /// `hown` a handle, reclaim the underlying socket, and reinsert it
    /// wrapped in themselves (`attach`), or the reverse (`detach`).
    fn into_any(self: Box<Self>) -> Box<dyn std::any::Any>;
}

/// Each slot's resource lives behind its own `Rc<RefCell<_>>` rather than
/// inline in the slab, so that a long-running operation on one handle (a
/// `send` that awaits across many polls) only locks that handle, not the
/// whole table -- unrelated handles stay usable while it's in flight.
struct Slot {
    generation: u32,
    resource: Rc<RefCell<Box<dyn Resource>>>,
}

struct Inner {
    table: Slab<Slot>,
    next_generation: u32,
}

/// Per-thread arena of [`Resource`]s. Never shared across threads: a handle
/// belongs to the table that minted it.
#[derive(Clone)]
pub struct HandleTable {
    inner: Rc<RefCell<Inner>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                table: Slab::new(),
                next_generation: 1,
            })),
        }
    }

    /// Inserts a resource, returning its handle.
    pub fn make(&self, resource: Box<dyn Resource>) -> Handle {
        let mut inner = self.inner.borrow_mut();
        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1).max(1);
        let index = inner.table.insert(Slot {
            generation,
            resource: Rc::new(RefCell::new(resource)),
        });
        pack(index, generation)
    }

    /// Clones out the `Rc` backing `h`'s resource, for callers (like async
    /// send/recv) that need to hold a borrow across an `.await` without
    /// locking every other handle for the duration.
    pub fn get_resource(&self, h: Handle) -> Result<Rc<RefCell<Box<dyn Resource>>>, Fail> {
        let (index, generation) = unpack(h);
        let inner = self.inner.borrow();
        match inner.table.get(index) {
            Some(slot) if slot.generation == generation => Ok(slot.resource.clone()),
            _ => Err(Fail::BadHandle),
        }
    }

    pub fn query_bytestream(&self, h: Handle) -> Result<(), Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        if guard.as_bytestream().is_some() {
            Ok(())
        } else {
            Err(Fail::NotSupported {
                details: "handle does not implement bytestream",
            })
        }
    }

    pub fn with_bytestream<R>(
        &self,
        h: Handle,
        f: impl FnOnce(&mut dyn ByteStream) -> R,
    ) -> Result<R, Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        guard.as_bytestream().map(f).ok_or(Fail::NotSupported {
            details: "handle does not implement bytestream",
        })
    }

    pub fn with_message<R>(
        &self,
        h: Handle,
        f: impl FnOnce(&mut dyn Message) -> R,
    ) -> Result<R, Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        guard.as_message().map(f).ok_or(Fail::NotSupported {
            details: "handle does not implement message",
        })
    }

    /// Sends on the bytestream behind `h`. Only this handle's own `Rc`
    /// is locked for the duration of the (possibly many-poll) send, so
    /// other handles stay fully usable while it's in flight; a second
    /// concurrent operation on the *same* handle fails fast with
    /// [`Fail::ResourceExhausted`] instead of deadlocking.
    pub async fn send(&self, h: Handle, iov: &[IoSlice<'_>], deadline: Deadline) -> Result<(), Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        let stream = guard.as_bytestream().ok_or(Fail::NotSupported {
            details: "handle does not implement bytestream",
        })?;
        stream.send(iov, deadline).await
    }

    pub async fn recv(
        &self,
        h: Handle,
        iov: &mut [IoSliceMut<'_>],
        deadline: Deadline,
    ) -> Result<usize, Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        let stream = guard.as_bytestream().ok_or(Fail::NotSupported {
            details: "handle does not implement bytestream",
        })?;
        stream.recv(iov, deadline).await
    }

    pub async fn send_msg(&self, h: Handle, iov: &[IoSlice<'_>], deadline: Deadline) -> Result<(), Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        let message = guard.as_message().ok_or(Fail::NotSupported {
            details: "handle does not implement message",
        })?;
        message.send_msg(iov, deadline).await
    }

    pub async fn recv_msg(
        &self,
        h: Handle,
        iov: &mut [IoSliceMut<'_>],
        deadline: Deadline,
    ) -> Result<usize, Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        let message = guard.as_message().ok_or(Fail::NotSupported {
            details: "handle does not implement message",
        })?;
        message.recv_msg(iov, deadline).await
    }

    /// Atomically transfers ownership of the object referenced by `h` to a
    /// fresh handle, invalidating `h`. Adapters use this to prevent a caller
    /// from touching a handle they wrapped.
    pub fn hown(&self, h: Handle) -> Result<Handle, Fail> {
        let (index, generation) = unpack(h);
        let mut inner = self.inner.borrow_mut();
        let slot = match inner.table.get(index) {
            Some(slot) if slot.generation == generation => (),
            _ => return Err(Fail::BadHandle),
        };
        let _ = slot;
        let slot = inner.table.remove(index);
        let new_generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1).max(1);
        let new_index = inner.table.insert(Slot {
            generation: new_generation,
            resource: slot.resource,
        });
        Ok(pack(new_index, new_generation))
    }

    /// Closes a handle. Idempotent-safe only after this call returns;
    /// errors other than [`Fail::BadHandle`] are dropped -- a close that
    /// fails has still freed the slot, so there is nothing left to report
    /// the error against.
    pub fn close(&self, h: Handle) -> Result<(), Fail> {
        let (index, generation) = unpack(h);
        let mut inner = self.inner.borrow_mut();
        match inner.table.get(index) {
            Some(slot) if slot.generation == generation => (),
            _ => return Err(Fail::BadHandle),
        }
        let slot = inner.table.remove(index);
        drop(inner);
        // Another in-flight operation could in principle still hold this
        // handle's Rc (e.g. a send that's mid-await when the caller closes
        // it from another task); closing is then a best-effort no-op on our
        // end until that borrow releases, same as the BadHandle-on-stale
        // generation behavior everywhere else in this table.
        if let Ok(mut resource) = slot.resource.try_borrow_mut() {
            let _ = resource.close();
        }
        Ok(())
    }

    pub async fn done(&self, h: Handle, deadline: Deadline) -> Result<(), Fail> {
        let resource = self.get_resource(h)?;
        let mut guard = resource
            .try_borrow_mut()
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?;
        guard.done(deadline).await
    }

    /// Removes `h` and downcasts its resource back to a concrete, owned
    /// `T`. The counterpart to [`HandleTable::make`], used by adapters
    /// that `attach`/`detach` themselves onto an existing handle: take the
    /// raw socket out, wrap (or unwrap) it, and `make` it back in.
    ///
    /// Fails with [`Fail::ResourceExhausted`] if another clone of this
    /// handle's `Rc` is still alive (e.g. an in-flight send/recv), since
    /// taking ownership out from under a concurrent borrow would be
    /// unsound, and with [`Fail::Invalid`] if the resource isn't a `T`.
    pub fn take<T: 'static>(&self, h: Handle) -> Result<T, Fail> {
        let (index, generation) = unpack(h);
        let mut inner = self.inner.borrow_mut();
        match inner.table.get(index) {
            Some(slot) if slot.generation == generation => (),
            _ => return Err(Fail::BadHandle),
        }
        let slot = inner.table.remove(index);
        drop(inner);
        let boxed = Rc::try_unwrap(slot.resource)
            .map_err(|_| Fail::ResourceExhausted {
                details: "handle is busy with another operation",
            })?
            .into_inner();
        boxed
            .into_any()
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|_| Fail::Invalid {
                details: "handle does not hold the requested resource type",
            })
    }

    pub fn is_valid(&self, h: Handle) -> bool {
        let (index, generation) = unpack(h);
        self.inner
            .borrow()
            .table
            .get(index)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(bool);
    impl Resource for Dummy {
        fn close(&mut self) -> Result<(), Fail> {
            self.0 = true;
            Ok(())
        }
        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
            self
        }
    }

    #[test]
    fn take_downcasts_and_removes_the_handle() {
        let t = HandleTable::new();
        let h = t.make(Box::new(Dummy(false)));
        let dummy = t.take::<Dummy>(h).unwrap();
        assert!(!dummy.0);
        assert!(!t.is_valid(h));
    }

    #[test]
    fn take_wrong_type_is_invalid() {
        let t = HandleTable::new();
        let h = t.make(Box::new(Dummy(false)));
        assert_eq!(t.take::<u32>(h), Err(Fail::Invalid { details: "handle does not hold the requested resource type" }));
    }

    #[test]
    fn make_and_close() {
        let t = HandleTable::new();
        let h = t.make(Box::new(Dummy(false)));
        assert!(t.is_valid(h));
        t.close(h).unwrap();
        assert!(!t.is_valid(h));
    }

    #[test]
    fn close_unknown_is_bad_handle() {
        let t = HandleTable::new();
        let h = t.make(Box::new(Dummy(false)));
        t.close(h).unwrap();
        assert_eq!(t.close(h), Err(Fail::BadHandle));
    }

    #[test]
    fn hown_invalidates_old_and_keeps_object() {
        let t = HandleTable::new();
        let h1 = t.make(Box::new(Dummy(false)));
        let h2 = t.hown(h1).unwrap();
        assert!(!t.is_valid(h1));
        assert!(t.is_valid(h2));
    }

    #[test]
    fn stale_generation_is_rejected_after_slot_reuse() {
        let t = HandleTable::new();
        let h1 = t.make(Box::new(Dummy(false)));
        t.close(h1).unwrap();
        let h2 = t.make(Box::new(Dummy(false)));
        // Same slab index is very likely reused; the generation must differ.
        assert_ne!(h1, h2);
        assert!(!t.is_valid(h1));
        assert!(t.is_valid(h2));
    }
}
