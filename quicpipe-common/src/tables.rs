//! Tables owned by the control plane. The engine only reads them, except for
//! the rejected cids sink which it only writes to.

use crate::{Cid, Redirect4};

/// UDP destination ports subject to cid inspection.
pub trait PortFilter {
    /// `port` is in network byte order, as read from the UDP header.
    fn contains(&self, port: u16) -> bool;
}

/// Learned cid to backend mapping.
pub trait RedirectTable {
    /// Returns a copy of the entry so a concurrent update or eviction can't
    /// be observed half way.
    fn lookup(&self, cid: &Cid) -> Option<Redirect4>;
}

/// Best effort channel for cids that failed the lookup.
pub trait RejectSink {
    /// Must never block. Returns false if the record was discarded.
    fn try_publish(&self, cid: &Cid) -> bool;
}

impl<T: PortFilter + ?Sized> PortFilter for &T {
    #[inline(always)]
    fn contains(&self, port: u16) -> bool {
        (**self).contains(port)
    }
}

impl<T: RedirectTable + ?Sized> RedirectTable for &T {
    #[inline(always)]
    fn lookup(&self, cid: &Cid) -> Option<Redirect4> {
        (**self).lookup(cid)
    }
}

impl<T: RejectSink + ?Sized> RejectSink for &T {
    #[inline(always)]
    fn try_publish(&self, cid: &Cid) -> bool {
        (**self).try_publish(cid)
    }
}
