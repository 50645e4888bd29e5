//! Queue traversal over hardware link pointers
//!
//! The schedule is a graph the hardware mutates concurrently, so the
//! traversal engine captures each node's successor before invoking the
//! handler. A handler may therefore unlink or free the node it is
//! visiting without derailing the walk.

use core::mem::size_of;

use super::pool::{DescriptorPool, QhHandle, QtdHandle};
use super::{QueueHead, QueueTd};
use crate::error::{Result, UsbError};
use crate::hw::UsbHw;

/// Handler decision after visiting one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Visit the next node
    Continue,
    /// End the traversal successfully
    Stop,
}

/// Walk the horizontal QH chain starting at `head`.
///
/// The walk ends at a terminate bit or when the chain loops back to
/// `head` (the asynchronous schedule is circular). Link pointers that
/// do not map into the pool end the walk with `InvalidState`.
pub fn qh_foreach<const N: usize, F>(
    pool: &DescriptorPool<QueueHead, N>,
    head: QhHandle,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(QhHandle, &QueueHead) -> Result<Verdict>,
{
    let head_addr = pool.addr_of(head);
    let mut current = Some(head);
    while let Some(handle) = current {
        let qh = pool.get(handle);
        // Successor first: the handler may unlink or free this node
        let next = match qh.next_qh() {
            Some(addr) if addr == head_addr => None,
            Some(addr) => Some(pool.handle_of_addr(addr).ok_or(UsbError::InvalidState)?),
            None => None,
        };
        match handler(handle, qh)? {
            Verdict::Stop => return Ok(()),
            Verdict::Continue => {}
        }
        current = next;
    }
    Ok(())
}

/// Walk the qTD chain hanging off a QH's overlay.
///
/// An empty queue (overlay next pointer terminated) is not an error;
/// the handler is simply never called.
pub fn qtd_foreach<const N: usize, F>(
    pool: &DescriptorPool<QueueTd, N>,
    qh: &QueueHead,
    mut handler: F,
) -> Result<()>
where
    F: FnMut(QtdHandle, &QueueTd) -> Result<Verdict>,
{
    let mut addr = qh.first_qtd();
    while let Some(a) = addr {
        let handle = pool.handle_of_addr(a).ok_or(UsbError::InvalidState)?;
        let qtd = pool.get(handle);
        let next = qtd.next_qtd();
        match handler(handle, qtd)? {
            Verdict::Stop => return Ok(()),
            Verdict::Continue => {}
        }
        addr = next;
    }
    Ok(())
}

/// Free every qTD queued on a QH, unlinking from the head each time.
pub fn qtd_discard<const N: usize>(
    pool: &mut DescriptorPool<QueueTd, N>,
    qh: &QueueHead,
) -> Result<()> {
    use core::sync::atomic::Ordering;

    while let Some(addr) = qh.first_qtd() {
        let handle = pool.handle_of_addr(addr).ok_or(UsbError::InvalidState)?;
        let next = pool.get(handle).next.load(Ordering::Acquire);
        qh.next_qtd.store(next, Ordering::Release);
        pool.release(handle)?;
    }
    Ok(())
}

/// Free a QH and everything queued on it.
pub fn qh_discard<const NQH: usize, const NQTD: usize>(
    qh_pool: &mut DescriptorPool<QueueHead, NQH>,
    qtd_pool: &mut DescriptorPool<QueueTd, NQTD>,
    handle: QhHandle,
) -> Result<()> {
    {
        let qh = qh_pool.get(handle);
        qtd_discard(qtd_pool, qh)?;
    }
    qh_pool.release(handle)
}

/// Write back a QH and its qTD chain so the controller sees them.
pub fn qh_flush<H: UsbHw, const N: usize>(
    hw: &H,
    qtd_pool: &DescriptorPool<QueueTd, N>,
    qh: &QueueHead,
) -> Result<()> {
    hw.dcache_clean(qh as *const QueueHead as usize, size_of::<QueueHead>());
    qtd_foreach(qtd_pool, qh, |_, qtd| {
        hw.dcache_clean(qtd as *const QueueTd as usize, size_of::<QueueTd>());
        Ok(Verdict::Continue)
    })
}

/// Discard cached copies of a QH and its qTD chain before reading
/// hardware-written status.
pub fn qh_refresh<H: UsbHw, const N: usize>(
    hw: &H,
    qtd_pool: &DescriptorPool<QueueTd, N>,
    qh: &QueueHead,
) -> Result<()> {
    hw.dcache_invalidate(qh as *const QueueHead as usize, size_of::<QueueHead>());
    qtd_foreach(qtd_pool, qh, |_, qtd| {
        hw.dcache_invalidate(qtd as *const QueueTd as usize, size_of::<QueueTd>());
        Ok(Verdict::Continue)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qtd_chain<const N: usize>(
        pool: &mut DescriptorPool<QueueTd, N>,
        qh: &QueueHead,
        count: usize,
    ) -> heapless::Vec<QtdHandle, N> {
        let mut handles = heapless::Vec::new();
        let mut prev: Option<QtdHandle> = None;
        for _ in 0..count {
            let h = pool.allocate().unwrap();
            match prev {
                Some(p) => pool.get(p).link_next(pool.addr_of(h)),
                None => qh.link_qtd(pool.addr_of(h)),
            }
            let _ = handles.push(h);
            prev = Some(h);
        }
        handles
    }

    #[test]
    fn test_qtd_foreach_visits_all() {
        let mut pool: DescriptorPool<QueueTd, 8> = DescriptorPool::new();
        let qh = QueueHead::new();
        qtd_chain(&mut pool, &qh, 5);

        let mut visits = 0;
        qtd_foreach(&pool, &qh, |_, _| {
            visits += 1;
            Ok(Verdict::Continue)
        })
        .unwrap();
        assert_eq!(visits, 5);
    }

    #[test]
    fn test_qtd_foreach_empty_queue_is_ok() {
        let pool: DescriptorPool<QueueTd, 4> = DescriptorPool::new();
        let qh = QueueHead::new();
        let mut visits = 0;
        qtd_foreach(&pool, &qh, |_, _| {
            visits += 1;
            Ok(Verdict::Continue)
        })
        .unwrap();
        assert_eq!(visits, 0);
    }

    #[test]
    fn test_qtd_foreach_stop_aborts_early() {
        let mut pool: DescriptorPool<QueueTd, 8> = DescriptorPool::new();
        let qh = QueueHead::new();
        qtd_chain(&mut pool, &qh, 4);

        let mut visits = 0;
        qtd_foreach(&pool, &qh, |_, _| {
            visits += 1;
            if visits == 2 {
                Ok(Verdict::Stop)
            } else {
                Ok(Verdict::Continue)
            }
        })
        .unwrap();
        assert_eq!(visits, 2);
    }

    #[test]
    fn test_qtd_foreach_error_propagates() {
        let mut pool: DescriptorPool<QueueTd, 8> = DescriptorPool::new();
        let qh = QueueHead::new();
        qtd_chain(&mut pool, &qh, 3);

        let mut visits = 0;
        let result = qtd_foreach(&pool, &qh, |_, _| {
            visits += 1;
            Err(UsbError::TransactionError)
        });
        assert_eq!(result, Err(UsbError::TransactionError));
        assert_eq!(visits, 1);
    }

    #[test]
    fn test_qtd_discard_frees_whole_chain() {
        let mut pool: DescriptorPool<QueueTd, 8> = DescriptorPool::new();
        let qh = QueueHead::new();
        qtd_chain(&mut pool, &qh, 6);
        assert_eq!(pool.available(), 2);

        qtd_discard(&mut pool, &qh).unwrap();
        assert_eq!(pool.available(), 8);
        assert!(qh.first_qtd().is_none());
    }

    #[test]
    fn test_qh_foreach_follows_links() {
        let mut pool: DescriptorPool<QueueHead, 4> = DescriptorPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        pool.get(a).link_to(pool.addr_of(b));
        pool.get(b).link_to(pool.addr_of(c));

        let mut order = heapless::Vec::<QhHandle, 4>::new();
        qh_foreach(&pool, a, |h, _| {
            let _ = order.push(h);
            Ok(Verdict::Continue)
        })
        .unwrap();
        assert_eq!(order.as_slice(), &[a, b, c]);
    }

    #[test]
    fn test_qh_foreach_circular_list_terminates() {
        let mut pool: DescriptorPool<QueueHead, 4> = DescriptorPool::new();
        let head = pool.allocate().unwrap();
        let other = pool.allocate().unwrap();
        pool.get(head).link_to(pool.addr_of(other));
        pool.get(other).link_to(pool.addr_of(head));

        let mut visits = 0;
        qh_foreach(&pool, head, |_, _| {
            visits += 1;
            Ok(Verdict::Continue)
        })
        .unwrap();
        assert_eq!(visits, 2);
    }

    #[test]
    fn test_qh_foreach_handler_may_unlink_current() {
        let mut pool: DescriptorPool<QueueHead, 4> = DescriptorPool::new();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.get(a).link_to(pool.addr_of(b));

        let mut visits = 0;
        qh_foreach(&pool, a, |_, qh| {
            visits += 1;
            qh.unlink();
            Ok(Verdict::Continue)
        })
        .unwrap();
        // b is still visited because its address was captured first
        assert_eq!(visits, 2);
    }

    #[test]
    fn test_qh_discard_returns_everything() {
        let mut qh_pool: DescriptorPool<QueueHead, 2> = DescriptorPool::new();
        let mut qtd_pool: DescriptorPool<QueueTd, 4> = DescriptorPool::new();
        let qh = qh_pool.allocate().unwrap();
        let t0 = qtd_pool.allocate().unwrap();
        let t1 = qtd_pool.allocate().unwrap();
        qh_pool.get(qh).link_qtd(qtd_pool.addr_of(t0));
        qtd_pool.get(t0).link_next(qtd_pool.addr_of(t1));

        qh_discard(&mut qh_pool, &mut qtd_pool, qh).unwrap();
        assert_eq!(qh_pool.available(), 2);
        assert_eq!(qtd_pool.available(), 4);
    }
}
