//! Byte pipe over a ring buffer.
//!
//! Writers and readers wait on separate queues. Every transfer that makes
//! progress wakes the whole opposite side; woken threads retry and go back
//! to sleep with whatever part of their timeout is left.

use crate::arch::Arch;
use crate::errors::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::sched::wait_q::WaitQId;
use crate::spinlock::SpinLock;
use crate::time::Timeout;
use alloc::collections::VecDeque;

pub struct Pipe<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    readers: WaitQId,
    writers: WaitQId,
    buf: SpinLock<VecDeque<u8>>,
    size: usize,
}

/// Deadline bookkeeping for a transfer that may block several times.
#[derive(Clone, Copy)]
enum Deadline {
    Forever,
    At(u64),
}

impl Deadline {
    fn new<A: Arch>(kernel: &Kernel<A>, timeout: Timeout) -> Self {
        match timeout.as_ticks() {
            None => Deadline::Forever,
            Some(ticks) => Deadline::At(kernel.uptime_ticks() + ticks as u64),
        }
    }

    fn remaining<A: Arch>(self, kernel: &Kernel<A>) -> Timeout {
        match self {
            Deadline::Forever => Timeout::Forever,
            Deadline::At(at) => match at.saturating_sub(kernel.uptime_ticks()) {
                0 => Timeout::NoWait,
                left => Timeout::ticks(left.min(u32::MAX as u64) as u32),
            },
        }
    }
}

impl<'k, A: Arch> Pipe<'k, A> {
    /// A pipe buffering up to `size` bytes.
    pub fn new(kernel: &'k Kernel<A>, size: usize) -> KResult<Self> {
        if size == 0 {
            return Err(KernelError::Invalid);
        }
        let (readers, writers) = {
            let mut st = kernel.lock_sched();
            (st.wait_qs.alloc(kernel.config(), None), st.wait_qs.alloc(kernel.config(), None))
        };
        Ok(Self { kernel, readers, writers, buf: SpinLock::new(VecDeque::with_capacity(size)), size })
    }

    /// Write from `data`, returning once at least `min_xfer` bytes went in.
    ///
    /// # Returns
    ///
    /// Bytes written. `Io` when `timeout` is `NoWait` and fewer than
    /// `min_xfer` bytes fit, `TimedOut` when the wait expired short of
    /// `min_xfer`, `Invalid` if `min_xfer` exceeds `data.len()`.
    pub fn put(&self, data: &[u8], min_xfer: usize, timeout: Timeout) -> KResult<usize> {
        if min_xfer > data.len() {
            return Err(KernelError::Invalid);
        }
        let deadline = Deadline::new(self.kernel, timeout);
        let mut written = 0;
        loop {
            let mut buf = self.buf.lock(self.kernel.arch());
            if timeout.is_no_wait() && self.size - buf.len() < min_xfer {
                return Err(KernelError::Io);
            }
            let n = (self.size - buf.len()).min(data.len() - written);
            buf.extend(&data[written..written + n]);
            written += n;
            let woke = n > 0 && self.kernel.lock_sched().unpend_all(self.readers, Ok(()));
            if written == data.len() {
                if woke {
                    self.kernel.reschedule_locked(buf);
                }
                return Ok(written);
            }
            let left = deadline.remaining(self.kernel);
            if left.is_no_wait() {
                return short(written, min_xfer);
            }
            match self.kernel.pend_curr(buf, Some(self.writers), left).0 {
                Ok(()) | Err(KernelError::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Read into `buf`, returning once at least `min_xfer` bytes came out.
    ///
    /// # Returns
    ///
    /// Bytes read. Errors mirror [`Pipe::put`].
    pub fn get(&self, out: &mut [u8], min_xfer: usize, timeout: Timeout) -> KResult<usize> {
        if min_xfer > out.len() {
            return Err(KernelError::Invalid);
        }
        let deadline = Deadline::new(self.kernel, timeout);
        let mut read = 0;
        loop {
            let mut buf = self.buf.lock(self.kernel.arch());
            if timeout.is_no_wait() && buf.len() < min_xfer {
                return Err(KernelError::Io);
            }
            let n = buf.len().min(out.len() - read);
            for (slot, byte) in out[read..read + n].iter_mut().zip(buf.drain(..n)) {
                *slot = byte;
            }
            read += n;
            let woke = n > 0 && self.kernel.lock_sched().unpend_all(self.writers, Ok(()));
            if read == out.len() {
                if woke {
                    self.kernel.reschedule_locked(buf);
                }
                return Ok(read);
            }
            let left = deadline.remaining(self.kernel);
            if left.is_no_wait() {
                return short(read, min_xfer);
            }
            match self.kernel.pend_curr(buf, Some(self.readers), left).0 {
                Ok(()) | Err(KernelError::TimedOut) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Bytes that can be read without waiting.
    pub fn read_avail(&self) -> usize {
        self.buf.lock(self.kernel.arch()).len()
    }

    /// Bytes that can be written without waiting.
    pub fn write_avail(&self) -> usize {
        self.size - self.read_avail()
    }

    /// Discard buffered bytes and let blocked writers retry.
    pub fn flush(&self) {
        let mut buf = self.buf.lock(self.kernel.arch());
        buf.clear();
        if self.kernel.lock_sched().unpend_all(self.writers, Ok(())) {
            self.kernel.reschedule_locked(buf);
        }
    }
}

fn short(moved: usize, min_xfer: usize) -> KResult<usize> {
    if moved >= min_xfer {
        Ok(moved)
    } else {
        Err(KernelError::TimedOut)
    }
}

impl<A: Arch> Drop for Pipe<'_, A> {
    fn drop(&mut self) {
        let mut st = self.kernel.lock_sched();
        for wq in [self.readers, self.writers] {
            st.unpend_all(wq, Err(KernelError::Cancelled));
            st.wait_qs.free(wq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot;

    #[test]
    fn test_no_wait_shortfall_is_io() {
        let k = boot();
        let pipe = Pipe::new(k, 4).unwrap();
        assert_eq!(pipe.put(b"abcdef", 5, Timeout::NoWait), Err(KernelError::Io));
        assert_eq!(pipe.put(b"abcdef", 2, Timeout::NoWait), Ok(4));
        assert_eq!(pipe.write_avail(), 0);

        let mut out = [0u8; 8];
        assert_eq!(pipe.get(&mut out, 5, Timeout::NoWait), Err(KernelError::Io));
        assert_eq!(pipe.get(&mut out, 1, Timeout::NoWait), Ok(4));
        assert_eq!(&out[..4], b"abcd");
    }

    #[test]
    fn test_timeout_shortfall() {
        let k = boot();
        let pipe = Pipe::new(k, 2).unwrap();
        assert_eq!(pipe.put(b"xyz", 3, Timeout::Ticks(4)), Err(KernelError::TimedOut));
        // The two bytes that fit stay written.
        assert_eq!(pipe.read_avail(), 2);
        pipe.flush();
        assert_eq!(pipe.put(b"xyz", 1, Timeout::Ticks(4)), Ok(2));
    }

    #[test]
    fn test_min_xfer_larger_than_buffer_is_invalid() {
        let k = boot();
        let pipe = Pipe::new(k, 2).unwrap();
        assert_eq!(pipe.put(b"a", 2, Timeout::Forever), Err(KernelError::Invalid));
        assert!(Pipe::new(k, 0).is_err());
    }
}
