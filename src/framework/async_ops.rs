//! Asynchronous variants of the one-sided ops.
//!
//! Each op posts its work request once, then alternates a single poll
//! attempt with `tokio::task::yield_now()` until its completion arrives.
//! The scheduling model is strictly cooperative and single-threaded: run
//! these on a current-thread runtime, one top-level coroutine per compute
//! thread, and never move a future across threads.  Dropping a future
//! before it resolves leaks its slots until the thread's shutdown audit
//! catches it.

use crate::common::pointer::RemotePtr;
use crate::fatal;

use super::compute_thread::{from_u64, to_u64, ComputeThread};

impl ComputeThread {
    pub async fn read_async<T: Copy>(&mut self, ptr: RemotePtr<T>, fence: bool) -> T {
        let size = std::mem::size_of::<T>();
        if self.is_local(ptr) {
            let val = unsafe { std::ptr::read_volatile(ptr.as_local() as *const T) };
            self.metrics.read.ops += 1;
            self.metrics.read.bytes += size as u64;
            return val;
        }
        let staging = match self.staging.acquire(size, std::mem::align_of::<T>()) {
            Some(buf) => buf,
            None => fatal!("staging ring exhausted for a {}-byte async read", size),
        };
        let p = self.issue_read(ptr.raw(), staging as u64, size, fence);
        while !self.op_done(ptr.raw(), &p) {
            tokio::task::yield_now().await;
        }
        let val = unsafe { std::ptr::read(staging as *const T) };
        self.staging.release(staging);
        self.retire(p);
        self.metrics.read.ops += 1;
        self.metrics.read.bytes += size as u64;
        val
    }

    pub async fn write_async<T: Copy>(&mut self, ptr: RemotePtr<T>, val: &T, fence: bool) {
        let size = std::mem::size_of::<T>();
        if self.is_local(ptr) {
            self.write_opts(ptr, val, fence, true);
            return;
        }
        let staging = match self.staging.acquire(size, std::mem::align_of::<T>()) {
            Some(buf) => buf,
            None => fatal!("staging ring exhausted for a {}-byte async write", size),
        };
        unsafe {
            std::ptr::write_bytes(staging, 0, size);
            std::ptr::copy_nonoverlapping(val as *const T as *const u8, staging, size);
        }
        let p = self.issue_write(ptr.raw(), staging as u64, size, fence);
        while !self.op_done(ptr.raw(), &p) {
            tokio::task::yield_now().await;
        }
        self.staging.release(staging);
        self.retire(p);
        self.metrics.write.ops += 1;
        self.metrics.write.bytes += size as u64;
    }

    pub async fn cas_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        expected: T,
        swap: T,
        fence: bool,
    ) -> T {
        if std::mem::size_of::<T>() > 8 {
            fatal!("cas_async requires size_of::<T>() <= 8");
        }
        let staging = match self.staging.acquire(8, 8) {
            Some(buf) => buf,
            None => fatal!("staging ring exhausted for an async cas"),
        };
        let p = self.issue_cas(ptr.raw(), staging as u64, to_u64(expected), to_u64(swap), fence);
        while !self.op_done(ptr.raw(), &p) {
            tokio::task::yield_now().await;
        }
        let prev = unsafe { std::ptr::read(staging as *const u64) };
        self.staging.release(staging);
        self.retire(p);
        self.metrics.cas += 1;
        from_u64(prev)
    }

    pub async fn faa_async<T: Copy>(&mut self, ptr: RemotePtr<T>, add: u64, fence: bool) -> T {
        if std::mem::size_of::<T>() > 8 {
            fatal!("faa_async requires size_of::<T>() <= 8");
        }
        let staging = match self.staging.acquire(8, 8) {
            Some(buf) => buf,
            None => fatal!("staging ring exhausted for an async faa"),
        };
        let p = self.issue_faa(ptr.raw(), staging as u64, add, fence);
        while !self.op_done(ptr.raw(), &p) {
            tokio::task::yield_now().await;
        }
        let prev = unsafe { std::ptr::read(staging as *const u64) };
        self.staging.release(staging);
        self.retire(p);
        self.metrics.faa += 1;
        from_u64(prev)
    }

    /// Async sequenced read.  Unsignaled calls append and resolve to None
    /// immediately; the signaled terminator yields between poll attempts
    /// and resolves to the batch's staged values in issue order.
    pub async fn seq_read_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        let size = std::mem::size_of::<T>();
        let staging = match self.staging.acquire(size, std::mem::align_of::<T>()) {
            Some(buf) => buf,
            None => fatal!("staging ring exhausted for a {}-byte async seq read", size),
        };
        match self.seq_append(ptr.raw(), false, staging as u64, size, Some(staging), signal, fence)
        {
            None => None,
            Some((idx, slot)) => {
                let lane = self.seq_lane(idx);
                while !self.slot_done(ptr.raw(), lane, slot) {
                    tokio::task::yield_now().await;
                }
                Some(self.finish_seq::<T>(idx))
            }
        }
    }

    /// Async sequenced write.  Local pointers degrade exactly like the
    /// synchronous path.
    pub async fn seq_write_async<T: Copy>(
        &mut self,
        ptr: RemotePtr<T>,
        val: &T,
        signal: bool,
        fence: bool,
    ) -> Option<Vec<T>> {
        let size = std::mem::size_of::<T>();
        if self.is_local(ptr) {
            return self.seq_write(ptr, val, signal, fence);
        }
        let staging = match self.staging.acquire(size, std::mem::align_of::<T>()) {
            Some(buf) => buf,
            None => fatal!("staging ring exhausted for a {}-byte async seq write", size),
        };
        unsafe {
            std::ptr::write_bytes(staging, 0, size);
            std::ptr::copy_nonoverlapping(val as *const T as *const u8, staging, size);
        }
        match self.seq_append(ptr.raw(), true, staging as u64, size, Some(staging), signal, fence)
        {
            None => None,
            Some((idx, slot)) => {
                let lane = self.seq_lane(idx);
                while !self.slot_done(ptr.raw(), lane, slot) {
                    tokio::task::yield_now().await;
                }
                Some(self.finish_seq::<T>(idx))
            }
        }
    }
}
