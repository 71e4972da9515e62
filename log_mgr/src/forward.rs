use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cache_flush::backend::FlushBackend;
use cache_flush::engine::FlushEngine;
use cache_flush::region::RegionQuery;

/// Out-of-band flush forwarder used by the deferred/batched flush policy.
/// Only the hand-off is specified here; scheduling inside an implementation
/// is its own business.
pub trait FlushSink: Send + Sync {
    /// Hands a dirty byte range to the forwarder.
    fn forward(&self, addr: u64, size: usize);

    /// Blocks until everything forwarded so far has been flushed.
    fn drain(&self) {}
}

enum Msg {
    Range(u64, usize),
    Drain(mpsc::Sender<()>),
}

/// Background thread draining forwarded ranges and flushing them without
/// fences; the callers established ordering already.
pub struct ChannelForwarder {
    tx: Mutex<Option<mpsc::Sender<Msg>>>,
    worker: Option<JoinHandle<()>>,
}

impl ChannelForwarder {
    pub fn spawn<B, R>(engine: FlushEngine<B, R>) -> Self
    where
        B: FlushBackend + Send + 'static,
        R: RegionQuery + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::spawn(move || {
            for msg in rx {
                match msg {
                    Msg::Range(addr, size) => engine.flush_range_unconstrained(addr, size),
                    Msg::Drain(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Some(worker),
        }
    }
}

impl FlushSink for ChannelForwarder {
    fn forward(&self, addr: u64, size: usize) {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(Msg::Range(addr, size)).is_err() {
                    log::warn!("flush forwarder worker is gone, dropping range");
                }
            }
            None => log::warn!("forward after forwarder shutdown"),
        }
    }

    fn drain(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            let tx = self.tx.lock().unwrap();
            match tx.as_ref() {
                Some(tx) => {
                    if tx.send(Msg::Drain(ack_tx)).is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
        let _ = ack_rx.recv();
    }
}

impl Drop for ChannelForwarder {
    fn drop(&mut self) {
        // dropping the sender ends the worker loop
        self.tx.lock().unwrap().take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Records forwarded ranges for assertions.
#[derive(Clone, Default)]
pub struct CollectSink {
    ranges: Arc<Mutex<Vec<(u64, usize)>>>,
}

impl CollectSink {
    pub fn ranges(&self) -> Vec<(u64, usize)> {
        self.ranges.lock().unwrap().clone()
    }
}

impl FlushSink for CollectSink {
    fn forward(&self, addr: u64, size: usize) {
        self.ranges.lock().unwrap().push((addr, size));
    }
}
