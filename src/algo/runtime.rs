//! Shard workers: single-threaded executors that own algo instances and
//! their market-data subscription state.

use super::instrument::Instrument;
use super::Algo;
use crate::marketdata::MdSnapshot;
use crossbeam::channel::{unbounded, Sender};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A task executed on a shard with exclusive access to its state.
pub(crate) type ShardTask = Box<dyn FnOnce(&mut ShardState) + Send>;

/// Per-(source, security) subscription entry: the shard-local previous
/// snapshot and the subscribed instruments in registration order.
#[derive(Default)]
pub(crate) struct SubEntry {
    pub prev: MdSnapshot,
    pub instruments: Vec<Arc<Instrument>>,
}

/// Worker-local state. Only the shard thread touches it.
#[derive(Default)]
pub(crate) struct ShardState {
    pub algos: HashMap<u32, Box<dyn Algo>>,
    pub subs: HashMap<(u32, u32), SubEntry>,
}

/// One shard: a sticky worker thread plus the shared handles producers use
/// to reach it (task queue, dirty set, subscription refcounts).
pub(crate) struct Shard {
    tx: Option<Sender<ShardTask>>,
    pub dirty: Arc<Mutex<HashSet<(u32, u32)>>>,
    pub refs: Arc<DashMap<(u32, u32), u32>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    pub fn spawn(index: usize) -> Self {
        let (tx, rx) = unbounded::<ShardTask>();
        let handle = std::thread::Builder::new()
            .name(format!("algo-shard-{index}"))
            .spawn(move || {
                let mut state = ShardState::default();
                while let Ok(task) = rx.recv() {
                    task(&mut state);
                }
            })
            .ok();
        Self {
            tx: Some(tx),
            dirty: Arc::new(Mutex::new(HashSet::new())),
            refs: Arc::new(DashMap::new()),
            handle: Mutex::new(handle),
        }
    }

    pub fn post(&self, task: ShardTask) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(task);
        }
    }

    /// Run a task and wait for it (wiring and tests; never from callbacks).
    pub fn post_and_wait(&self, task: ShardTask) {
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        self.post(Box::new(move |state| {
            task(state);
            let _ = done_tx.send(());
        }));
        let _ = done_rx.recv();
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Ok(mut h) = self.handle.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.shutdown();
    }
}
