//! Shared structured store
//!
//! A store is a memory-mapped file holding a fixed header followed by a JSON
//! payload:
//!
//! ```text
//! offset  size  field
//!      0     8  magic "IMDSTORE"
//!      8     4  version (u32 LE)
//!     16     8  payload capacity (u64 LE)
//!     24     8  sequence (u64 LE), odd while a writer is publishing
//!     32     8  payload length (u64 LE)
//!     64     -  payload
//! ```
//!
//! In memory the payload is kept as a tree of individually locked nodes so
//! that readers and writers of sibling segments do not serialize on a single
//! lock. Locks are always taken root to leaf and released leaf to root.
//!
//! The sequence word doubles as a cross-handle write lock. A writer claims
//! it by moving it from even to odd, rewrites the payload, and releases it
//! at the next even value. Readers retry when the word is odd or moved
//! while they copied the payload.
//!
//! Lock order: the store state lock comes before any node lock. Node locks
//! are never held while acquiring the state lock.

use crate::error::{DashError, Result};
use crate::path::{PathSegment, SubPath};
use memmap2::MmapMut;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

pub const MAGIC: &[u8; 8] = b"IMDSTORE";
pub const VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;

const VERSION_AT: usize = 8;
const CAPACITY_AT: usize = 16;
const SEQUENCE_AT: usize = 24;
const PAYLOAD_LEN_AT: usize = 32;

/// Sequence of a freshly created store
const INITIAL_SEQUENCE: u64 = 2;
/// Attempts to copy a consistent payload before giving up for this poll
const READ_ATTEMPTS: u32 = 16;
/// Attempts to claim the write lock before failing the write
const WRITE_ATTEMPTS: u32 = 10_000;

type NodeRef = Arc<Mutex<StoreNode>>;

/// One node of the in-memory tree
#[derive(Debug)]
enum StoreNode {
    Leaf(Value),
    Object(BTreeMap<String, NodeRef>),
    Array(Vec<NodeRef>),
}

impl StoreNode {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => StoreNode::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Arc::new(Mutex::new(StoreNode::from_value(v)))))
                    .collect(),
            ),
            Value::Array(items) => StoreNode::Array(
                items
                    .into_iter()
                    .map(|v| Arc::new(Mutex::new(StoreNode::from_value(v))))
                    .collect(),
            ),
            leaf => StoreNode::Leaf(leaf),
        }
    }

    /// Deep copy; child locks are taken while this node is held
    fn to_value(&self) -> Value {
        match self {
            StoreNode::Leaf(v) => v.clone(),
            StoreNode::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, child)| (k.clone(), child.lock().to_value()))
                    .collect(),
            ),
            StoreNode::Array(items) => {
                Value::Array(items.iter().map(|child| child.lock().to_value()).collect())
            }
        }
    }

    fn child(&self, segment: &PathSegment) -> Option<&NodeRef> {
        match (self, segment) {
            (StoreNode::Object(map), PathSegment::Key(k)) => map.get(k),
            (StoreNode::Object(map), PathSegment::Index(i)) => map.get(&i.to_string()),
            (StoreNode::Array(items), seg) => seg.as_index().and_then(|i| items.get(i)),
            (StoreNode::Leaf(_), _) => None,
        }
    }

    fn set_child(&mut self, segment: &PathSegment, value: Value) -> Result<()> {
        let node = Arc::new(Mutex::new(StoreNode::from_value(value)));
        match self {
            StoreNode::Object(map) => {
                let key = match segment {
                    PathSegment::Key(k) => k.clone(),
                    PathSegment::Index(i) => i.to_string(),
                };
                map.insert(key, node);
                Ok(())
            }
            StoreNode::Array(items) => {
                let i = segment
                    .as_index()
                    .ok_or_else(|| DashError::Store(format!("'{}' is not an array index", segment)))?;
                match i.cmp(&items.len()) {
                    std::cmp::Ordering::Less => items[i] = node,
                    std::cmp::Ordering::Equal => items.push(node),
                    std::cmp::Ordering::Greater => {
                        return Err(DashError::Store(format!(
                            "index {} out of range (len {})",
                            i,
                            items.len()
                        )))
                    }
                }
                Ok(())
            }
            StoreNode::Leaf(_) => Err(DashError::Store(format!(
                "cannot set '{}' inside a scalar",
                segment
            ))),
        }
    }
}

/// Guards held from the root down to one node
///
/// Dropping the chain releases the guards leaf first.
struct LockChain {
    guards: Vec<ArcMutexGuard<RawMutex, StoreNode>>,
}

impl LockChain {
    fn acquire(root: &NodeRef, segments: &[PathSegment]) -> Result<Self> {
        let mut chain = LockChain {
            guards: Vec::with_capacity(segments.len() + 1),
        };
        chain.guards.push(root.lock_arc());

        for (depth, segment) in segments.iter().enumerate() {
            let next = chain
                .leaf()
                .child(segment)
                .cloned()
                .ok_or_else(|| {
                    DashError::Store(format!(
                        "'{}' not found at depth {}",
                        segment, depth
                    ))
                })?;
            chain.guards.push(next.lock_arc());
        }
        Ok(chain)
    }

    fn leaf(&self) -> &StoreNode {
        // The root guard is pushed in acquire before anything can fail
        &self.guards[self.guards.len() - 1]
    }

    fn leaf_mut(&mut self) -> &mut StoreNode {
        let last = self.guards.len() - 1;
        &mut self.guards[last]
    }
}

impl Drop for LockChain {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

struct StoreState {
    file: Option<File>,
    mmap: Option<MmapMut>,
    capacity: usize,
    sequence: u64,
    root: NodeRef,
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn write_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// The mapped sequence word
fn sequence_word(mmap: &[u8]) -> &AtomicU64 {
    debug_assert!(mmap.len() >= HEADER_SIZE);
    // SAFETY: mappings start page aligned, SEQUENCE_AT is a multiple of 8 and
    // every mapping is checked to hold at least HEADER_SIZE bytes. The word
    // is only ever accessed atomically, by this and other processes.
    unsafe { &*(mmap.as_ptr().add(SEQUENCE_AT) as *const AtomicU64) }
}

/// Check the header and return the capacity
fn check_header(mmap: &[u8], name: &str) -> Result<usize> {
    if mmap.len() < HEADER_SIZE {
        return Err(DashError::Store(format!(
            "{}: too small ({} bytes, need at least {})",
            name,
            mmap.len(),
            HEADER_SIZE
        )));
    }
    if &mmap[0..8] != MAGIC {
        return Err(DashError::Store(format!("{}: not a store (bad magic)", name)));
    }
    let version = read_u32(mmap, VERSION_AT);
    if version != VERSION {
        return Err(DashError::Store(format!(
            "{}: unsupported version {}",
            name, version
        )));
    }
    let capacity = read_u64(mmap, CAPACITY_AT) as usize;
    if mmap.len() < HEADER_SIZE + capacity {
        return Err(DashError::Store(format!(
            "{}: truncated (capacity {} but {} bytes mapped)",
            name,
            capacity,
            mmap.len()
        )));
    }
    Ok(capacity)
}

/// Parse the payload; the caller must hold the write lock or have validated a copy
fn parse_payload(mmap: &[u8], capacity: usize, name: &str) -> Result<Value> {
    let len = read_u64(mmap, PAYLOAD_LEN_AT) as usize;
    if len > capacity {
        return Err(DashError::Store(format!(
            "{}: payload length {} exceeds capacity {}",
            name, len, capacity
        )));
    }
    if len == 0 {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&mmap[HEADER_SIZE..HEADER_SIZE + len])
        .map_err(|e| DashError::Store(format!("{}: corrupt payload: {}", name, e)))
}

/// Copy and parse a payload no writer touched during the copy
///
/// Returns `Ok(None)` when writers kept the store busy for every attempt.
fn read_payload(mmap: &[u8], capacity: usize, name: &str) -> Result<Option<(u64, Value)>> {
    let word = sequence_word(mmap);
    for _ in 0..READ_ATTEMPTS {
        let sequence = word.load(Ordering::Acquire);
        if sequence % 2 == 1 {
            std::thread::yield_now();
            continue;
        }
        let len = (read_u64(mmap, PAYLOAD_LEN_AT) as usize).min(capacity);
        let mut copy = Vec::with_capacity(HEADER_SIZE + len);
        copy.extend_from_slice(&mmap[..HEADER_SIZE + len]);
        fence(Ordering::Acquire);
        if word.load(Ordering::Relaxed) != sequence {
            std::thread::yield_now();
            continue;
        }
        return parse_payload(&copy, capacity, name).map(|value| Some((sequence, value)));
    }
    Ok(None)
}

/// Claim the write lock, returning the even sequence it held
fn begin_write(mmap: &[u8], name: &str) -> Result<u64> {
    let word = sequence_word(mmap);
    for _ in 0..WRITE_ATTEMPTS {
        let sequence = word.load(Ordering::Relaxed);
        if sequence % 2 == 0
            && word
                .compare_exchange_weak(sequence, sequence + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return Ok(sequence);
        }
        std::thread::yield_now();
    }
    Err(DashError::Store(format!("{}: another writer holds the store", name)))
}

/// Path of the backing file for a store name
pub fn store_file(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// True if the file at `path` starts with the store magic
pub fn is_store_file(path: &Path) -> bool {
    use std::io::Read;
    let mut magic = [0u8; 8];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == MAGIC)
        .unwrap_or(false)
}

/// A handle to one shared store, shared by every source that reads from it
pub struct SharedStore {
    name: String,
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl SharedStore {
    /// Create (or truncate) a store with room for `capacity` payload bytes
    pub fn create(dir: &Path, name: &str, capacity: usize, initial: &Value) -> Result<Self> {
        let payload = serde_json::to_vec(initial)?;
        if payload.len() > capacity {
            return Err(DashError::Store(format!(
                "{}: initial payload of {} bytes exceeds capacity {}",
                name,
                payload.len(),
                capacity
            )));
        }

        let path = store_file(dir, name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((HEADER_SIZE + capacity) as u64)?;

        // SAFETY: the mapping is only accessed through this handle's state lock;
        // other processes writing the file are tolerated by the sequence check.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[0..8].copy_from_slice(MAGIC);
        mmap[VERSION_AT..VERSION_AT + 4].copy_from_slice(&VERSION.to_le_bytes());
        write_u64(&mut mmap, CAPACITY_AT, capacity as u64);
        mmap[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        write_u64(&mut mmap, PAYLOAD_LEN_AT, payload.len() as u64);
        sequence_word(&mmap).store(INITIAL_SEQUENCE, Ordering::Release);

        tracing::debug!("Created store {} ({} bytes)", name, capacity);

        Ok(Self {
            name: name.to_string(),
            path,
            state: Mutex::new(StoreState {
                file: Some(file),
                mmap: Some(mmap),
                capacity,
                sequence: INITIAL_SEQUENCE,
                root: Arc::new(Mutex::new(StoreNode::from_value(initial.clone()))),
            }),
        })
    }

    /// Open an existing store
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = store_file(dir, name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        // SAFETY: see `create`
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let capacity = check_header(&mmap, name)?;
        let (sequence, value) = read_payload(&mmap, capacity, name)?
            .ok_or_else(|| DashError::Store(format!("{}: busy, try again", name)))?;

        tracing::debug!("Opened store {} at sequence {}", name, sequence);

        Ok(Self {
            name: name.to_string(),
            path,
            state: Mutex::new(StoreState {
                file: Some(file),
                mmap: Some(mmap),
                capacity,
                sequence,
                root: Arc::new(Mutex::new(StoreNode::from_value(value))),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number of the tree currently held in memory
    pub fn sequence(&self) -> u64 {
        self.state.lock().sequence
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().mmap.is_none()
    }

    /// Reload the tree if another handle wrote since the last reload.
    /// Returns whether the tree was replaced.
    pub fn revalidate(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let capacity = state.capacity;
        let mmap = state
            .mmap
            .as_ref()
            .ok_or_else(|| DashError::Store(format!("{}: closed", self.name)))?;

        check_header(mmap, &self.name)?;
        if sequence_word(mmap).load(Ordering::Acquire) == state.sequence {
            return Ok(false);
        }
        let Some((sequence, value)) = read_payload(mmap, capacity, &self.name)? else {
            tracing::trace!("Store {} busy, reloading on a later poll", self.name);
            return Ok(false);
        };
        state.root = Arc::new(Mutex::new(StoreNode::from_value(value)));
        state.sequence = sequence;
        tracing::trace!("Store {} reloaded at sequence {}", self.name, sequence);
        Ok(true)
    }

    fn root(&self) -> Result<NodeRef> {
        let state = self.state.lock();
        if state.mmap.is_none() {
            return Err(DashError::Store(format!("{}: closed", self.name)));
        }
        Ok(state.root.clone())
    }

    /// Deep copy of the value at `path`
    pub fn read(&self, path: &SubPath) -> Result<Value> {
        let root = self.root()?;
        let chain = LockChain::acquire(&root, path.segments())?;
        Ok(chain.leaf().to_value())
    }

    /// Replace the value at `path` and publish the new payload
    ///
    /// The write applies to the latest published tree, so values written
    /// through other handles since the last reload are preserved.
    pub fn write(&self, path: &SubPath, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        let StoreState {
            mmap,
            capacity,
            sequence,
            root,
            ..
        } = &mut *state;
        let mmap = mmap
            .as_mut()
            .ok_or_else(|| DashError::Store(format!("{}: closed", self.name)))?;

        let start = begin_write(mmap, &self.name)?;
        let result = self.write_locked(mmap, *capacity, start, sequence, root, path, value);
        let end = if result.is_ok() { start + 2 } else { start };
        sequence_word(mmap).store(end, Ordering::Release);
        if result.is_ok() {
            *sequence = end;
        }
        result
    }

    /// Body of [`Self::write`], run while this handle owns the write lock
    #[allow(clippy::too_many_arguments)]
    fn write_locked(
        &self,
        mmap: &mut MmapMut,
        capacity: usize,
        start: u64,
        sequence: &mut u64,
        root: &mut NodeRef,
        path: &SubPath,
        value: Value,
    ) -> Result<()> {
        if start != *sequence {
            *root = Arc::new(Mutex::new(StoreNode::from_value(parse_payload(
                mmap, capacity, &self.name,
            )?)));
            *sequence = start;
            tracing::trace!("Store {} reloaded at sequence {} before writing", self.name, start);
        }

        match path.split_last() {
            None => *root.lock() = StoreNode::from_value(value),
            Some((parents, last)) => {
                let mut chain = LockChain::acquire(root, parents)?;
                chain.leaf_mut().set_child(last, value)?;
            }
        }

        let payload = serde_json::to_vec(&root.lock().to_value())?;
        if payload.len() > capacity {
            // Roll the in-memory tree back to what the mapping holds
            *root = Arc::new(Mutex::new(StoreNode::from_value(parse_payload(
                mmap, capacity, &self.name,
            )?)));
            return Err(DashError::Store(format!(
                "{}: payload of {} bytes exceeds capacity {}",
                self.name,
                payload.len(),
                capacity
            )));
        }

        mmap[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(&payload);
        write_u64(mmap, PAYLOAD_LEN_AT, payload.len() as u64);
        Ok(())
    }

    /// Unmap the store. Later reads and writes fail. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.mmap.take().is_some() {
            state.file = None;
            tracing::debug!("Closed store {}", self.name);
        }
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sub(p: &str) -> SubPath {
        SubPath::parse(p).unwrap()
    }

    #[test]
    fn test_create_open_read() {
        let dir = tempdir().unwrap();
        let initial = json!({"robot": {"pose": [1.0, 2.0], "name": "r1"}});
        let _writer = SharedStore::create(dir.path(), "state", 4096, &initial).unwrap();

        let store = SharedStore::open(dir.path(), "state").unwrap();
        assert_eq!(store.read(&sub("")).unwrap(), initial);
        assert_eq!(store.read(&sub("robot.pose[1]")).unwrap(), json!(2.0));
        assert_eq!(store.read(&sub("robot/name")).unwrap(), json!("r1"));
        assert!(store.read(&sub("robot.missing")).is_err());
        assert!(is_store_file(&store_file(dir.path(), "state")));
    }

    #[test]
    fn test_write_and_revalidate_from_second_handle() {
        let dir = tempdir().unwrap();
        let a = SharedStore::create(dir.path(), "s", 4096, &json!({"x": 1})).unwrap();
        let b = SharedStore::open(dir.path(), "s").unwrap();

        a.write(&sub("x"), json!(5)).unwrap();
        a.write(&sub("y"), json!([1, 2])).unwrap();
        assert_eq!(a.sequence(), INITIAL_SEQUENCE + 4);
        assert!(!a.revalidate().unwrap());

        assert_eq!(b.read(&sub("x")).unwrap(), json!(1));
        assert!(b.revalidate().unwrap());
        assert_eq!(b.read(&sub("x")).unwrap(), json!(5));
        assert_eq!(b.read(&sub("y[1]")).unwrap(), json!(2));
        assert!(!b.revalidate().unwrap());
    }

    #[test]
    fn test_write_keeps_siblings_written_by_another_handle() {
        let dir = tempdir().unwrap();
        let producer = SharedStore::create(dir.path(), "s", 4096, &json!({"a": 0, "b": 0})).unwrap();
        let widget = SharedStore::open(dir.path(), "s").unwrap();

        // `widget` never revalidates between the two writes
        producer.write(&sub("a"), json!(7)).unwrap();
        widget.write(&sub("b"), json!(5)).unwrap();

        let fresh = SharedStore::open(dir.path(), "s").unwrap();
        assert_eq!(fresh.read(&sub("")).unwrap(), json!({"a": 7, "b": 5}));
        assert_eq!(widget.read(&sub("a")).unwrap(), json!(7));
        assert!(producer.revalidate().unwrap());
        assert_eq!(producer.read(&sub("b")).unwrap(), json!(5));
    }

    #[test]
    fn test_concurrent_handles_do_not_lose_writes() {
        let dir = tempdir().unwrap();
        SharedStore::create(dir.path(), "s", 4096, &json!({"a": 0, "b": 0})).unwrap();

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let store = SharedStore::open(dir.path(), "s").unwrap();
                std::thread::spawn(move || {
                    for i in 1..=100 {
                        store.write(&SubPath::parse(key).unwrap(), json!(i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let fresh = SharedStore::open(dir.path(), "s").unwrap();
        assert_eq!(fresh.read(&sub("")).unwrap(), json!({"a": 100, "b": 100}));
    }

    #[test]
    fn test_write_in_progress_blocks_readers_and_writers() {
        let dir = tempdir().unwrap();
        let owner = SharedStore::create(dir.path(), "s", 4096, &json!({"x": 1})).unwrap();
        let other = SharedStore::open(dir.path(), "s").unwrap();
        owner.write(&sub("x"), json!(2)).unwrap();

        // Claim the write lock as a writer halfway through publishing would
        let start = {
            let state = owner.state.lock();
            begin_write(state.mmap.as_ref().unwrap(), "s").unwrap()
        };
        assert_eq!(start % 2, 0);

        {
            let state = owner.state.lock();
            let mmap = state.mmap.as_ref().unwrap();
            assert!(read_payload(mmap, state.capacity, "s").unwrap().is_none());
        }
        assert!(!other.revalidate().unwrap());
        assert_eq!(other.read(&sub("x")).unwrap(), json!(1));
        assert!(SharedStore::open(dir.path(), "s").is_err());
        assert!(other.write(&sub("x"), json!(3)).is_err());

        {
            let state = owner.state.lock();
            sequence_word(state.mmap.as_ref().unwrap()).store(start, Ordering::Release);
        }
        assert!(other.revalidate().unwrap());
        assert_eq!(other.read(&sub("x")).unwrap(), json!(2));
        other.write(&sub("x"), json!(3)).unwrap();
        assert_eq!(other.sequence(), start + 2);
    }

    #[test]
    fn test_write_array_and_root() {
        let dir = tempdir().unwrap();
        let s = SharedStore::create(dir.path(), "s", 4096, &json!({"v": [0, 1]})).unwrap();
        s.write(&sub("v[2]"), json!(2)).unwrap();
        assert_eq!(s.read(&sub("v")).unwrap(), json!([0, 1, 2]));
        assert!(s.write(&sub("v[9]"), json!(9)).is_err());
        assert!(s.write(&sub("v[0].deep"), json!(1)).is_err());

        s.write(&sub(""), json!({"fresh": true})).unwrap();
        assert_eq!(s.read(&sub("")).unwrap(), json!({"fresh": true}));
    }

    #[test]
    fn test_overflow_is_rejected_and_rolled_back() {
        let dir = tempdir().unwrap();
        let s = SharedStore::create(dir.path(), "s", 32, &json!({"a": 1})).unwrap();
        let err = s.write(&sub("b"), json!("x".repeat(100))).unwrap_err();
        assert!(matches!(err, DashError::Store(_)));
        assert_eq!(s.read(&sub("")).unwrap(), json!({"a": 1}));
        assert_eq!(s.sequence(), INITIAL_SEQUENCE);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("other"), vec![0u8; 128]).unwrap();
        assert!(SharedStore::open(dir.path(), "other").is_err());
        assert!(!is_store_file(&dir.path().join("other")));
        assert!(SharedStore::open(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let s = SharedStore::create(dir.path(), "s", 64, &json!(1)).unwrap();
        s.close();
        s.close();
        assert!(s.is_closed());
        assert!(s.read(&sub("")).is_err());
        assert!(s.write(&sub(""), json!(2)).is_err());
    }

    #[test]
    fn test_sibling_readers_and_writers_do_not_deadlock() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SharedStore::create(
                dir.path(),
                "busy",
                1 << 16,
                &json!({"a": {"x": 0, "y": 0}, "b": {"z": 0}}),
            )
            .unwrap(),
        );

        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            let done_tx = done_tx.clone();
            handles.push(std::thread::spawn(move || {
                let key = ["a.x", "a.y", "b.z", "a"][t];
                for i in 0..200 {
                    if t % 2 == 0 {
                        store.write(&SubPath::parse(key).unwrap(), json!(i)).unwrap();
                    } else {
                        store.read(&SubPath::parse(key).unwrap()).unwrap();
                    }
                }
                done_tx.send(()).unwrap();
            }));
        }
        drop(done_tx);

        for _ in 0..4 {
            done_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("worker finished without deadlock");
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.read(&sub("a.x")).unwrap(), json!(199));
        assert_eq!(store.read(&sub("b.z")).unwrap(), json!(199));
    }
}
