//! Coordinate-frame transform buffer
//!
//! Stores time-stamped parent→child transforms received on the transform
//! feed and resolves the transform between any two connected frames at a
//! given time. Lookups that would need extrapolation, or frames that are not
//! connected, return `None`; this is expected during normal operation.

use serde::Deserialize;
use std::collections::{HashMap, VecDeque};

/// Row-major homogeneous 4x4 matrix
pub type Matrix4 = [[f64; 4]; 4];

const IDENTITY: Matrix4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Rigid transform: translation plus unit quaternion `(x, y, z, w)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn to_matrix(&self) -> Matrix4 {
        let [x, y, z, w] = normalize(self.rotation);
        let [tx, ty, tz] = self.translation;
        [
            [1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y - z * w), 2.0 * (x * z + y * w), tx],
            [2.0 * (x * y + z * w), 1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z - x * w), ty],
            [2.0 * (x * z - y * w), 2.0 * (y * z + x * w), 1.0 - 2.0 * (x * x + y * y), tz],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Linear interpolation of translation, normalized lerp of rotation
    fn interpolate(&self, other: &Transform, t: f64) -> Transform {
        let mut translation = [0.0; 3];
        for (i, v) in translation.iter_mut().enumerate() {
            *v = self.translation[i] + (other.translation[i] - self.translation[i]) * t;
        }
        let mut b = other.rotation;
        let dot: f64 = (0..4).map(|i| self.rotation[i] * b[i]).sum();
        if dot < 0.0 {
            b = b.map(|c| -c);
        }
        let mut rotation = [0.0; 4];
        for (i, v) in rotation.iter_mut().enumerate() {
            *v = self.rotation[i] + (b[i] - self.rotation[i]) * t;
        }
        Transform {
            translation,
            rotation: normalize(rotation),
        }
    }
}

fn normalize(q: [f64; 4]) -> [f64; 4] {
    let n = q.iter().map(|c| c * c).sum::<f64>().sqrt();
    if n == 0.0 {
        [0.0, 0.0, 0.0, 1.0]
    } else {
        q.map(|c| c / n)
    }
}

pub fn mat_mul(a: &Matrix4, b: &Matrix4) -> Matrix4 {
    let mut out = [[0.0; 4]; 4];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..4).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Inverse of a rigid transform matrix
pub fn rigid_inverse(m: &Matrix4) -> Matrix4 {
    let mut out = IDENTITY;
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = m[j][i];
        }
    }
    for i in 0..3 {
        out[i][3] = -(0..3).map(|k| out[i][k] * m[k][3]).sum::<f64>();
    }
    out
}

struct Edge {
    parent: String,
    samples: VecDeque<(f64, Transform)>,
}

impl Edge {
    fn at(&self, time: f64, tolerance: f64) -> Option<Transform> {
        let (first_t, first) = self.samples.front()?;
        let (last_t, last) = self.samples.back()?;

        // time 0 means "latest available"
        if time == 0.0 {
            return Some(*last);
        }
        if time < *first_t {
            return (*first_t - time <= tolerance).then_some(*first);
        }
        if time > *last_t {
            return (time - *last_t <= tolerance).then_some(*last);
        }

        let idx = self.samples.partition_point(|(t, _)| *t < time);
        let (t1, tf1) = self.samples[idx];
        if idx == 0 || t1 == time {
            return Some(tf1);
        }
        let (t0, tf0) = self.samples[idx - 1];
        Some(tf0.interpolate(&tf1, (time - t0) / (t1 - t0)))
    }
}

/// History of transforms forming a frame tree
pub struct TransformBuffer {
    edges: HashMap<String, Edge>,
    max_history: usize,
    tolerance: f64,
}

impl TransformBuffer {
    /// `tolerance` is how far (seconds) a lookup may lie outside the buffered range
    pub fn new(max_history: usize, tolerance: f64) -> Self {
        Self {
            edges: HashMap::new(),
            max_history: max_history.max(1),
            tolerance,
        }
    }

    /// Record `parent → child` at `time` (seconds). Re-parenting a frame replaces its history.
    pub fn insert(&mut self, parent: &str, child: &str, time: f64, transform: Transform) {
        let edge = self.edges.entry(child.to_string()).or_insert_with(|| Edge {
            parent: parent.to_string(),
            samples: VecDeque::new(),
        });
        if edge.parent != parent {
            edge.parent = parent.to_string();
            edge.samples.clear();
        }

        let idx = edge.samples.partition_point(|(t, _)| *t <= time);
        edge.samples.insert(idx, (time, transform));
        while edge.samples.len() > self.max_history {
            edge.samples.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.edges.clear();
    }

    /// All known frame names, sorted
    pub fn frames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .edges
            .iter()
            .flat_map(|(child, e)| [child.clone(), e.parent.clone()])
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Ancestor chain of `frame` (frame itself first), with the transform of each
    /// frame relative to the root of the chain
    fn chain_to_root(&self, frame: &str, time: f64) -> Option<Vec<(String, Matrix4)>> {
        let mut chain = vec![(frame.to_string(), IDENTITY)];
        let mut current = frame.to_string();
        // child_in_parent matrices, from frame upwards
        let mut locals = Vec::new();
        while let Some(edge) = self.edges.get(&current) {
            if chain.len() > self.edges.len() + 1 {
                return None; // cycle
            }
            locals.push(edge.at(time, self.tolerance)?.to_matrix());
            current = edge.parent.clone();
            chain.push((current.clone(), IDENTITY));
        }

        // Express each frame in the root frame: root_T_frame
        let mut acc = IDENTITY;
        for i in (0..locals.len()).rev() {
            acc = mat_mul(&acc, &locals[i]);
            chain[i].1 = acc;
        }
        Some(chain)
    }

    /// Matrix mapping points in `source` coordinates into `target` coordinates
    pub fn lookup(&self, target: &str, source: &str, time: f64) -> Option<Matrix4> {
        if target == source {
            return Some(IDENTITY);
        }
        let source_chain = self.chain_to_root(source, time)?;
        let target_chain = self.chain_to_root(target, time)?;

        let (root_s, _) = source_chain.last()?;
        let (root_t, _) = target_chain.last()?;
        if root_s != root_t {
            return None;
        }

        let root_t_source = source_chain[0].1;
        let root_t_target = target_chain[0].1;
        Some(mat_mul(&rigid_inverse(&root_t_target), &root_t_source))
    }
}

#[derive(Debug, Deserialize)]
struct Stamp {
    sec: f64,
    #[serde(default)]
    nanosec: f64,
}

#[derive(Debug, Deserialize)]
struct Header {
    stamp: Stamp,
    frame_id: String,
}

#[derive(Debug, Deserialize)]
struct Vector3 {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Deserialize)]
struct Quaternion {
    x: f64,
    y: f64,
    z: f64,
    w: f64,
}

#[derive(Debug, Deserialize)]
struct TransformMsg {
    translation: Vector3,
    rotation: Quaternion,
}

#[derive(Debug, Deserialize)]
struct StampedTransform {
    header: Header,
    child_frame_id: String,
    transform: TransformMsg,
}

#[derive(Debug, Deserialize)]
struct TfMessage {
    transforms: Vec<StampedTransform>,
}

/// Feed every transform of a decoded transform message into the buffer.
/// Returns the number of transforms inserted.
pub fn ingest_tf_message(buffer: &mut TransformBuffer, doc: &serde_json::Value) -> usize {
    let msg: TfMessage = match serde_json::from_value(doc.clone()) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Ignoring malformed transform message: {}", e);
            return 0;
        }
    };
    for st in &msg.transforms {
        let t = &st.transform;
        buffer.insert(
            &st.header.frame_id,
            &st.child_frame_id,
            st.header.stamp.sec + st.header.stamp.nanosec * 1e-9,
            Transform {
                translation: [t.translation.x, t.translation.y, t.translation.z],
                rotation: [t.rotation.x, t.rotation.y, t.rotation.z, t.rotation.w],
            },
        );
    }
    msg.transforms.len()
}
