//! # Asset Import
//!
//! [`AssetImportTask`] turns a JSON model description into mesh, skeleton, clip and
//! material data on a pool worker. Like every task it has no error channel: a failed
//! import leaves an [`ImportResult`] whose `is_valid()` is `false` and whose `error`
//! describes what went wrong. The owner checks the result after `wait()` and hands
//! valid results to [`AssetStore::import`].
//!
//! ## Model Format
//!
//! ```json
//! {
//!   "name": "tentacle",
//!   "positions": [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
//!   "normals": [[0.0, 0.0, 1.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0]],
//!   "indices": [0, 1, 2],
//!   "influences": [{ "joints": [0, 0, 0, 0], "weights": [1.0, 0.0, 0.0, 0.0] }],
//!   "skeleton": { "joints": [{ "name": "root", "parent": null, "translation": [0.0, 0.0, 0.0] }] },
//!   "clips": [{ "name": "idle", "duration": 1.0, "tracks": [] }],
//!   "material": { "name": "skin", "base_color": [1.0, 0.5, 0.5, 1.0] }
//! }
//! ```
//!
//! `normals`, `influences`, `skeleton`, `clips` and `material` are optional. Rotations
//! are `[x, y, z, w]` quaternions.

use std::path::PathBuf;

use cgmath::{Quaternion, Vector3};
use serde::Deserialize;

use crate::{
    errors::{EngineError, Result},
    gpu::layout::{GpuSkinInfluence, GpuVertex},
    task_management::task::Task,
};

use super::{
    assets::{AnimationClip, AssetStore, ClipHandle, JointTrack, Material, MaterialHandle, MeshData, MeshHandle, Skeleton, SkeletonHandle},
    transform::Transform,
};

#[derive(Debug, Deserialize)]
struct ModelDesc {
    name: String,
    positions: Vec<[f32; 3]>,
    #[serde(default)]
    normals: Vec<[f32; 3]>,
    indices: Vec<u32>,
    #[serde(default)]
    influences: Vec<InfluenceDesc>,
    #[serde(default)]
    skeleton: Option<SkeletonDesc>,
    #[serde(default)]
    clips: Vec<ClipDesc>,
    #[serde(default)]
    material: Option<Material>,
}

#[derive(Debug, Deserialize)]
struct InfluenceDesc {
    joints: [u32; 4],
    weights: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct SkeletonDesc {
    joints: Vec<JointDesc>,
}

#[derive(Debug, Deserialize)]
struct JointDesc {
    name: String,
    #[serde(default)]
    parent: Option<usize>,
    #[serde(default)]
    translation: Option<[f32; 3]>,
    #[serde(default)]
    rotation: Option<[f32; 4]>,
    #[serde(default)]
    scale: Option<[f32; 3]>,
}

#[derive(Debug, Deserialize)]
struct ClipDesc {
    name: String,
    duration: f32,
    #[serde(default)]
    tracks: Vec<TrackDesc>,
}

#[derive(Debug, Deserialize)]
struct TrackDesc {
    joint: usize,
    #[serde(default)]
    translations: Vec<KeyDesc<[f32; 3]>>,
    #[serde(default)]
    rotations: Vec<KeyDesc<[f32; 4]>>,
    #[serde(default)]
    scales: Vec<KeyDesc<[f32; 3]>>,
}

#[derive(Debug, Deserialize)]
struct KeyDesc<T> {
    time: f32,
    value: T,
}

fn quaternion([x, y, z, w]: [f32; 4]) -> Quaternion<f32> {
    Quaternion::new(w, x, y, z)
}

/// Where an import task reads its model from.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ImportSource {
    /// Nothing assigned; executing fails the import.
    #[default]
    None,
    /// A JSON file on disk.
    File(PathBuf),
    /// An in-memory JSON document.
    Json(String),
}

/// Output of an import.
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    /// The mesh.
    pub mesh: Option<MeshData>,
    /// The skeleton, when the model is rigged.
    pub skeleton: Option<Skeleton>,
    /// Animation clips targeting the skeleton.
    pub clips: Vec<AnimationClip>,
    /// The model's material, when it names one.
    pub material: Option<Material>,
    /// Why the import failed.
    pub error: Option<String>,
}

impl ImportResult {
    /// `true` when the import produced a mesh and no error.
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && self.mesh.is_some()
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Handles of an imported model's assets.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedModel {
    pub mesh: MeshHandle,
    pub skeleton: Option<SkeletonHandle>,
    pub clips: Vec<ClipHandle>,
    pub material: Option<MaterialHandle>,
}

impl AssetStore {
    /// Moves a valid import result into the store.
    ///
    /// # Errors
    /// Returns [`EngineError::Import`] with the result's error when it is not valid.
    pub fn import(&mut self, result: ImportResult) -> Result<ImportedModel> {
        if let Some(error) = result.error {
            return Err(EngineError::Import(error));
        }
        let mesh = result
            .mesh
            .ok_or_else(|| EngineError::Import(String::from("import produced no mesh")))?;

        Ok(ImportedModel {
            mesh: self.add_mesh(mesh),
            skeleton: result.skeleton.map(|skeleton| self.add_skeleton(skeleton)),
            clips: result.clips.into_iter().map(|clip| self.add_clip(clip)).collect(),
            material: result.material.map(|material| self.add_material(material)),
        })
    }
}

/// Parses and validates a model description.
///
/// # Errors
/// Returns [`EngineError::Json`] for malformed JSON and [`EngineError::Import`] for
/// descriptions that parse but are inconsistent (indices out of range, influences
/// naming missing joints, tracks for missing joints).
pub fn parse_model(json: &str) -> Result<ImportResult> {
    let desc: ModelDesc = serde_json::from_str(json)?;
    build_model(desc)
}

fn build_model(desc: ModelDesc) -> Result<ImportResult> {
    let vertex_count = desc.positions.len();
    if vertex_count == 0 {
        return Err(EngineError::Import(format!("model '{}' has no vertices", desc.name)));
    }
    if !desc.normals.is_empty() && desc.normals.len() != vertex_count {
        return Err(EngineError::Import(format!(
            "model '{}' has {} normals for {} positions",
            desc.name,
            desc.normals.len(),
            vertex_count
        )));
    }
    if desc.indices.len() % 3 != 0 {
        return Err(EngineError::Import(format!(
            "model '{}' index count {} is not a multiple of 3",
            desc.name,
            desc.indices.len()
        )));
    }
    if let Some(index) = desc.indices.iter().find(|&&index| index as usize >= vertex_count) {
        return Err(EngineError::Import(format!(
            "model '{}' index {} is out of range for {} vertices",
            desc.name, index, vertex_count
        )));
    }

    let vertices = desc
        .positions
        .iter()
        .enumerate()
        .map(|(index, position)| {
            let normal = desc.normals.get(index).copied().unwrap_or([0.0, 1.0, 0.0]);
            GpuVertex::new(*position, normal)
        })
        .collect();

    let skeleton = match desc.skeleton {
        Some(skeleton) => {
            let joints = skeleton
                .joints
                .into_iter()
                .map(|joint| {
                    let mut transform = Transform::identity();
                    if let Some([x, y, z]) = joint.translation {
                        transform.translation = Vector3::new(x, y, z);
                    }
                    if let Some(rotation) = joint.rotation {
                        transform.rotation = quaternion(rotation);
                    }
                    if let Some([x, y, z]) = joint.scale {
                        transform.scale = Vector3::new(x, y, z);
                    }
                    (joint.name, joint.parent, transform)
                })
                .collect();
            Some(Skeleton::from_bind_pose(format!("{}_skeleton", desc.name), joints).map_err(EngineError::Import)?)
        }
        None => None,
    };
    let joint_count = skeleton.as_ref().map_or(0, Skeleton::joint_count);

    if !desc.influences.is_empty() {
        if desc.influences.len() != vertex_count {
            return Err(EngineError::Import(format!(
                "model '{}' has {} influences for {} vertices",
                desc.name,
                desc.influences.len(),
                vertex_count
            )));
        }
        let out_of_range = desc.influences.iter().any(|influence| {
            influence
                .joints
                .iter()
                .zip(influence.weights.iter())
                .any(|(&joint, &weight)| weight != 0.0 && joint as usize >= joint_count)
        });
        if out_of_range {
            return Err(EngineError::Import(format!(
                "model '{}' has influences naming joints outside its {}-joint skeleton",
                desc.name, joint_count
            )));
        }
    }
    let influences = desc
        .influences
        .iter()
        .map(|influence| GpuSkinInfluence {
            joints: influence.joints,
            weights: influence.weights,
        })
        .collect();

    let mut clips = Vec::with_capacity(desc.clips.len());
    for clip in desc.clips {
        if let Some(track) = clip.tracks.iter().find(|track| track.joint >= joint_count) {
            return Err(EngineError::Import(format!(
                "clip '{}' animates joint {} but the skeleton has {} joints",
                clip.name, track.joint, joint_count
            )));
        }
        let tracks = clip
            .tracks
            .into_iter()
            .map(|track| {
                let mut translations: Vec<(f32, Vector3<f32>)> = track
                    .translations
                    .into_iter()
                    .map(|key| (key.time, Vector3::from(key.value)))
                    .collect();
                let mut rotations: Vec<(f32, Quaternion<f32>)> = track
                    .rotations
                    .into_iter()
                    .map(|key| (key.time, quaternion(key.value)))
                    .collect();
                let mut scales: Vec<(f32, Vector3<f32>)> = track
                    .scales
                    .into_iter()
                    .map(|key| (key.time, Vector3::from(key.value)))
                    .collect();
                translations.sort_by(|a, b| a.0.total_cmp(&b.0));
                rotations.sort_by(|a, b| a.0.total_cmp(&b.0));
                scales.sort_by(|a, b| a.0.total_cmp(&b.0));
                JointTrack {
                    joint: track.joint,
                    translations,
                    rotations,
                    scales,
                }
            })
            .collect();
        clips.push(AnimationClip {
            name: clip.name,
            duration: clip.duration.max(0.0),
            tracks,
        });
    }

    let mesh = MeshData::new(desc.name, vertices, desc.indices).with_influences(influences);

    Ok(ImportResult {
        mesh: Some(mesh),
        skeleton,
        clips,
        material: desc.material,
        error: None,
    })
}

/// Imports a model on a pool worker.
#[derive(Debug, Default)]
pub struct AssetImportTask {
    /// Input: where to read the model from.
    pub source: ImportSource,
    /// Output: the imported data, or the reason it failed.
    pub result: ImportResult,
}

impl AssetImportTask {
    /// A task that imports `source`.
    pub fn new(source: ImportSource) -> Self {
        Self {
            source,
            result: ImportResult::default(),
        }
    }

    fn load(&self) -> Result<ImportResult> {
        match &self.source {
            ImportSource::None => Err(EngineError::Import(String::from("no import source assigned"))),
            ImportSource::File(path) => {
                let json = std::fs::read_to_string(path)?;
                parse_model(&json)
            }
            ImportSource::Json(json) => parse_model(json),
        }
    }
}

impl Task for AssetImportTask {
    fn execute(&mut self) {
        self.result = match self.load() {
            Ok(result) => {
                log::debug!(
                    "Imported model '{}'",
                    result.mesh.as_ref().map_or("<none>", |mesh| mesh.name.as_str())
                );
                result
            }
            Err(err) => {
                log::warn!("Asset import from {:?} failed: {}", self.source, err);
                ImportResult::failed(err.to_string())
            }
        };
    }

    fn reset(&mut self) {
        self.source = ImportSource::None;
        self.result = ImportResult::default();
    }

    fn label(&self) -> &str {
        "asset_import"
    }
}
