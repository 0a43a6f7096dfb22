//! # Animation Subsystem
//!
//! Splits skeletal pose updates across a fixed array of [`AnimationTask`]s.
//!
//! ## Tick
//! 1. Every task is reset, then receives the shared inputs (delta time, global play
//!    rate, world id).
//! 2. Entities carrying an [`AnimationComponent`] are dealt to the tasks round robin:
//!    entity `n` of the iteration goes to task `n % K`. This is not balanced by cost.
//! 3. The whole array is submitted as one batch (or executed inline when the
//!    synchronous path is selected).
//!
//! Nothing waits for the batch implicitly. The consumer of the poses (the renderer)
//! calls [`AnimationSubsystem::wait_all`] before reading them.
//!
//! ## Failures
//! An entity whose skeleton or clip is missing is logged, counted in `skipped` and
//! left untouched. The rest of the task's entities are still updated.

use std::sync::Arc;

use cgmath::{Matrix4, Quaternion, Vector3};

use crate::{
    check,
    core::MtResource,
    task_management::{
        task::{Task, TaskHandle},
        ThreadPool,
    },
};

use super::{
    assets::{AnimationClip, AssetStore, Skeleton},
    transform::{lerp_vector, nlerp_rotation, Transform},
    world::{AnimationState, EntityId, World, WorldId},
};

/// Default number of animation tasks.
pub const ANIMATION_TASK_COUNT: usize = 4;

/// One entity handed to an animation task for a tick.
#[derive(Debug, Clone)]
pub struct AnimationAssignment {
    /// The entity being animated.
    pub entity: EntityId,
    /// Per-entity speed multiplier.
    pub play_rate: f32,
    /// Whether the clip wraps.
    pub looping: bool,
    /// Resolved skeleton, `None` when the component names none or it is missing.
    pub skeleton: Option<Arc<Skeleton>>,
    /// Resolved clip, `None` when the component names none or it is missing.
    pub clip: Option<Arc<AnimationClip>>,
    /// Where the pose is written.
    pub state: MtResource<AnimationState>,
}

/// Updates the poses of the entities assigned to it.
#[derive(Debug)]
pub struct AnimationTask {
    /// Index of the task in its subsystem.
    pub index: usize,
    /// Input: frame time in seconds.
    pub delta_time: f32,
    /// Input: speed multiplier applied to every entity.
    pub global_play_rate: f32,
    /// Input: the world the entities belong to.
    pub world: Option<WorldId>,
    /// Input: entities to update this tick.
    pub assigned: Vec<AnimationAssignment>,
    /// Output: entities whose pose was written.
    pub updated: usize,
    /// Output: entities skipped for missing data.
    pub skipped: usize,
    label: String,
    local_scratch: Vec<Transform>,
    global_scratch: Vec<Matrix4<f32>>,
}

impl AnimationTask {
    /// An empty task with the given array index.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            delta_time: 0.0,
            global_play_rate: 1.0,
            world: None,
            assigned: Vec::new(),
            updated: 0,
            skipped: 0,
            label: format!("animation_{}", index),
            local_scratch: Vec::new(),
            global_scratch: Vec::new(),
        }
    }

    /// Entities assigned this tick, in assignment order.
    pub fn assigned_entities(&self) -> Vec<EntityId> {
        self.assigned.iter().map(|assignment| assignment.entity).collect()
    }
}

impl Task for AnimationTask {
    fn execute(&mut self) {
        let step = self.delta_time * self.global_play_rate;

        for assignment in &self.assigned {
            let (Some(skeleton), Some(clip)) = (&assignment.skeleton, &assignment.clip) else {
                log::warn!(
                    "Entity {:?} in world {:?} has an animation without {}; skipping",
                    assignment.entity,
                    self.world,
                    if assignment.skeleton.is_none() { "a skeleton" } else { "a clip" }
                );
                self.skipped += 1;
                continue;
            };

            let mut state = assignment.state.get_mut();
            let time = advance_time(state.time, step * assignment.play_rate, clip.duration, assignment.looping);

            sample_local_pose(skeleton, clip, time, &mut self.local_scratch);
            compose_skinning_matrices(
                skeleton,
                &self.local_scratch,
                &mut self.global_scratch,
                &mut state.skinning_matrices,
            );
            state.time = time;
            state.updates += 1;
            self.updated += 1;
        }
    }

    fn reset(&mut self) {
        self.delta_time = 0.0;
        self.global_play_rate = 1.0;
        self.world = None;
        self.assigned.clear();
        self.updated = 0;
        self.skipped = 0;
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Moves a playback position forward, wrapping or clamping at the clip's end.
pub fn advance_time(time: f32, step: f32, duration: f32, looping: bool) -> f32 {
    if duration <= 0.0 {
        return 0.0;
    }
    let next = time + step;
    if looping {
        next.rem_euclid(duration)
    } else {
        next.clamp(0.0, duration)
    }
}

fn sample_keys<T: Copy>(keys: &[(f32, T)], time: f32, interpolate: impl Fn(T, T, f32) -> T) -> Option<T> {
    let (first, last) = (keys.first()?, keys.last()?);
    if time <= first.0 {
        return Some(first.1);
    }
    if time >= last.0 {
        return Some(last.1);
    }

    let next = keys.partition_point(|key| key.0 <= time);
    let (from, to) = (keys[next - 1], keys[next]);
    let span = to.0 - from.0;
    if span <= f32::EPSILON {
        return Some(to.1);
    }
    Some(interpolate(from.1, to.1, (time - from.0) / span))
}

/// Samples every joint's local transform at `time`. Channels without keys keep the
/// bind pose.
pub fn sample_local_pose(skeleton: &Skeleton, clip: &AnimationClip, time: f32, locals: &mut Vec<Transform>) {
    locals.clear();
    locals.extend(skeleton.joints.iter().map(|joint| joint.local_bind));

    for track in &clip.tracks {
        let Some(local) = locals.get_mut(track.joint) else {
            continue;
        };
        if let Some(translation) = sample_keys(&track.translations, time, lerp_vector) {
            local.translation = translation;
        }
        if let Some(rotation) = sample_keys::<Quaternion<f32>>(&track.rotations, time, nlerp_rotation) {
            local.rotation = rotation;
        }
        if let Some(scale) = sample_keys::<Vector3<f32>>(&track.scales, time, lerp_vector) {
            local.scale = scale;
        }
    }
}

/// Builds `global * inverse_bind` for every joint from local transforms.
pub fn compose_skinning_matrices(
    skeleton: &Skeleton,
    locals: &[Transform],
    globals: &mut Vec<Matrix4<f32>>,
    skinning: &mut Vec<Matrix4<f32>>,
) {
    globals.clear();
    skinning.clear();

    for (index, (joint, local)) in skeleton.joints.iter().zip(locals).enumerate() {
        let global = match joint.parent {
            Some(parent) if parent < index => globals[parent] * local.to_matrix(),
            _ => local.to_matrix(),
        };
        globals.push(global);
        skinning.push(global * joint.inverse_bind);
    }
}

/// Owns the animation task array and deals entities to it every tick.
pub struct AnimationSubsystem {
    tasks: Vec<TaskHandle<AnimationTask>>,
    global_play_rate: f32,
    ticks: u64,
}

impl AnimationSubsystem {
    /// A subsystem with `task_count` tasks. Fatal when `task_count` is zero.
    pub fn new(task_count: usize) -> Self {
        check!(task_count >= 1, "animation subsystem needs at least one task");
        Self {
            tasks: (0..task_count).map(|index| TaskHandle::new(AnimationTask::new(index))).collect(),
            global_play_rate: 1.0,
            ticks: 0,
        }
    }

    /// Number of tasks in the array.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// The task array.
    pub fn tasks(&self) -> &[TaskHandle<AnimationTask>] {
        &self.tasks
    }

    pub fn global_play_rate(&self) -> f32 {
        self.global_play_rate
    }

    pub fn set_global_play_rate(&mut self, rate: f32) {
        self.global_play_rate = rate;
    }

    /// Number of completed `tick()` calls.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Deals every animated entity of `world` to the task array and submits it.
    ///
    /// A batch still in flight from the previous tick is joined first. Returns the
    /// number of entities assigned.
    pub fn tick(
        &mut self,
        pool: &ThreadPool,
        world: &World,
        assets: &AssetStore,
        delta_time: f32,
        asynchronous: bool,
    ) -> usize {
        self.wait_all();

        for task in &self.tasks {
            task.reset();
            let mut body = task.body_mut();
            body.delta_time = delta_time;
            body.global_play_rate = self.global_play_rate;
            body.world = Some(world.id());
        }

        let task_count = self.tasks.len();
        let mut counter = 0usize;
        for (entity, _, animation) in world.animations() {
            let assignment = AnimationAssignment {
                entity,
                play_rate: animation.play_rate,
                looping: animation.looping,
                skeleton: animation.skeleton.and_then(|handle| assets.skeleton(handle).cloned()),
                clip: animation.clip.and_then(|handle| assets.clip(handle).cloned()),
                state: animation.state.clone(),
            };
            self.tasks[counter % task_count].body_mut().assigned.push(assignment);
            counter += 1;
        }

        pool.submit_or_execute(&self.tasks, asynchronous);
        self.ticks += 1;
        log::debug!(
            "Animation tick {}: {} entities over {} tasks",
            self.ticks,
            counter,
            task_count
        );
        counter
    }

    /// Joins the batch submitted by the last `tick()`. A no-op before the first tick.
    pub fn wait_all(&self) {
        for task in &self.tasks {
            if !task.is_idle() {
                task.wait();
            }
        }
    }

    /// Entities assigned to task `index` by the last tick. Joins the batch first.
    pub fn assigned_entities(&self, index: usize) -> Vec<EntityId> {
        self.wait_all();
        self.tasks
            .get(index)
            .map(|task| task.body().assigned_entities())
            .unwrap_or_default()
    }

    /// `(updated, skipped)` totals of the last tick. Joins the batch first.
    pub fn totals(&self) -> (usize, usize) {
        self.wait_all();
        self.tasks.iter().fold((0, 0), |(updated, skipped), task| {
            let body = task.body();
            (updated + body.updated, skipped + body.skipped)
        })
    }
}

impl Default for AnimationSubsystem {
    fn default() -> Self {
        Self::new(ANIMATION_TASK_COUNT)
    }
}

impl Drop for AnimationSubsystem {
    fn drop(&mut self) {
        self.wait_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{
        assets::{ClipHandle, JointTrack, SkeletonHandle},
        world::{AnimationComponent, Entity},
    };
    use cgmath::{Deg, Rotation3, SquareMatrix};

    fn chain(store: &mut AssetStore) -> (SkeletonHandle, ClipHandle) {
        let skeleton = Skeleton::from_bind_pose(
            "chain",
            vec![
                (String::from("root"), None, Transform::identity()),
                (String::from("tip"), Some(0), Transform::from_translation(Vector3::new(0.0, 1.0, 0.0))),
            ],
        )
        .unwrap();
        let clip = AnimationClip {
            name: String::from("turn"),
            duration: 1.0,
            tracks: vec![JointTrack {
                joint: 0,
                rotations: vec![
                    (0.0, Quaternion::from_angle_z(Deg(0.0))),
                    (1.0, Quaternion::from_angle_z(Deg(90.0))),
                ],
                ..JointTrack::default()
            }],
        };
        (store.add_skeleton(skeleton), store.add_clip(clip))
    }

    #[test]
    fn time_wraps_or_clamps() {
        assert_eq!(advance_time(0.75, 0.5, 1.0, true), 0.25);
        assert_eq!(advance_time(0.75, 0.5, 1.0, false), 1.0);
        assert_eq!(advance_time(0.5, 1.0, 0.0, true), 0.0);
    }

    #[test]
    fn bind_pose_yields_identity_skinning() {
        let mut store = AssetStore::new();
        let (skeleton, _) = chain(&mut store);
        let skeleton = store.skeleton(skeleton).unwrap();
        let empty = AnimationClip {
            name: String::from("empty"),
            duration: 1.0,
            tracks: Vec::new(),
        };

        let mut locals = Vec::new();
        let mut globals = Vec::new();
        let mut skinning = Vec::new();
        sample_local_pose(skeleton, &empty, 0.3, &mut locals);
        compose_skinning_matrices(skeleton, &locals, &mut globals, &mut skinning);

        for matrix in skinning {
            let difference = matrix - Matrix4::identity();
            assert!(difference.x.x.abs() < 1e-6 && difference.w.y.abs() < 1e-6);
        }
    }

    #[test]
    fn missing_clip_is_skipped_without_touching_the_pose() {
        let mut store = AssetStore::new();
        let (skeleton, clip) = chain(&mut store);
        let mut world = World::new("test");
        world.spawn(Entity::new("ok").with_animation(AnimationComponent::new(Some(skeleton), Some(clip))));
        let broken = world.spawn(Entity::new("broken").with_animation(AnimationComponent::new(Some(skeleton), None)));

        let pool = ThreadPool::with_workers(2);
        let mut animation = AnimationSubsystem::new(1);
        animation.tick(&pool, &world, &store, 0.5, true);

        assert_eq!(animation.totals(), (1, 1));
        let state = world.entity(broken).unwrap().animation.as_ref().unwrap().state.get();
        assert_eq!(state.updates, 0);
        assert!(state.skinning_matrices.is_empty());
    }

    #[test]
    fn reset_clears_previous_assignments() {
        let mut store = AssetStore::new();
        let (skeleton, clip) = chain(&mut store);
        let mut world = World::new("test");
        for index in 0..5 {
            world.spawn(
                Entity::new(format!("e{}", index))
                    .with_animation(AnimationComponent::new(Some(skeleton), Some(clip))),
            );
        }

        let pool = ThreadPool::with_workers(2);
        let mut animation = AnimationSubsystem::default();
        animation.tick(&pool, &world, &store, 0.1, true);
        assert_eq!(animation.assigned_entities(0).len(), 2);

        world.despawn(EntityId(4));
        animation.tick(&pool, &world, &store, 0.1, true);
        assert_eq!(animation.assigned_entities(0), vec![EntityId(0)]);
        assert_eq!(animation.totals(), (4, 0));
    }

    #[test]
    #[should_panic(expected = "at least one task")]
    fn zero_tasks_is_fatal() {
        let _ = AnimationSubsystem::new(0);
    }
}
