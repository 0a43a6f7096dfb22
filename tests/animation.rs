//! Round-robin distribution of animated entities over the animation task array.

use std::collections::BTreeSet;

use cgmath::{Matrix4, Vector3};
use frame_engine::{
    scene::{
        animation::AnimationSubsystem,
        assets::{AssetStore, ClipHandle, SkeletonHandle},
        demo::{tentacle_skeleton, wiggle_clip},
        transform::Transform,
        world::{AnimationComponent, Entity, EntityId, World},
    },
    task_management::ThreadPool,
};

const JOINTS: usize = 4;

struct Rig {
    skeleton: SkeletonHandle,
    clip: ClipHandle,
}

fn rig(assets: &mut AssetStore) -> Rig {
    Rig {
        skeleton: assets.add_skeleton(tentacle_skeleton(JOINTS, 0.5)),
        clip: assets.add_clip(wiggle_clip(JOINTS, 2.0)),
    }
}

fn spawn_animated(world: &mut World, rig: &Rig, count: usize) -> Vec<EntityId> {
    (0..count)
        .map(|index| {
            let mut animation = AnimationComponent::new(Some(rig.skeleton), Some(rig.clip));
            animation.play_rate = 1.0 + index as f32 * 0.1;
            world.spawn(
                Entity::new(format!("animated_{}", index))
                    .with_transform(Transform::from_translation(Vector3::new(index as f32, 0.0, 0.0)))
                    .with_animation(animation),
            )
        })
        .collect()
}

fn poses(world: &World) -> Vec<(f32, Vec<Matrix4<f32>>)> {
    world
        .animations()
        .map(|(_, _, animation)| {
            let state = animation.state.get();
            (state.time, state.skinning_matrices.clone())
        })
        .collect()
}

#[test]
fn two_entities_land_in_the_first_two_tasks() {
    let pool = ThreadPool::with_workers(2);
    let mut assets = AssetStore::new();
    let rig = rig(&mut assets);
    let mut world = World::new("two");
    let entities = spawn_animated(&mut world, &rig, 2);

    let mut animation = AnimationSubsystem::new(4);
    assert_eq!(animation.tick(&pool, &world, &assets, 0.016, true), 2);

    assert_eq!(animation.assigned_entities(0), vec![entities[0]]);
    assert_eq!(animation.assigned_entities(1), vec![entities[1]]);
    assert!(animation.assigned_entities(2).is_empty());
    assert!(animation.assigned_entities(3).is_empty());
    assert_eq!(animation.totals(), (2, 0));
}

#[test]
fn every_entity_is_updated_exactly_once() {
    let pool = ThreadPool::with_workers(3);
    let mut assets = AssetStore::new();
    let rig = rig(&mut assets);
    let mut world = World::new("many");
    let entities = spawn_animated(&mut world, &rig, 10);

    let mut animation = AnimationSubsystem::new(4);
    animation.tick(&pool, &world, &assets, 0.016, true);

    let mut seen = BTreeSet::new();
    for index in 0..animation.task_count() {
        let assigned = animation.assigned_entities(index);
        // Round-robin: task i gets entities i, i + K, i + 2K, ...
        let expected: Vec<EntityId> = entities.iter().copied().skip(index).step_by(4).collect();
        assert_eq!(assigned, expected);
        for entity in assigned {
            assert!(seen.insert(entity), "{:?} assigned twice", entity);
        }
    }
    assert_eq!(seen.len(), entities.len());
    assert_eq!(animation.totals(), (10, 0));

    for (_, _, component) in world.animations() {
        let state = component.state.get();
        assert_eq!(state.updates, 1);
        assert_eq!(state.skinning_matrices.len(), JOINTS);
    }
}

#[test]
fn synchronous_and_asynchronous_ticks_write_identical_poses() {
    let pool = ThreadPool::with_workers(4);
    let mut assets = AssetStore::new();
    let rig = rig(&mut assets);

    let mut worlds = [World::new("async"), World::new("sync")];
    for world in &mut worlds {
        spawn_animated(world, &rig, 9);
    }
    let mut subsystems = [AnimationSubsystem::new(4), AnimationSubsystem::new(4)];

    for _ in 0..5 {
        subsystems[0].tick(&pool, &worlds[0], &assets, 0.05, true);
        subsystems[1].tick(&pool, &worlds[1], &assets, 0.05, false);
        subsystems[0].wait_all();
        subsystems[1].wait_all();
    }

    assert_eq!(poses(&worlds[0]), poses(&worlds[1]));
}

#[test]
fn missing_clip_skips_only_that_entity() {
    let pool = ThreadPool::with_workers(2);
    let mut assets = AssetStore::new();
    let rig = rig(&mut assets);
    let mut world = World::new("partial");
    spawn_animated(&mut world, &rig, 3);
    let broken = world.spawn(Entity::new("no clip").with_animation(AnimationComponent::new(Some(rig.skeleton), None)));

    let mut animation = AnimationSubsystem::new(4);
    animation.tick(&pool, &world, &assets, 0.016, true);
    assert_eq!(animation.totals(), (3, 1));

    let entity = world.entity(broken).unwrap();
    let state = entity.animation.as_ref().unwrap().state.get();
    assert!(state.skinning_matrices.is_empty());
}

#[test]
fn a_world_without_animation_submits_empty_tasks() {
    let pool = ThreadPool::with_workers(1);
    let assets = AssetStore::new();
    let world = World::new("static");

    let mut animation = AnimationSubsystem::new(4);
    assert_eq!(animation.tick(&pool, &world, &assets, 0.016, true), 0);
    assert_eq!(animation.totals(), (0, 0));
    assert_eq!(animation.ticks(), 1);
}
