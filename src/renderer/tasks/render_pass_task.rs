//! Task that records one render pass.
//!
//! Shadow and forward passes share this task type. The task resolves each draw's
//! pipeline through the shared [`PipelineStateCache`], binds it only when it differs
//! from the previous draw's, and leaves the finished [`CommandList`] in `list`. It
//! never submits: the render thread executes the lists in stage order once the whole
//! batch is done.
//!
//! A draw whose pipeline cannot be created is dropped and the first such error is
//! kept in `error`; the rest of the pass is still recorded.

use std::sync::Arc;

use log::error;

use crate::{
    gpu::{CommandList, DrawIndexed, GpuError, PassDesc, PassKind, PipelineId, PipelineStateCache, RenderStateKey},
    task_management::task::Task,
};

/// A draw and the render state it needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassDraw {
    pub key: RenderStateKey,
    pub draw: DrawIndexed,
}

/// Records one shadow or forward pass.
#[derive(Debug)]
pub struct RenderPassTask {
    label: String,
    /// Input: pipeline provider.
    pub pipelines: Option<Arc<PipelineStateCache>>,
    /// Input: targets and tables of the pass.
    pub pass: Option<PassDesc>,
    /// Input: draws in submission order.
    pub draws: Vec<PassDraw>,
    /// Output: the recorded pass.
    pub list: Option<CommandList>,
    /// Output: number of pipeline binds.
    pub pipeline_switches: usize,
    /// Output: first pipeline failure.
    pub error: Option<GpuError>,
}

impl RenderPassTask {
    /// A task for pass number `index` of the given kind within a slot.
    pub fn new(kind: PassKind, slot: usize, index: usize) -> Self {
        let stage = match kind {
            PassKind::Shadow => "shadow_pass",
            PassKind::Forward => "forward_pass",
        };
        Self {
            label: format!("{}_{}_{}", stage, slot, index),
            pipelines: None,
            pass: None,
            draws: Vec::new(),
            list: None,
            pipeline_switches: 0,
            error: None,
        }
    }
}

impl Task for RenderPassTask {
    fn execute(&mut self) {
        let (Some(pass), Some(pipelines)) = (self.pass.take(), self.pipelines.clone()) else {
            error!("Render pass task '{}' executed without a pass or pipeline cache", self.label);
            return;
        };

        let mut list = CommandList::new(pass.label.clone());
        list.begin_pass(pass);

        let mut bound: Option<PipelineId> = None;
        for draw in &self.draws {
            match pipelines.get_or_create(&draw.key) {
                Ok(pipeline) => {
                    if bound != Some(pipeline) {
                        list.set_pipeline(pipeline);
                        bound = Some(pipeline);
                        self.pipeline_switches += 1;
                    }
                    list.draw_indexed(draw.draw);
                }
                Err(err) => {
                    error!("'{}': no pipeline for {:?}: {}", list.label(), draw.key, err);
                    self.error.get_or_insert(err);
                }
            }
        }

        list.end_pass();
        self.list = Some(list);
    }

    fn reset(&mut self) {
        self.pipelines = None;
        self.pass = None;
        self.draws.clear();
        self.list = None;
        self.pipeline_switches = 0;
        self.error = None;
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{
        pipeline_cache::DEFAULT_PIPELINE_CACHE_CAPACITY, software::SoftwareGpu, BlendMode, BufferId, CullMode,
        GpuCommand, TextureId,
    };

    fn pass() -> PassDesc {
        PassDesc {
            label: String::from("forward test"),
            kind: PassKind::Forward,
            color: Some(TextureId(1)),
            depth: TextureId(2),
            clear_color: [0.0; 4],
            views: BufferId(1),
            view_index: 0,
            transforms: BufferId(2),
            materials: BufferId(3),
            lights: BufferId(4),
            first_light: 0,
            light_count: 0,
            shadow_maps: Vec::new(),
        }
    }

    fn draw(key: RenderStateKey) -> PassDraw {
        PassDraw {
            key,
            draw: DrawIndexed {
                vertex_buffer: BufferId(5),
                index_buffer: BufferId(6),
                index_count: 3,
                transform_index: 0,
                material_index: 0,
            },
        }
    }

    #[test]
    fn pipelines_are_bound_only_when_they_change() {
        let cache = Arc::new(PipelineStateCache::new(
            Arc::new(SoftwareGpu::new()),
            DEFAULT_PIPELINE_CACHE_CAPACITY,
        ));
        let opaque = RenderStateKey::forward(BlendMode::Opaque, CullMode::Back, false);
        let skinned = RenderStateKey::forward(BlendMode::Opaque, CullMode::Back, true);

        let mut task = RenderPassTask::new(PassKind::Forward, 0, 0);
        task.pipelines = Some(cache.clone());
        task.pass = Some(pass());
        task.draws = vec![draw(opaque), draw(opaque), draw(skinned), draw(skinned)];
        task.execute();

        let list = task.list.take().unwrap();
        assert_eq!(list.label(), "forward test");
        assert_eq!(list.draw_count(), 4);
        assert_eq!(task.pipeline_switches, 2);
        assert!(matches!(list.commands().first(), Some(GpuCommand::BeginPass(_))));
        assert_eq!(list.commands().last(), Some(&GpuCommand::EndPass));
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn reset_clears_outputs() {
        let mut task = RenderPassTask::new(PassKind::Shadow, 1, 2);
        assert_eq!(task.label(), "shadow_pass_1_2");
        task.list = Some(CommandList::new("stale"));
        task.pipeline_switches = 3;
        task.reset();
        assert!(task.list.is_none());
        assert_eq!(task.pipeline_switches, 0);
    }
}
