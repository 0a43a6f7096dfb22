//! # Draw Lists
//!
//! Capture turns visible mesh components into [`DrawItem`]s and files them into three
//! lists per viewport:
//!
//! - **opaque**: static meshes with opaque materials
//! - **skinned**: meshes whose vertices come from this frame's skinning output
//! - **transparent**: anything with a blending material, sorted back to front
//!
//! A forward pass issues the lists in that order. Static and skinned draws share the
//! pass state and differ only in their vertex buffer binding.

use crate::{
    gpu::{RenderStateKey, TextureId},
    scene::{assets::MeshHandle, world::ViewportId, world::WorldId},
};

use super::{
    resource_table::{MaterialId, SkinnedId, TransformId, ViewId},
    viewport::ViewportTarget,
};

/// One mesh instance to draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawItem {
    /// Mesh asset; its GPU buffers come from the slot's mesh cache.
    pub mesh: MeshHandle,
    /// Transform table entry.
    pub transform: TransformId,
    /// Material table entry.
    pub material: MaterialId,
    /// Skinned mesh entry when the vertices come from the skinning output.
    pub skinned: Option<SkinnedId>,
    /// Pipeline state the draw binds.
    pub key: RenderStateKey,
    /// Squared distance from the view origin.
    pub depth: f32,
    /// Number of indices.
    pub index_count: u32,
}

/// The three draw lists of one view.
#[derive(Debug, Clone, Default)]
pub struct DrawLists {
    pub opaque: Vec<DrawItem>,
    pub skinned: Vec<DrawItem>,
    pub transparent: Vec<DrawItem>,
}

impl DrawLists {
    /// Files an item into the list its material and skinning select.
    pub fn push(&mut self, item: DrawItem) {
        if item.key.blend.is_transparent() {
            self.transparent.push(item);
        } else if item.skinned.is_some() {
            self.skinned.push(item);
        } else {
            self.opaque.push(item);
        }
    }

    /// Sorts the transparent list farthest first.
    pub fn sort_transparent(&mut self) {
        self.transparent
            .sort_by(|a, b| b.depth.total_cmp(&a.depth));
    }

    /// Items in submission order: opaque, skinned, transparent.
    pub fn iter(&self) -> impl Iterator<Item = &DrawItem> {
        self.opaque
            .iter()
            .chain(self.skinned.iter())
            .chain(self.transparent.iter())
    }

    pub fn len(&self) -> usize {
        self.opaque.len() + self.skinned.len() + self.transparent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.opaque.clear();
        self.skinned.clear();
        self.transparent.clear();
    }
}

/// Everything a forward pass needs from capture.
#[derive(Debug, Clone)]
pub struct ViewportDraws {
    pub viewport: ViewportId,
    pub world: WorldId,
    pub view: ViewId,
    pub target: ViewportTarget,
    pub clear_color: [f32; 4],
    /// The world's range in the light table.
    pub first_light: u32,
    pub light_count: u32,
    /// Shadow maps rendered for the world's lights this frame.
    pub shadow_maps: Vec<TextureId>,
    pub lists: DrawLists,
}

/// Everything a shadow pass needs from capture.
#[derive(Debug, Clone)]
pub struct ShadowDraws {
    pub world: WorldId,
    pub view: ViewId,
    pub map: TextureId,
    /// Opaque casters; shadow passes have no transparent list.
    pub casters: Vec<DrawItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{BlendMode, CullMode};

    fn item(blend: BlendMode, skinned: bool, depth: f32) -> DrawItem {
        DrawItem {
            mesh: MeshHandle(0),
            transform: TransformId(0),
            material: MaterialId(0),
            skinned: skinned.then_some(SkinnedId(0)),
            key: RenderStateKey::forward(blend, CullMode::Back, skinned),
            depth,
            index_count: 3,
        }
    }

    #[test]
    fn items_are_filed_by_material_and_skinning() {
        let mut lists = DrawLists::default();
        lists.push(item(BlendMode::Opaque, false, 1.0));
        lists.push(item(BlendMode::Opaque, true, 1.0));
        lists.push(item(BlendMode::AlphaBlend, true, 1.0));
        lists.push(item(BlendMode::Additive, false, 1.0));

        assert_eq!(lists.opaque.len(), 1);
        assert_eq!(lists.skinned.len(), 1);
        assert_eq!(lists.transparent.len(), 2);
        assert_eq!(lists.len(), 4);

        lists.clear();
        assert!(lists.is_empty());
    }

    #[test]
    fn transparent_items_draw_back_to_front_after_everything_else() {
        let mut lists = DrawLists::default();
        lists.push(item(BlendMode::AlphaBlend, false, 4.0));
        lists.push(item(BlendMode::AlphaBlend, false, 25.0));
        lists.push(item(BlendMode::Opaque, false, 100.0));
        lists.push(item(BlendMode::AlphaBlend, false, 9.0));
        lists.sort_transparent();

        let depths: Vec<f32> = lists.iter().map(|item| item.depth).collect();
        assert_eq!(depths, vec![100.0, 25.0, 9.0, 4.0]);
    }
}
