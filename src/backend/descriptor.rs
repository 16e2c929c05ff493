// Descriptor pool with a fixed budget
//
// The whole application draws from one small pool. Reflected layouts are
// checked against what is left before a set is allocated, so running out
// shows up as a named error at startup instead of a driver failure.

use super::device::VulkanDevice;
use super::error::{RenderError, Result};
use super::reflect::ReflectedResource;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

pub const MAX_SETS: u32 = 30;
pub const DESCRIPTORS_PER_TYPE: u32 = 10;

const POOL_TYPES: [vk::DescriptorType; 3] = [
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::STORAGE_BUFFER,
];

/// Remaining sets and descriptors per type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorBudget {
    sets: u32,
    descriptors: Vec<(vk::DescriptorType, u32)>,
}

impl DescriptorBudget {
    pub fn new(sets: u32, descriptors: &[(vk::DescriptorType, u32)]) -> Self {
        Self {
            sets,
            descriptors: descriptors.to_vec(),
        }
    }

    pub fn remaining_sets(&self) -> u32 {
        self.sets
    }

    pub fn remaining(&self, ty: vk::DescriptorType) -> u32 {
        self.descriptors
            .iter()
            .find(|(t, _)| *t == ty)
            .map_or(0, |(_, count)| *count)
    }

    /// Take one set plus the descriptors of `resources`, or nothing at all.
    pub fn reserve(&mut self, resources: &[ReflectedResource]) -> Result<()> {
        if self.sets == 0 {
            return Err(RenderError::DescriptorBudgetExceeded(
                "no descriptor sets left".into(),
            ));
        }

        for (ty, needed) in demand(resources) {
            let left = self.remaining(ty);
            if needed > left {
                return Err(RenderError::DescriptorBudgetExceeded(format!(
                    "{:?} needs {} descriptors, {} left",
                    ty, needed, left
                )));
            }
        }

        self.sets -= 1;
        for (ty, needed) in demand(resources) {
            if let Some((_, count)) = self.descriptors.iter_mut().find(|(t, _)| *t == ty) {
                *count -= needed;
            }
        }
        Ok(())
    }

    pub fn release(&mut self, resources: &[ReflectedResource]) {
        self.sets += 1;
        for (ty, needed) in demand(resources) {
            if let Some((_, count)) = self.descriptors.iter_mut().find(|(t, _)| *t == ty) {
                *count += needed;
            }
        }
    }
}

// Descriptor count per type for a layout
fn demand(resources: &[ReflectedResource]) -> Vec<(vk::DescriptorType, u32)> {
    let mut totals: Vec<(vk::DescriptorType, u32)> = Vec::new();
    for resource in resources {
        let ty = resource.kind.descriptor_type();
        match totals.iter_mut().find(|(t, _)| *t == ty) {
            Some((_, count)) => *count += resource.count,
            None => totals.push((ty, resource.count)),
        }
    }
    totals
}

/// One layout binding per reflected resource, all visible to `stage`.
pub fn layout_bindings(
    resources: &[ReflectedResource],
    stage: vk::ShaderStageFlags,
) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    resources
        .iter()
        .map(|resource| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(resource.binding)
                .descriptor_type(resource.kind.descriptor_type())
                .descriptor_count(resource.count)
                .stage_flags(stage)
        })
        .collect()
}

pub struct DescriptorPool {
    pub pool: vk::DescriptorPool,
    budget: Mutex<DescriptorBudget>,
    device: Arc<VulkanDevice>,
}

impl DescriptorPool {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Arc<Self>> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = POOL_TYPES
            .iter()
            .map(|&ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: DESCRIPTORS_PER_TYPE,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_SETS)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }?;

        let budget: Vec<(vk::DescriptorType, u32)> = POOL_TYPES
            .iter()
            .map(|&ty| (ty, DESCRIPTORS_PER_TYPE))
            .collect();

        Ok(Arc::new(Self {
            pool,
            budget: Mutex::new(DescriptorBudget::new(MAX_SETS, &budget)),
            device: Arc::clone(device),
        }))
    }

    /// Allocate one set for `layout`, charging `resources` against the budget.
    pub fn allocate(
        &self,
        layout: vk::DescriptorSetLayout,
        resources: &[ReflectedResource],
    ) -> Result<vk::DescriptorSet> {
        self.budget.lock().reserve(resources)?;

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        match unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => Ok(sets[0]),
            Err(e) => {
                self.budget.lock().release(resources);
                Err(e.into())
            }
        }
    }

    pub fn free(&self, set: vk::DescriptorSet, resources: &[ReflectedResource]) {
        if let Err(e) = unsafe { self.device.device.free_descriptor_sets(self.pool, &[set]) } {
            log::error!("Failed to free descriptor set: {}", e);
        }
        self.budget.lock().release(resources);
    }

    pub fn budget(&self) -> DescriptorBudget {
        self.budget.lock().clone()
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

pub fn write_storage_image(
    device: &VulkanDevice,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
) {
    let image_info = [vk::DescriptorImageInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::GENERAL)];

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .image_info(&image_info);

    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

/// The render target is sampled while it stays in `GENERAL`.
pub fn write_combined_image_sampler(
    device: &VulkanDevice,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = [vk::DescriptorImageInfo::default()
        .sampler(sampler)
        .image_view(view)
        .image_layout(vk::ImageLayout::GENERAL)];

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(&image_info);

    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

pub fn write_storage_buffer(
    device: &VulkanDevice,
    set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
) {
    let buffer_info = [vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(0)
        .range(vk::WHOLE_SIZE)];

    let write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(&buffer_info);

    unsafe { device.device.update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reflect::ResourceKind;

    fn resource(binding: u32, kind: ResourceKind, count: u32) -> ReflectedResource {
        ReflectedResource {
            binding,
            kind,
            count,
        }
    }

    fn pool_budget() -> DescriptorBudget {
        let types: Vec<_> = POOL_TYPES.iter().map(|&ty| (ty, DESCRIPTORS_PER_TYPE)).collect();
        DescriptorBudget::new(MAX_SETS, &types)
    }

    #[test]
    fn layout_mirrors_reflected_bindings() {
        let resources = [
            resource(0, ResourceKind::CombinedImageSampler, 1),
            resource(1, ResourceKind::StorageBuffer, 1),
        ];
        let bindings = layout_bindings(&resources, vk::ShaderStageFlags::FRAGMENT);

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(bindings[1].binding, 1);
        assert_eq!(bindings[1].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
        assert!(bindings
            .iter()
            .all(|b| b.stage_flags == vk::ShaderStageFlags::FRAGMENT && b.descriptor_count == 1));
    }

    #[test]
    fn reserve_and_release_track_each_type() {
        let mut budget = pool_budget();
        let compute = [
            resource(0, ResourceKind::StorageImage, 1),
            resource(1, ResourceKind::StorageBuffer, 1),
        ];

        budget.reserve(&compute).unwrap();
        assert_eq!(budget.remaining_sets(), MAX_SETS - 1);
        assert_eq!(budget.remaining(vk::DescriptorType::STORAGE_IMAGE), 9);
        assert_eq!(budget.remaining(vk::DescriptorType::STORAGE_BUFFER), 9);
        assert_eq!(budget.remaining(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), 10);

        budget.release(&compute);
        assert_eq!(budget, pool_budget());
    }

    #[test]
    fn oversized_layout_is_rejected_without_side_effects() {
        let mut budget = pool_budget();
        let too_many = [
            resource(0, ResourceKind::StorageImage, 1),
            resource(1, ResourceKind::CombinedImageSampler, 11),
        ];

        assert!(matches!(
            budget.reserve(&too_many),
            Err(RenderError::DescriptorBudgetExceeded(_))
        ));
        assert_eq!(budget, pool_budget());
    }

    #[test]
    fn types_outside_the_pool_have_no_budget() {
        let mut budget = pool_budget();
        let uniform = [resource(0, ResourceKind::UniformBuffer, 1)];
        assert!(budget.reserve(&uniform).is_err());
    }

    #[test]
    fn set_count_is_bounded() {
        let mut budget = DescriptorBudget::new(2, &[]);
        budget.reserve(&[]).unwrap();
        budget.reserve(&[]).unwrap();
        assert!(matches!(
            budget.reserve(&[]),
            Err(RenderError::DescriptorBudgetExceeded(_))
        ));
    }
}
