// SPIR-V resource reflection
//
// spirq walks the compiled module; this file folds its per-entry-point
// variables into the descriptor resources and push constant range the
// pipeline builder needs. Everything lives in descriptor set 0.

use super::error::{RenderError, Result};
use ash::vk;
use spirq::ty::{DescriptorType, Type};
use spirq::var::Variable;
use spirq::ReflectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    CombinedImageSampler,
    SampledImage,
    Sampler,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
}

impl ResourceKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            ResourceKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ResourceKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            ResourceKind::Sampler => vk::DescriptorType::SAMPLER,
            ResourceKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            ResourceKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ResourceKind::CombinedImageSampler => "combined image sampler",
            ResourceKind::SampledImage => "sampled image",
            ResourceKind::Sampler => "sampler",
            ResourceKind::StorageImage => "storage image",
            ResourceKind::UniformBuffer => "uniform buffer",
            ResourceKind::StorageBuffer => "storage buffer",
        }
    }

    fn from_spirq(desc_ty: &DescriptorType) -> Option<Self> {
        match desc_ty {
            DescriptorType::CombinedImageSampler() => Some(ResourceKind::CombinedImageSampler),
            DescriptorType::SampledImage() => Some(ResourceKind::SampledImage),
            DescriptorType::Sampler() => Some(ResourceKind::Sampler),
            DescriptorType::StorageImage(..) => Some(ResourceKind::StorageImage),
            DescriptorType::UniformBuffer() => Some(ResourceKind::UniformBuffer),
            DescriptorType::StorageBuffer(..) => Some(ResourceKind::StorageBuffer),
            _ => None,
        }
    }
}

/// A descriptor binding declared by the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedResource {
    pub binding: u32,
    pub kind: ResourceKind,
    /// Array element count (1 for non-arrays)
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantBlock {
    pub offset: u32,
    pub size: u32,
}

/// Everything the host side needs to lay out descriptors for one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    /// Sorted by binding index
    pub resources: Vec<ReflectedResource>,
    pub push_constants: Option<PushConstantBlock>,
}

impl ShaderReflection {
    pub fn parse(words: &[u32]) -> Result<Self> {
        let entry_points = ReflectConfig::new()
            .spv(words)
            .ref_all_rscs(true)
            .reflect()
            .map_err(|e| RenderError::Reflection(format!("{:?}", e)))?;

        let mut reflection = Self::default();
        let mut push_range: Option<(u32, u32)> = None;

        for entry_point in &entry_points {
            for var in &entry_point.vars {
                match var {
                    Variable::Descriptor {
                        name,
                        desc_bind,
                        desc_ty,
                        nbind,
                        ..
                    } => {
                        let label = name.as_deref().unwrap_or("<unnamed>");
                        let Some(kind) = ResourceKind::from_spirq(desc_ty) else {
                            log::warn!("Skipping unsupported resource {} ({:?})", label, desc_ty);
                            continue;
                        };
                        if desc_bind.set() != 0 {
                            return Err(RenderError::Reflection(format!(
                                "resource {} is in descriptor set {}, only set 0 is supported",
                                label,
                                desc_bind.set()
                            )));
                        }

                        let count = if *nbind == 0 {
                            log::warn!("Unsized descriptor array {} reflected as a single binding", label);
                            1
                        } else {
                            *nbind
                        };
                        reflection.add_resource(ReflectedResource {
                            binding: desc_bind.bind(),
                            kind,
                            count,
                        })?;
                    }
                    Variable::PushConstant { name, ty } => {
                        let (start, end) = push_constant_extent(name.as_deref(), ty)?;
                        push_range = Some(match push_range {
                            Some((s, e)) => (s.min(start), e.max(end)),
                            None => (start, end),
                        });
                    }
                    _ => {}
                }
            }
        }

        reflection.resources.sort_by_key(|r| r.binding);
        reflection.push_constants = push_range.map(|(start, end)| PushConstantBlock {
            offset: start,
            size: end - start,
        });
        Ok(reflection)
    }

    pub fn binding(&self, binding: u32) -> Option<&ReflectedResource> {
        self.resources.iter().find(|r| r.binding == binding)
    }

    // Entry points sharing a module report the same resource once each.
    fn add_resource(&mut self, resource: ReflectedResource) -> Result<()> {
        match self.binding(resource.binding) {
            Some(existing) if *existing == resource => Ok(()),
            Some(existing) => Err(RenderError::Reflection(format!(
                "binding {} is declared as both {} and {}",
                resource.binding,
                existing.kind.describe(),
                resource.kind.describe()
            ))),
            None => {
                self.resources.push(resource);
                Ok(())
            }
        }
    }
}

/// `[first member offset, end of block)` of a push constant block.
fn push_constant_extent(name: Option<&str>, ty: &Type) -> Result<(u32, u32)> {
    let label = name.unwrap_or("<unnamed>");
    let end = ty.nbyte().ok_or_else(|| {
        RenderError::Reflection(format!("push constant block {} has no fixed size", label))
    })?;
    let start = match ty {
        Type::Struct(st) => st.members.iter().filter_map(|m| m.offset).min().unwrap_or(0),
        _ => 0,
    };

    let to_u32 = |value: usize| {
        u32::try_from(value).map_err(|_| {
            RenderError::Reflection(format!("push constant block {} is too large", label))
        })
    };
    Ok((to_u32(start.min(end))?, to_u32(end)?))
}
