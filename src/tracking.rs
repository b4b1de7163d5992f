//! Resource state tracking and automatic barrier inference.
//!
//! Each buffer and image carries a [`ResourceState`]: the last write access,
//! the reads already synchronized against that write, and the current image
//! layout. [`ResourceState::transition`] computes the minimal barrier needed
//! before the next access and updates the state.

use ash::vk;

/// One access to a resource: a pipeline stage mask paired with the access
/// mask performed at those stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

const ALL_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
);
const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
        | vk::AccessFlags2::INDEX_READ.as_raw()
        | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags2::UNIFORM_READ.as_raw()
        | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::SHADER_READ.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw()
        | vk::AccessFlags2::HOST_READ.as_raw()
        | vk::AccessFlags2::MEMORY_READ.as_raw()
        | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw(),
);

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };

    pub fn is_empty(&self) -> bool {
        self.stage.is_empty() && self.access.is_empty()
    }

    pub fn is_readonly(&self) -> bool {
        !self.access.intersects(ALL_WRITE_BITS)
    }

    pub fn is_writeonly(&self) -> bool {
        !self.access.intersects(ALL_READ_BITS)
    }
}
impl std::ops::BitOr for Access {
    type Output = Access;
    fn bitor(self, rhs: Self) -> Self::Output {
        Access {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl std::ops::BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

/// A memory dependency between two accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}

impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src.is_empty() && self.dst.is_empty()
    }
}
impl std::ops::BitOrAssign for MemoryBarrier {
    fn bitor_assign(&mut self, rhs: Self) {
        self.src |= rhs.src;
        self.dst |= rhs.dst;
    }
}

// Pipeline stage ordering tables from the execution-ordering rules of the
// graphics, compute and transfer pipelines. Stages earlier in a table
// logically complete before later ones, so an execution dependency whose
// destination is an earlier-or-equal stage already covers a later one.
const ORDER_PRIMITIVE: &[vk::PipelineStageFlags2] = &[
    vk::PipelineStageFlags2::DRAW_INDIRECT,
    vk::PipelineStageFlags2::INDEX_INPUT,
    vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
    vk::PipelineStageFlags2::VERTEX_SHADER,
    vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
    vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
    vk::PipelineStageFlags2::GEOMETRY_SHADER,
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
    vk::PipelineStageFlags2::FRAGMENT_SHADER,
    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
];
const ORDER_MESH: &[vk::PipelineStageFlags2] = &[
    vk::PipelineStageFlags2::DRAW_INDIRECT,
    vk::PipelineStageFlags2::TASK_SHADER_EXT,
    vk::PipelineStageFlags2::MESH_SHADER_EXT,
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
    vk::PipelineStageFlags2::FRAGMENT_SHADER,
    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
];
const ORDER_COMPUTE: &[vk::PipelineStageFlags2] = &[
    vk::PipelineStageFlags2::DRAW_INDIRECT,
    vk::PipelineStageFlags2::COMPUTE_SHADER,
];
const ORDER_TRANSFER: &[vk::PipelineStageFlags2] = &[vk::PipelineStageFlags2::ALL_TRANSFER];
const ORDER_RAY_TRACING: &[vk::PipelineStageFlags2] = &[
    vk::PipelineStageFlags2::DRAW_INDIRECT,
    vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
];

const ORDERS: &[&[vk::PipelineStageFlags2]] = &[
    ORDER_PRIMITIVE,
    ORDER_MESH,
    ORDER_COMPUTE,
    ORDER_TRANSFER,
    ORDER_RAY_TRACING,
];

/// Compares two single-bit pipeline stages by execution order.
///
/// Returns `None` when the stages belong to different pipelines (or either
/// mask has multiple bits), meaning no ordering guarantee exists.
pub fn compare_pipeline_stages(
    earlier: vk::PipelineStageFlags2,
    later: vk::PipelineStageFlags2,
) -> Option<std::cmp::Ordering> {
    if earlier == later {
        return Some(std::cmp::Ordering::Equal);
    }
    for order in ORDERS {
        let a = order.iter().position(|&stage| stage == earlier);
        let b = order.iter().position(|&stage| stage == later);
        if let (Some(a), Some(b)) = (a, b) {
            return Some(a.cmp(&b));
        }
    }
    None
}

/// Synchronization state of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    /// The latest write access.
    pub write: Access,
    /// Reads that have already been synchronized against [`Self::write`].
    pub reads: Access,
    /// Current image layout; [`vk::ImageLayout::UNDEFINED`] for buffers.
    pub layout: vk::ImageLayout,
    /// Queue family of the most recent access. Resources are created with
    /// concurrent sharing, so a family change needs no ownership transfer.
    pub queue_family: u32,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            write: Access::NONE,
            reads: Access::NONE,
            layout: vk::ImageLayout::UNDEFINED,
            queue_family: vk::QUEUE_FAMILY_IGNORED,
        }
    }
}

impl ResourceState {
    /// Records the next access and returns the minimal barrier that must be
    /// executed before it.
    ///
    /// `with_layout_transition` marks accesses that change the image layout;
    /// the barrier then keeps its access masks even when only an execution
    /// dependency would otherwise suffice, because the transition itself
    /// writes the resource.
    pub fn transition(&mut self, next: Access, with_layout_transition: bool) -> MemoryBarrier {
        let barrier = if next.is_readonly() && !with_layout_transition {
            let barrier = if self.write.is_empty() {
                // Nothing written yet; reads need no dependency.
                MemoryBarrier::default()
            } else if self.reads.is_empty() {
                // Read-after-write.
                MemoryBarrier {
                    src: self.write,
                    dst: next,
                }
            } else {
                // Read-after-read: a prior read was already synchronized
                // against the write. The destination scope of that dependency
                // implicitly covers all logically later stages, so a read at
                // a later-or-equal stage needs nothing. A read at an earlier
                // stage chains an execution dependency from the prior read
                // stage; unordered stages get the full barrier again.
                match compare_pipeline_stages(self.reads.stage, next.stage) {
                    Some(std::cmp::Ordering::Greater) => MemoryBarrier {
                        src: Access {
                            stage: self.reads.stage,
                            access: vk::AccessFlags2::NONE,
                        },
                        dst: Access {
                            stage: next.stage,
                            access: vk::AccessFlags2::NONE,
                        },
                    },
                    Some(_) => MemoryBarrier::default(),
                    None => MemoryBarrier {
                        src: self.write,
                        dst: next,
                    },
                }
            };
            self.reads |= next;
            barrier
        } else {
            let barrier = if self.write.is_empty() && self.reads.is_empty() {
                if with_layout_transition {
                    // First use with a transition still needs the barrier to
                    // carry the destination scope.
                    MemoryBarrier {
                        src: Access::NONE,
                        dst: next,
                    }
                } else {
                    MemoryBarrier::default()
                }
            } else if !self.reads.is_empty() {
                // Write-after-read: execution dependency only; the reads made
                // nothing newly visible.
                MemoryBarrier {
                    src: Access {
                        stage: self.reads.stage,
                        access: vk::AccessFlags2::NONE,
                    },
                    dst: Access {
                        stage: next.stage,
                        access: if with_layout_transition {
                            next.access
                        } else {
                            vk::AccessFlags2::NONE
                        },
                    },
                }
            } else {
                // Write-after-write.
                MemoryBarrier {
                    src: self.write,
                    dst: next,
                }
            };
            self.write = next;
            self.reads = Access::NONE;
            barrier
        };
        barrier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPUTE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
    };
    const COMPUTE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_READ,
    };
    const VERTEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_READ,
    };
    const FRAGMENT_READ: Access = Access {
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_STORAGE_READ,
    };
    const TRANSFER_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_TRANSFER,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };

    #[test]
    fn test_first_read_needs_no_barrier() {
        let mut state = ResourceState::default();
        let barrier = state.transition(COMPUTE_READ, false);
        assert_eq!(barrier, MemoryBarrier::default());
    }

    #[test]
    fn test_first_write_needs_no_barrier() {
        let mut state = ResourceState::default();
        let barrier = state.transition(COMPUTE_WRITE, false);
        assert_eq!(barrier, MemoryBarrier::default());
    }

    #[test]
    fn test_wr() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        let barrier = state.transition(COMPUTE_READ, false);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: TRANSFER_WRITE,
                dst: COMPUTE_READ,
            }
        );
    }

    #[test]
    fn test_wrr_same_stage() {
        let mut state = ResourceState::default();
        state.transition(COMPUTE_WRITE, false);
        state.transition(COMPUTE_READ, false);
        // Second read at the same stage is already covered.
        let barrier = state.transition(COMPUTE_READ, false);
        assert_eq!(barrier, MemoryBarrier::default());
    }

    #[test]
    fn test_wrr_later_stage_already_covered() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        state.transition(VERTEX_READ, false);
        // The vertex-stage dependency implicitly covers fragment too.
        let barrier = state.transition(FRAGMENT_READ, false);
        assert_eq!(barrier, MemoryBarrier::default());
    }

    #[test]
    fn test_wrr_earlier_stage_chains_execution_dependency() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        state.transition(FRAGMENT_READ, false);
        let barrier = state.transition(VERTEX_READ, false);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: Access {
                    stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    access: vk::AccessFlags2::NONE,
                },
                dst: Access {
                    stage: vk::PipelineStageFlags2::VERTEX_SHADER,
                    access: vk::AccessFlags2::NONE,
                },
            }
        );
    }

    #[test]
    fn test_wrr_unordered_stages_full_barrier() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        state.transition(FRAGMENT_READ, false);
        // Compute and fragment have no ordering guarantee.
        let barrier = state.transition(COMPUTE_READ, false);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: TRANSFER_WRITE,
                dst: COMPUTE_READ,
            }
        );
    }

    #[test]
    fn test_wrw_execution_only() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        state.transition(COMPUTE_READ, false);
        let barrier = state.transition(COMPUTE_WRITE, false);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: Access {
                    stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                    access: vk::AccessFlags2::NONE,
                },
                dst: Access {
                    stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                    access: vk::AccessFlags2::NONE,
                },
            }
        );
    }

    #[test]
    fn test_www_full_barrier() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        let barrier = state.transition(COMPUTE_WRITE, false);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: TRANSFER_WRITE,
                dst: COMPUTE_WRITE,
            }
        );
    }

    #[test]
    fn test_layout_transition_on_first_use_keeps_dst_scope() {
        let mut state = ResourceState::default();
        let barrier = state.transition(TRANSFER_WRITE, true);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: Access::NONE,
                dst: TRANSFER_WRITE,
            }
        );
    }

    #[test]
    fn test_layout_transition_after_read_keeps_dst_access() {
        let mut state = ResourceState::default();
        state.transition(TRANSFER_WRITE, false);
        state.transition(COMPUTE_READ, false);
        let barrier = state.transition(TRANSFER_WRITE, true);
        assert_eq!(
            barrier,
            MemoryBarrier {
                src: Access {
                    stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
                    access: vk::AccessFlags2::NONE,
                },
                dst: TRANSFER_WRITE,
            }
        );
    }

    #[test]
    fn test_compare_stages() {
        use std::cmp::Ordering;
        assert_eq!(
            compare_pipeline_stages(
                vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::PipelineStageFlags2::FRAGMENT_SHADER
            ),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_pipeline_stages(
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::PipelineStageFlags2::VERTEX_SHADER
            ),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_pipeline_stages(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::PipelineStageFlags2::FRAGMENT_SHADER
            ),
            None
        );
    }
}
