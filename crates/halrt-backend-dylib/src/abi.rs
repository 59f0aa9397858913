//! C calling convention shared by every native kernel.

use std::ffi::c_void;

/// Definitions prepended to `dylib-c` sources.
pub const KERNEL_PRELUDE: &str = r#"#include <stddef.h>
#include <stdint.h>

typedef struct {
    void *data;
    size_t length;
} halrt_binding;

#define HALRT_KERNEL(name)                                                      \
    int32_t name(const halrt_binding *bindings, size_t binding_count,           \
                 const uint32_t workgroups[3], const uint32_t workgroup_size[3])

static inline size_t halrt_invocations(const uint32_t workgroups[3],
                                       const uint32_t workgroup_size[3]) {
    return (size_t)workgroups[0] * workgroups[1] * workgroups[2] *
           workgroup_size[0] * workgroup_size[1] * workgroup_size[2];
}

"#;

/// Mirror of `halrt_binding`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBinding {
    pub data: *mut c_void,
    pub length: usize,
}

/// Exported kernel: returns 0 on success, any other value fails the dispatch.
pub type KernelFn = unsafe extern "C" fn(
    bindings: *const RawBinding,
    binding_count: usize,
    workgroups: *const u32,
    workgroup_size: *const u32,
) -> i32;
