use std::sync::Arc;

use halrt::hal::{Device, Driver, FORMAT_DYLIB_C};
use halrt_backend_dylib::DylibDriver;
use halrt_backend_tests::define_backend_tests;
use halrt_backend_tests::fixtures::KernelSection;

const ELEMENTWISE_SOURCE: &str = r#"
HALRT_KERNEL(add) {
    (void)binding_count;
    const float *a = (const float *)bindings[0].data;
    const float *b = (const float *)bindings[1].data;
    float *out = (float *)bindings[2].data;
    size_t count = bindings[2].length / sizeof(float);
    size_t total = halrt_invocations(workgroups, workgroup_size);
    for (size_t i = 0; i < total && i < count; ++i) {
        out[i] = a[i] + b[i];
    }
    return 0;
}

HALRT_KERNEL(fail) {
    (void)bindings;
    (void)binding_count;
    (void)workgroups;
    (void)workgroup_size;
    return 3;
}

HALRT_KERNEL(copy) {
    (void)binding_count;
    const float *src = (const float *)bindings[0].data;
    float *dst = (float *)bindings[1].data;
    size_t count = bindings[1].length / sizeof(float);
    size_t total = halrt_invocations(workgroups, workgroup_size);
    for (size_t i = 0; i < total && i < count; ++i) {
        dst[i] = src[i];
    }
    return 0;
}
"#;

fn dylib_device_or_skip() -> Option<Arc<dyn Device>> {
    let driver = DylibDriver::new();
    if !driver.is_available() {
        eprintln!("skipping dylib backend test: no usable C compiler");
        return None;
    }
    Some(driver.create_default_device().expect("dylib device"))
}

fn dylib_kernels() -> KernelSection {
    KernelSection {
        format: FORMAT_DYLIB_C,
        data: ELEMENTWISE_SOURCE.as_bytes().to_vec(),
    }
}

define_backend_tests!(dylib_conformance, dylib_device_or_skip, dylib_kernels);
