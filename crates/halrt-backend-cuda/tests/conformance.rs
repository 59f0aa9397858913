use std::sync::Arc;

use halrt::hal::{Device, Driver, FORMAT_CUDA_PTX};
use halrt_backend_cuda::CudaDriver;
use halrt_backend_tests::define_backend_tests;
use halrt_backend_tests::fixtures::KernelSection;

const ELEMENTWISE_PTX: &str = r#"
.version 6.0
.target sm_50
.address_size 64

.visible .entry add(
    .param .u64 add_a,
    .param .u64 add_a_len,
    .param .u64 add_b,
    .param .u64 add_b_len,
    .param .u64 add_out,
    .param .u64 add_out_len,
    .param .u64 add_status
)
{
    .reg .pred %p<2>;
    .reg .b32 %r<5>;
    .reg .f32 %f<4>;
    .reg .b64 %rd<14>;

    ld.param.u64 %rd1, [add_a];
    ld.param.u64 %rd2, [add_b];
    ld.param.u64 %rd3, [add_out];
    ld.param.u64 %rd4, [add_out_len];
    mov.u32 %r1, %ctaid.x;
    mov.u32 %r2, %ntid.x;
    mov.u32 %r3, %tid.x;
    mad.lo.u32 %r4, %r1, %r2, %r3;
    cvt.u64.u32 %rd5, %r4;
    shr.u64 %rd6, %rd4, 2;
    setp.ge.u64 %p1, %rd5, %rd6;
    @%p1 bra $L_done;

    shl.b64 %rd7, %rd5, 2;
    cvta.to.global.u64 %rd8, %rd1;
    cvta.to.global.u64 %rd9, %rd2;
    cvta.to.global.u64 %rd10, %rd3;
    add.s64 %rd11, %rd8, %rd7;
    add.s64 %rd12, %rd9, %rd7;
    add.s64 %rd13, %rd10, %rd7;
    ld.global.f32 %f1, [%rd11];
    ld.global.f32 %f2, [%rd12];
    add.f32 %f3, %f1, %f2;
    st.global.f32 [%rd13], %f3;

$L_done:
    ret;
}

.visible .entry fail(
    .param .u64 fail_scratch,
    .param .u64 fail_scratch_len,
    .param .u64 fail_status
)
{
    .reg .b32 %r<2>;
    .reg .b64 %rd<3>;

    ld.param.u64 %rd1, [fail_status];
    cvta.to.global.u64 %rd2, %rd1;
    mov.u32 %r1, 3;
    st.global.u32 [%rd2], %r1;
    ret;
}

.visible .entry copy(
    .param .u64 copy_src,
    .param .u64 copy_src_len,
    .param .u64 copy_dst,
    .param .u64 copy_dst_len,
    .param .u64 copy_status
)
{
    .reg .pred %p<2>;
    .reg .b32 %r<5>;
    .reg .f32 %f<2>;
    .reg .b64 %rd<10>;

    ld.param.u64 %rd1, [copy_src];
    ld.param.u64 %rd2, [copy_dst];
    ld.param.u64 %rd3, [copy_dst_len];
    mov.u32 %r1, %ctaid.x;
    mov.u32 %r2, %ntid.x;
    mov.u32 %r3, %tid.x;
    mad.lo.u32 %r4, %r1, %r2, %r3;
    cvt.u64.u32 %rd4, %r4;
    shr.u64 %rd5, %rd3, 2;
    setp.ge.u64 %p1, %rd4, %rd5;
    @%p1 bra $L_copy_done;

    shl.b64 %rd6, %rd4, 2;
    cvta.to.global.u64 %rd7, %rd1;
    cvta.to.global.u64 %rd8, %rd2;
    add.s64 %rd7, %rd7, %rd6;
    add.s64 %rd9, %rd8, %rd6;
    ld.global.f32 %f1, [%rd7];
    st.global.f32 [%rd9], %f1;

$L_copy_done:
    ret;
}
"#;

fn cuda_device_or_skip() -> Option<Arc<dyn Device>> {
    let driver = CudaDriver::new();
    if let Err(err) = driver.enumerate_devices() {
        eprintln!("skipping cuda backend test: {err}");
        return None;
    }
    Some(driver.create_default_device().expect("cuda device"))
}

fn cuda_kernels() -> KernelSection {
    KernelSection {
        format: FORMAT_CUDA_PTX,
        data: ELEMENTWISE_PTX.as_bytes().to_vec(),
    }
}

define_backend_tests!(cuda_conformance, cuda_device_or_skip, cuda_kernels);

#[test]
fn registry_lists_cuda_even_without_hardware() {
    halrt::hal::ensure_drivers_registered();
    assert!(halrt::hal::list_drivers().contains(&"cuda".to_string()));
    let driver = halrt::hal::create_driver("cuda").unwrap();
    match driver.enumerate_devices() {
        Ok(devices) => assert!(!devices.is_empty()),
        Err(err) => assert_eq!(err.code(), "unavailable", "{err}"),
    }
}
