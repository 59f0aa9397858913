use std::sync::Arc;

use halrt::hal::{Device, FORMAT_INTERP_BYTECODE};
use halrt_backend_interp::{assemble, create_interp_device};
use halrt_backend_tests::define_backend_tests;
use halrt_backend_tests::fixtures::KernelSection;

const ELEMENTWISE_SOURCE: &str = "
# out[i] = a[i] + b[i]
kernel add f32 f32 f32
  guard b2
  load r0, b0
  load r1, b1
  add r2, r0, r1
  store b2, r2
end

kernel fail f32
  trap 1
end

kernel copy f32 f32
  guard b1
  load r0, b0
  store b1, r0
end
";

fn interp_device() -> Option<Arc<dyn Device>> {
    Some(create_interp_device().expect("interpreter device is always available"))
}

fn interp_kernels() -> KernelSection {
    KernelSection {
        format: FORMAT_INTERP_BYTECODE,
        data: assemble(ELEMENTWISE_SOURCE).expect("elementwise kernels assemble"),
    }
}

define_backend_tests!(interp_conformance, interp_device, interp_kernels);

#[test]
fn registry_creates_interp_devices() {
    halrt::hal::ensure_drivers_registered();
    assert!(halrt::hal::list_drivers().contains(&"interp".to_string()));
    let device = halrt::hal::create_device_from_descriptor("interp:0").unwrap();
    assert_eq!(device.info().driver_name, "interp");
    assert!(halrt::hal::create_device_from_descriptor("interp:3").is_err());
}
