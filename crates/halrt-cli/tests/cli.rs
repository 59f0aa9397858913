use anyhow::Result;
use halrt::compare::HostValue;
use halrt::compiler::ir::{Attribute, FunctionBuilder, SourceModule, Type};
use halrt::compiler::Pipeline;
use halrt::hal::{EntryPointDef, ElementType, HalError, HostTensor, FORMAT_INTERP_BYTECODE};
use halrt::module::ExecutableDef;
use halrt_cli::{
    compile_source, list_devices, open_first_available, read_module, read_source,
    register_backends, run_module, write_module,
};

const KERNELS: &str = "
kernel scale f32 f32
  guard b1
  load r0, b0
  add r1, r0, r0
  store b1, r1
end
";

/// `main(x)` doubles `x` on the device, then checks the result twice:
/// once against the right answer and once against `x` itself.
fn doubling_source() -> Result<SourceModule> {
    let tensor = Type::tensor(ElementType::F32, &[4]);
    let mut module = SourceModule::new("doubling");
    module.executables.push(
        ExecutableDef::new("kernels", vec![EntryPointDef::new("scale", 2, [4, 1, 1])])
            .with_section(FORMAT_INTERP_BYTECODE, halrt_backend_interp::assemble(KERNELS)?),
    );

    let mut builder = FunctionBuilder::new("main", &[tensor.clone()]);
    let input = builder.param(0);
    let doubled = builder.op(
        "flow.dispatch",
        &[input],
        &[tensor],
        &[
            ("executable", Attribute::Str("kernels".into())),
            ("entry_point", Attribute::Str("scale".into())),
            ("workgroups", Attribute::Ints(vec![1, 1, 1])),
        ],
    )[0];
    let expected = builder.dense_f32(&[4], &[2.0, 4.0, 6.0, 8.0]);
    builder.op("check.expect_eq", &[doubled, expected], &[], &[]);
    builder.op("check.expect_eq", &[doubled, input], &[], &[]);
    module.functions.push(builder.finish(&[doubled]));
    Ok(module)
}

fn input() -> HostValue {
    HostValue::Tensor(HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0]))
}

fn register_absent_driver() {
    register_backends();
    halrt::hal::register_driver("absent", || Err(HalError::unavailable("not installed")));
}

#[test]
fn compiled_module_runs_on_first_available_backend() -> Result<()> {
    register_absent_driver();
    let dir = tempfile::tempdir()?;

    let source_path = dir.path().join("doubling.json");
    std::fs::write(&source_path, serde_json::to_string_pretty(&doubling_source()?)?)?;
    let module = compile_source(&read_source(&source_path)?, Pipeline::Hal)?;
    let module_path = dir.path().join("doubling.hrtm");
    write_module(&module, &module_path)?;

    let outcome = run_module(read_module(&module_path)?, "main", &[input()], "absent, interp")?;
    assert_eq!(outcome.backend, "interp");
    assert_eq!(
        outcome.values,
        vec![HostValue::Tensor(HostTensor::from_f32(&[4], &[2.0, 4.0, 6.0, 8.0]))]
    );
    assert_eq!(outcome.checks.len(), 2);
    assert_eq!(outcome.checks.failure_count(), 1);
    assert!(outcome.checks.outcomes[0].passed);
    assert!(!outcome.checks.outcomes[1].passed);
    Ok(())
}

#[test]
fn vm_pipeline_rejects_dispatches() -> Result<()> {
    register_backends();
    let err = compile_source(&doubling_source()?, Pipeline::Vm).unwrap_err();
    assert!(format!("{err:#}").contains("vm pipeline"), "{err:#}");
    Ok(())
}

#[test]
fn backend_search_stops_on_real_failures() {
    register_absent_driver();
    let err = open_first_available("absent").err().unwrap();
    assert!(err.to_string().contains("no requested backend is available"), "{err}");

    let err = open_first_available("no-such-driver,interp").err().unwrap();
    assert!(format!("{err:#}").contains("no-such-driver"), "{err:#}");

    let (backend, _device) = open_first_available("absent,interp:0").unwrap();
    assert_eq!(backend, "interp:0");
}

#[test]
fn garbage_is_not_a_module() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("garbage.hrtm");
    std::fs::write(&path, b"definitely not a module")?;
    assert!(read_module(&path).is_err());
    Ok(())
}

#[test]
fn device_listing_covers_every_driver() {
    register_backends();
    let listings = list_devices();
    let interp = listings
        .iter()
        .find(|listing| listing.driver == "interp")
        .unwrap();
    let devices = interp.devices.as_ref().unwrap();
    assert_eq!(devices.len(), 1);
    assert!(listings.iter().any(|listing| listing.driver == "cuda"));
    assert!(listings.iter().any(|listing| listing.driver == "dylib"));
}
