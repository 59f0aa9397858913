//! End-to-end runtime behavior on a minimal host-only device.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use halrt::check::{CheckKind, CheckRecorder, DEFAULT_MAX_MISMATCHES};
use halrt::compare::{parse_target_backends, run_on_backends, HostValue};
use halrt::compiler::ir::{Attribute, FunctionBuilder, SourceModule, Type};
use halrt::compiler::{compile_vm, ImportSymbolTable};
use halrt::hal::{
    create_device_from_descriptor, execute_host_transfer, register_driver, validate_device_info,
    BackendKind, Command, CommandExecutor, Device, DeviceCore, DeviceInfo, Driver, DriverId,
    ElementType, ExecutableCompiler, ExecutableSpec, HalError, HalResult, HostAllocator,
    HostTensor, PreparedExecutable, SchedulingModel,
};
use halrt::vm::{standard_registry, Context, Value};

struct TransferOnly;

impl CommandExecutor for TransferOnly {
    fn execute(&self, command: &Command) -> HalResult<()> {
        execute_host_transfer(command)
    }
}

struct NoFormats;

impl ExecutableCompiler for NoFormats {
    fn formats(&self) -> &[&'static str] {
        &[]
    }

    fn prepare(&self, spec: &ExecutableSpec) -> HalResult<Box<dyn PreparedExecutable>> {
        Err(HalError::compilation(format!("cannot prepare '{}'", spec.format)))
    }
}

struct HostDevice {
    core: DeviceCore,
}

impl Device for HostDevice {
    fn core(&self) -> &DeviceCore {
        &self.core
    }
}

struct HostDriver {
    id: DriverId,
}

impl Driver for HostDriver {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &str {
        "host"
    }

    fn enumerate_devices(&self) -> HalResult<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            driver: self.id,
            driver_name: "host".to_string(),
            ordinal: 0,
            name: "transfer-only host".to_string(),
            backend: BackendKind::Interpreter,
            features: BTreeSet::new(),
        }])
    }

    fn create_device(&self, info: &DeviceInfo) -> HalResult<Arc<dyn Device>> {
        validate_device_info(self, info)?;
        let core = DeviceCore::new(
            info.clone(),
            Arc::new(HostAllocator::new(None)),
            Arc::new(NoFormats),
            SchedulingModel::Workers(2),
            Arc::new(TransferOnly),
        )?;
        Ok(Arc::new(HostDevice { core }))
    }
}

fn register_host_driver() {
    register_driver("host", || {
        Ok(Arc::new(HostDriver {
            id: DriverId::next(),
        }) as Arc<dyn Driver>)
    });
}

/// `main(flag, mask)` checks `flag` both ways and `mask` for all-true.
fn predicate_module() -> Result<halrt::CompiledModule> {
    let mask = Type::tensor(ElementType::I32, &[3]);
    let mut module = SourceModule::new("predicates");
    let mut builder = FunctionBuilder::new("main", &[Type::I32, mask]);
    let (flag, mask) = (builder.param(0), builder.param(1));
    builder.op("check.expect_true", &[flag], &[], &[]);
    builder.op("check.expect_false", &[flag], &[], &[]);
    builder.op("check.expect_all_true", &[mask], &[], &[]);
    let answer = builder.constant(Attribute::Int(42), Type::I32);
    module.functions.push(builder.finish(&[answer]));
    Ok(compile_vm(&module, &ImportSymbolTable::standard())?)
}

#[test]
fn checks_record_outcomes_without_aborting() -> Result<()> {
    register_host_driver();
    let device = create_device_from_descriptor("host")?;
    let recorder = Arc::new(CheckRecorder::new(DEFAULT_MAX_MISMATCHES));
    let registry = standard_registry(Arc::clone(&recorder))?;
    let context = Context::load(Arc::clone(&device), &registry, predicate_module()?)?;

    let mask = HostValue::Tensor(HostTensor::from_i32(&[3], &[1, 0, 5]));
    let args = vec![Value::I32(1), mask.to_value(device.as_ref())?];
    let outputs = context.invoke("main", &args)?;
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].as_i32()?, 42);

    let report = recorder.take_report();
    let kinds: Vec<CheckKind> = report.outcomes.iter().map(|outcome| outcome.kind).collect();
    assert_eq!(
        kinds,
        vec![CheckKind::ExpectTrue, CheckKind::ExpectFalse, CheckKind::ExpectAllTrue]
    );
    let passed: Vec<bool> = report.outcomes.iter().map(|outcome| outcome.passed).collect();
    assert_eq!(passed, vec![true, false, false]);
    let all_true = &report.outcomes[2].diagnostic;
    assert_eq!(all_true.mismatch_count, 1);
    assert_eq!(all_true.mismatches[0].index, 1);
    Ok(())
}

#[test]
fn modules_with_unpreparable_executables_fail_to_load() -> Result<()> {
    register_host_driver();
    let device = create_device_from_descriptor("host")?;
    let mut module = predicate_module()?;
    module.executables.push(
        halrt::module::ExecutableDef::new("kernels", Vec::new())
            .with_section("interp-bytecode", vec![0u8; 4]),
    );
    let registry = standard_registry(Arc::new(CheckRecorder::default()))?;
    let err = Context::load(device, &registry, module).err().unwrap();
    assert!(matches!(err, HalError::CompilationFailure(_)), "{err}");
    Ok(())
}

#[test]
fn comparison_runs_each_backend_independently() -> Result<()> {
    register_host_driver();
    let backends = parse_target_backends("host, host:0")?;
    assert_eq!(backends, vec!["host".to_string(), "host:0".to_string()]);
    let args = vec![
        HostValue::I32(0),
        HostValue::Tensor(HostTensor::from_i32(&[3], &[1, 1, 1])),
    ];
    let results = run_on_backends(&predicate_module()?, "main", &args, &backends)?;
    results.assert_all_equal()?;
    for run in &results.runs {
        assert_eq!(run.values, vec![HostValue::I32(42)]);
        assert_eq!(run.checks.failure_count(), 1);
    }

    let err = parse_target_backends("host,nonesuch").unwrap_err();
    assert!(err.to_string().contains("valid:"), "{err}");
    Ok(())
}
