use std::sync::Arc;

use halrt::check::{CheckKind, CheckRecorder, DEFAULT_MAX_MISMATCHES};
use halrt::compiler::ir::{Attribute, FunctionBuilder, SourceModule, Type};
use halrt::compiler::{compile_hal, ImportSymbolTable};
use halrt::hal::{BufferView, Device, ElementType, HalError, HostTensor};
use halrt::module::{CompiledModule, ValueKind};
use halrt::vm::{standard_registry, Context, Value};

use crate::fixtures::{elementwise_executable, KernelSection};

const LEN: usize = 6;

/// `main(a, b)` dispatches `add`, checks the sum against the expected values
/// (passes) and against zeros (fails), and returns the sum.
pub fn add_and_check_module(section: &KernelSection) -> CompiledModule {
    let tensor = Type::tensor(ElementType::F32, &[LEN]);
    let mut module = SourceModule::new("conformance");
    module.executables.push(elementwise_executable(section));

    let mut builder = FunctionBuilder::new("main", &[tensor.clone(), tensor.clone()]);
    let (lhs, rhs) = (builder.param(0), builder.param(1));
    let sum = builder.op(
        "flow.dispatch",
        &[lhs, rhs],
        &[tensor],
        &[
            ("executable", Attribute::Str("elementwise".into())),
            ("entry_point", Attribute::Str("add".into())),
            ("workgroups", Attribute::Ints(vec![2, 1, 1])),
        ],
    )[0];
    let expected = builder.dense_f32(&[LEN], &[3.0, 6.0, 9.0, 12.0, 15.0, 18.0]);
    builder.op(
        "check.expect_almost_eq",
        &[sum, expected],
        &[],
        &[("tolerance", Attribute::Float(1e-4))],
    );
    let zeros = builder.dense_f32(&[LEN], &[0.0; LEN]);
    builder.op("check.expect_eq", &[sum, zeros], &[], &[]);
    module.functions.push(builder.finish(&[sum]));

    let compiled = compile_hal(&module, &ImportSymbolTable::standard())
        .unwrap_or_else(|err| panic!("conformance module failed to compile: {err}"));
    let bytes = compiled.to_bytes().unwrap();
    CompiledModule::from_bytes(&bytes).unwrap()
}

fn inputs(device: &Arc<dyn Device>) -> Vec<Value> {
    let lhs: Vec<f32> = (1..=LEN).map(|i| i as f32).collect();
    let rhs: Vec<f32> = lhs.iter().map(|v| 2.0 * v).collect();
    [lhs, rhs]
        .iter()
        .map(|values| {
            let host = HostTensor::from_f32(&[LEN], values);
            Value::BufferView(BufferView::from_host(device.allocator(), &host).unwrap())
        })
        .collect()
}

pub fn check_pipeline_reports_results(device: &Arc<dyn Device>, section: &KernelSection) {
    let recorder = Arc::new(CheckRecorder::new(DEFAULT_MAX_MISMATCHES));
    let registry = standard_registry(Arc::clone(&recorder)).unwrap();
    let context = Context::load(Arc::clone(device), &registry, add_and_check_module(section)).unwrap();

    let outputs = context.invoke("main", &inputs(device)).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].kind(), ValueKind::BufferView);
    let sum = outputs[0].as_buffer_view().unwrap().to_host().unwrap();
    assert_eq!(sum.to_f64_vec(), vec![3.0, 6.0, 9.0, 12.0, 15.0, 18.0]);

    let report = recorder.take_report();
    assert_eq!(report.len(), 2);
    assert!(!report.all_passed());
    let outcomes = &report.outcomes;
    assert_eq!(outcomes[0].kind, CheckKind::ExpectAlmostEq);
    assert!(outcomes[0].passed);
    assert_eq!(outcomes[1].kind, CheckKind::ExpectEq);
    assert!(!outcomes[1].passed);
    assert_eq!(outcomes[1].diagnostic.mismatch_count, LEN);
    assert_eq!(outcomes[1].diagnostic.mismatches[0].actual, 3.0);
    assert_eq!(outcomes[1].diagnostic.mismatches[0].expected, 0.0);
}

pub fn unresolved_import_fails_before_work(device: &Arc<dyn Device>, section: &KernelSection) {
    let recorder = Arc::new(CheckRecorder::new(DEFAULT_MAX_MISMATCHES));
    let registry = standard_registry(recorder).unwrap();

    let mut renamed = add_and_check_module(section);
    let decl = renamed
        .imports
        .iter_mut()
        .find(|decl| decl.name == "check.expect_eq")
        .unwrap();
    decl.name = "check.expect_bitwise_eq".to_string();
    let err = Context::load(Arc::clone(device), &registry, renamed).err().unwrap();
    assert!(
        matches!(&err, HalError::UnresolvedImport { name, .. } if name == "check.expect_bitwise_eq"),
        "{err}"
    );

    let mut retyped = add_and_check_module(section);
    let decl = retyped
        .imports
        .iter_mut()
        .find(|decl| decl.name == "check.expect_almost_eq")
        .unwrap();
    decl.signature.params.pop();
    let err = Context::load(Arc::clone(device), &registry, retyped).err().unwrap();
    assert!(matches!(err, HalError::UnresolvedImport { .. }), "{err}");

    assert_eq!(device.executable_cache().compilation_count(), 0);
    assert_eq!(device.live_resources().command_buffers, 0);
}

pub fn invoke_rejects_mistyped_arguments(device: &Arc<dyn Device>, section: &KernelSection) {
    let recorder = Arc::new(CheckRecorder::new(DEFAULT_MAX_MISMATCHES));
    let registry = standard_registry(Arc::clone(&recorder)).unwrap();
    let context = Context::load(Arc::clone(device), &registry, add_and_check_module(section)).unwrap();
    let err = context.invoke("main", &[Value::I32(1), Value::I32(2)]).unwrap_err();
    assert!(matches!(err, HalError::InvalidArgument(_)));
    assert!(context.invoke("missing", &[]).is_err());
    assert!(recorder.report().is_empty());
}
