//! Shared functionality of the `halrt` binary, exposed for integration tests.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use halrt::check::{CheckRecorder, CheckReport};
use halrt::compare::HostValue;
use halrt::compiler::ir::SourceModule;
use halrt::compiler::{compile, ImportSymbolTable, Pipeline};
use halrt::hal::{
    create_driver, ensure_drivers_registered, list_drivers, Device, DeviceDescriptor,
    DeviceInfo, ElementType, HalError, HostTensor,
};
use halrt::module::CompiledModule;
use halrt::vm::{standard_registry, Context};
use halrt::RuntimeConfig;

/// Makes every bundled backend visible to the driver registry.
pub fn register_backends() {
    halrt_backend_interp::register_interp_driver();
    halrt_backend_dylib::register_dylib_driver();
    halrt_backend_cuda::register_cuda_driver();
    ensure_drivers_registered();
}

/// Enumeration result of one registered driver.
#[derive(Debug)]
pub struct DriverListing {
    pub driver: String,
    pub devices: std::result::Result<Vec<DeviceInfo>, HalError>,
}

pub fn list_devices() -> Vec<DriverListing> {
    list_drivers()
        .into_iter()
        .map(|driver| {
            let devices = create_driver(&driver).and_then(|d| d.enumerate_devices());
            DriverListing { driver, devices }
        })
        .collect()
}

pub fn read_source(path: &Path) -> Result<SourceModule> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read source module {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse source module {}", path.display()))
}

pub fn compile_source(source: &SourceModule, pipeline: Pipeline) -> Result<CompiledModule> {
    compile(source, pipeline, &ImportSymbolTable::standard())
        .with_context(|| format!("failed to compile module '{}' ({pipeline} pipeline)", source.name))
}

pub fn write_module(module: &CompiledModule, path: &Path) -> Result<()> {
    let bytes = module.to_bytes()?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

pub fn read_module(path: &Path) -> Result<CompiledModule> {
    let bytes = fs::read(path).with_context(|| format!("failed to read module {}", path.display()))?;
    CompiledModule::from_bytes(&bytes)
        .with_context(|| format!("{} is not a compiled module", path.display()))
}

fn element_type_named(name: &str) -> Result<ElementType> {
    ElementType::ALL
        .into_iter()
        .find(|ty| ty.name() == name)
        .ok_or_else(|| anyhow!("unknown element type '{name}'"))
}

fn parse_list<T: std::str::FromStr>(text: &str, what: &str) -> Result<Vec<T>> {
    text.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .map_err(|_| anyhow!("invalid {what} '{item}'"))
        })
        .collect()
}

/// Parses one function argument.
///
/// Scalars are `i32:7`, `i64:7` or `f32:0.5`; tensors are
/// `<type>[<dims>]:<values>`, e.g. `f32[2,3]:1,2,3,4,5,6`.
pub fn parse_arg(text: &str) -> Result<HostValue> {
    let (head, body) = text
        .split_once(':')
        .ok_or_else(|| anyhow!("argument '{text}' must look like <type>:<value>"))?;
    let Some((ty, dims)) = head.strip_suffix(']').and_then(|h| h.split_once('[')) else {
        return match head {
            "i32" => Ok(HostValue::I32(body.trim().parse().context("invalid i32")?)),
            "i64" => Ok(HostValue::I64(body.trim().parse().context("invalid i64")?)),
            "f32" => Ok(HostValue::F32(body.trim().parse().context("invalid f32")?)),
            other => bail!("unsupported scalar type '{other}'"),
        };
    };

    let element_type = element_type_named(ty)?;
    let shape: Vec<usize> = parse_list(dims, "dimension")?;
    let data: Vec<u8> = match element_type {
        ElementType::F32 => parse_list::<f32>(body, "f32")?
            .into_iter()
            .flat_map(f32::to_le_bytes)
            .collect(),
        ElementType::F64 => parse_list::<f64>(body, "f64")?
            .into_iter()
            .flat_map(f64::to_le_bytes)
            .collect(),
        ElementType::I32 => parse_list::<i32>(body, "i32")?
            .into_iter()
            .flat_map(i32::to_le_bytes)
            .collect(),
        ElementType::I64 => parse_list::<i64>(body, "i64")?
            .into_iter()
            .flat_map(i64::to_le_bytes)
            .collect(),
        ElementType::I8 => parse_list::<i8>(body, "i8")?
            .into_iter()
            .flat_map(i8::to_le_bytes)
            .collect(),
        ElementType::U8 | ElementType::I1 => parse_list::<u8>(body, "u8")?,
    };
    let tensor = HostTensor {
        element_type,
        shape,
        data,
    };
    tensor.validate()?;
    Ok(HostValue::Tensor(tensor))
}

/// Creates a device from the first descriptor in `drivers` whose backend is
/// available. Any failure other than `Unavailable` stops the search.
pub fn open_first_available(drivers: &str) -> Result<(String, Arc<dyn Device>)> {
    let mut skipped = Vec::new();
    for entry in drivers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let descriptor = DeviceDescriptor::parse(entry)?;
        match descriptor.create_device() {
            Ok(device) => return Ok((descriptor.to_string(), device)),
            Err(HalError::Unavailable(reason)) => {
                tracing::warn!(backend = %descriptor, %reason, "backend unavailable, trying next");
                skipped.push(format!("{descriptor}: {reason}"));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to create device '{descriptor}'"))
            }
        }
    }
    if skipped.is_empty() {
        bail!("no backend given");
    }
    bail!("no requested backend is available:\n  {}", skipped.join("\n  "))
}

#[derive(Debug)]
pub struct RunOutcome {
    pub backend: String,
    pub values: Vec<HostValue>,
    pub checks: CheckReport,
}

pub fn run_module(
    module: CompiledModule,
    function: &str,
    args: &[HostValue],
    drivers: &str,
) -> Result<RunOutcome> {
    let (backend, device) = open_first_available(drivers)?;
    let recorder = Arc::new(CheckRecorder::new(RuntimeConfig::global().check_max_mismatches));
    let registry = standard_registry(Arc::clone(&recorder))?;
    let context = Context::load(Arc::clone(&device), &registry, module)
        .with_context(|| format!("failed to load module on '{backend}'"))?;
    let inputs = args
        .iter()
        .map(|arg| arg.to_value(device.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = context
        .invoke(function, &inputs)
        .with_context(|| format!("function '{function}' failed on '{backend}'"))?;
    let values = outputs
        .iter()
        .map(HostValue::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RunOutcome {
        backend,
        values,
        checks: recorder.take_report(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_arguments_parse() {
        assert_eq!(parse_arg("i32:7").unwrap(), HostValue::I32(7));
        assert_eq!(parse_arg("i64: -3").unwrap(), HostValue::I64(-3));
        assert_eq!(parse_arg("f32:0.5").unwrap(), HostValue::F32(0.5));
        assert!(parse_arg("u16:1").is_err());
        assert!(parse_arg("7").is_err());
    }

    #[test]
    fn tensor_arguments_parse_and_validate() {
        let HostValue::Tensor(tensor) = parse_arg("f32[2,2]:1,2,3,4").unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(tensor.shape, vec![2, 2]);
        assert_eq!(tensor.to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0]);

        let HostValue::Tensor(ints) = parse_arg("i32[3]:1, 2, 3").unwrap() else {
            panic!("expected a tensor");
        };
        assert_eq!(ints.to_i64_vec(), vec![1, 2, 3]);

        assert!(parse_arg("f32[3]:1,2").is_err());
        assert!(parse_arg("q8[1]:1").is_err());
    }
}
