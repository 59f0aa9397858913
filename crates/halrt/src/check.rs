//! Verification imports (`check.*`).
//!
//! Checks never abort the program: each call appends a [`CheckOutcome`] to the
//! shared [`CheckRecorder`], and the host reads the [`CheckReport`] once
//! execution has finished.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::hal::{BufferView, ElementType, HalResult, HostTensor};
use crate::module::{Signature, ValueKind};
use crate::vm::{CallContext, ImportRegistry, NativeModule, Value};

pub const DEFAULT_MAX_MISMATCHES: usize = 16;
pub const DEFAULT_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    ExpectTrue,
    ExpectFalse,
    ExpectAllTrue,
    ExpectEq,
    ExpectAlmostEq,
}

impl CheckKind {
    pub const ALL: [CheckKind; 5] = [
        CheckKind::ExpectTrue,
        CheckKind::ExpectFalse,
        CheckKind::ExpectAllTrue,
        CheckKind::ExpectEq,
        CheckKind::ExpectAlmostEq,
    ];

    pub fn import_name(self) -> &'static str {
        match self {
            CheckKind::ExpectTrue => "check.expect_true",
            CheckKind::ExpectFalse => "check.expect_false",
            CheckKind::ExpectAllTrue => "check.expect_all_true",
            CheckKind::ExpectEq => "check.expect_eq",
            CheckKind::ExpectAlmostEq => "check.expect_almost_eq",
        }
    }

    pub fn signature(self) -> Signature {
        match self {
            CheckKind::ExpectTrue | CheckKind::ExpectFalse => Signature::new([ValueKind::I32], []),
            CheckKind::ExpectAllTrue => Signature::new([ValueKind::BufferView], []),
            CheckKind::ExpectEq => Signature::new([ValueKind::BufferView, ValueKind::BufferView], []),
            CheckKind::ExpectAlmostEq => Signature::new(
                [ValueKind::BufferView, ValueKind::BufferView, ValueKind::F32],
                [],
            ),
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.import_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperandSummary {
    pub element_type: ElementType,
    pub shape: Vec<usize>,
}

impl From<&HostTensor> for OperandSummary {
    fn from(host: &HostTensor) -> Self {
        Self {
            element_type: host.element_type,
            shape: host.shape.clone(),
        }
    }
}

/// One differing element: flat index, expected value, actual value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub index: usize,
    pub expected: f64,
    pub actual: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckDiagnostic {
    pub message: String,
    pub tolerance: Option<f32>,
    pub actual: Option<OperandSummary>,
    pub expected: Option<OperandSummary>,
    /// First mismatching elements, capped by the recorder's limit.
    pub mismatches: Vec<Mismatch>,
    /// Total number of mismatching elements.
    pub mismatch_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub index: usize,
    pub kind: CheckKind,
    pub passed: bool,
    pub diagnostic: CheckDiagnostic,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        write!(f, "[{}] #{} {}: {}", verdict, self.index, self.kind, self.diagnostic.message)?;
        for mismatch in &self.diagnostic.mismatches {
            write!(
                f,
                "\n    at {}: expected {}, got {}",
                mismatch.index, mismatch.expected, mismatch.actual
            )?;
        }
        if self.diagnostic.mismatch_count > self.diagnostic.mismatches.len() {
            write!(
                f,
                "\n    ... {} more",
                self.diagnostic.mismatch_count - self.diagnostic.mismatches.len()
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl CheckReport {
    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.passed)
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Collects check outcomes in call order. Shared by every call of one check module.
pub struct CheckRecorder {
    outcomes: Mutex<Vec<CheckOutcome>>,
    max_mismatches: usize,
}

impl CheckRecorder {
    pub fn new(max_mismatches: usize) -> Self {
        Self {
            outcomes: Mutex::new(Vec::new()),
            max_mismatches,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CheckOutcome>> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, kind: CheckKind, passed: bool, diagnostic: CheckDiagnostic) {
        let mut outcomes = self.lock();
        let index = outcomes.len();
        if passed {
            tracing::debug!(index, check = %kind, "check passed");
        } else {
            tracing::debug!(index, check = %kind, message = %diagnostic.message, "check failed");
        }
        outcomes.push(CheckOutcome {
            index,
            kind,
            passed,
            diagnostic,
        });
    }

    pub fn report(&self) -> CheckReport {
        CheckReport {
            outcomes: self.lock().clone(),
        }
    }

    /// Returns the report and clears the recorder for the next run.
    pub fn take_report(&self) -> CheckReport {
        CheckReport {
            outcomes: std::mem::take(&mut *self.lock()),
        }
    }

    pub fn max_mismatches(&self) -> usize {
        self.max_mismatches
    }

    fn expect_scalar(&self, kind: CheckKind, value: i32) {
        let want_true = kind == CheckKind::ExpectTrue;
        let passed = (value != 0) == want_true;
        let message = if passed {
            format!("value {value} is {}", if want_true { "true" } else { "false" })
        } else {
            format!("expected {}, got {value}", if want_true { "true" } else { "false" })
        };
        self.record(
            kind,
            passed,
            CheckDiagnostic {
                message,
                ..CheckDiagnostic::default()
            },
        );
    }

    fn expect_all_true(&self, view: &BufferView) -> HalResult<()> {
        let host = view.to_host()?;
        let mut diagnostic = CheckDiagnostic {
            actual: Some(OperandSummary::from(&host)),
            ..CheckDiagnostic::default()
        };
        for (index, value) in host.to_f64_vec().into_iter().enumerate() {
            if value == 0.0 {
                self.push_mismatch(&mut diagnostic, index, 1.0, value);
            }
        }
        let passed = diagnostic.mismatch_count == 0;
        diagnostic.message = if passed {
            format!("all {} elements are true", host.element_count())
        } else {
            format!(
                "{} of {} elements are false",
                diagnostic.mismatch_count,
                host.element_count()
            )
        };
        self.record(CheckKind::ExpectAllTrue, passed, diagnostic);
        Ok(())
    }

    fn expect_close(
        &self,
        kind: CheckKind,
        actual: &BufferView,
        expected: &BufferView,
        tolerance: Option<f32>,
    ) -> HalResult<()> {
        let actual = actual.to_host()?;
        let expected = expected.to_host()?;
        let mut diagnostic = CheckDiagnostic {
            tolerance,
            actual: Some(OperandSummary::from(&actual)),
            expected: Some(OperandSummary::from(&expected)),
            ..CheckDiagnostic::default()
        };

        if actual.element_type != expected.element_type || actual.shape != expected.shape {
            diagnostic.message = format!(
                "operand mismatch: {}{:?} vs {}{:?}",
                actual.element_type, actual.shape, expected.element_type, expected.shape
            );
            self.record(kind, false, diagnostic);
            return Ok(());
        }

        match tolerance {
            None if !actual.element_type.is_float() => {
                let lhs = actual.to_i64_vec();
                let rhs = expected.to_i64_vec();
                for (index, (a, e)) in lhs.iter().zip(&rhs).enumerate() {
                    if a != e {
                        self.push_mismatch(&mut diagnostic, index, *e as f64, *a as f64);
                    }
                }
            }
            _ => {
                let tol = f64::from(tolerance.unwrap_or(0.0));
                let lhs = actual.to_f64_vec();
                let rhs = expected.to_f64_vec();
                for (index, (a, e)) in lhs.iter().zip(&rhs).enumerate() {
                    let equal = if tolerance.is_some() {
                        (a - e).abs() <= tol
                    } else {
                        a == e
                    };
                    if !equal {
                        self.push_mismatch(&mut diagnostic, index, *e, *a);
                    }
                }
            }
        }

        let passed = diagnostic.mismatch_count == 0;
        let count = actual.element_count();
        diagnostic.message = match (passed, tolerance) {
            (true, None) => format!("{count} elements equal"),
            (true, Some(tol)) => format!("{count} elements within tolerance {tol}"),
            (false, None) => format!("{} of {count} elements differ", diagnostic.mismatch_count),
            (false, Some(tol)) => format!(
                "{} of {count} elements differ by more than {tol}",
                diagnostic.mismatch_count
            ),
        };
        self.record(kind, passed, diagnostic);
        Ok(())
    }

    fn push_mismatch(&self, diagnostic: &mut CheckDiagnostic, index: usize, expected: f64, actual: f64) {
        diagnostic.mismatch_count += 1;
        if diagnostic.mismatches.len() < self.max_mismatches {
            diagnostic.mismatches.push(Mismatch {
                index,
                expected,
                actual,
            });
        }
    }
}

impl Default for CheckRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISMATCHES)
    }
}

/// Registers the five `check.*` imports against one recorder.
#[derive(Clone)]
pub struct CheckModule {
    recorder: Arc<CheckRecorder>,
}

impl CheckModule {
    pub fn new(recorder: Arc<CheckRecorder>) -> Self {
        Self { recorder }
    }

    pub fn recorder(&self) -> &Arc<CheckRecorder> {
        &self.recorder
    }
}

impl NativeModule for CheckModule {
    fn name(&self) -> &str {
        "check"
    }

    fn register(&self, registry: &mut ImportRegistry) -> HalResult<()> {
        for kind in CheckKind::ALL {
            let recorder = Arc::clone(&self.recorder);
            registry.register_import(
                kind.import_name(),
                kind.signature(),
                move |_: &CallContext<'_>, args: &[Value]| {
                    match kind {
                        CheckKind::ExpectTrue | CheckKind::ExpectFalse => {
                            recorder.expect_scalar(kind, args[0].as_i32()?)
                        }
                        CheckKind::ExpectAllTrue => {
                            recorder.expect_all_true(args[0].as_buffer_view()?)?
                        }
                        CheckKind::ExpectEq => recorder.expect_close(
                            kind,
                            args[0].as_buffer_view()?,
                            args[1].as_buffer_view()?,
                            None,
                        )?,
                        CheckKind::ExpectAlmostEq => recorder.expect_close(
                            kind,
                            args[0].as_buffer_view()?,
                            args[1].as_buffer_view()?,
                            Some(args[2].as_f32()?),
                        )?,
                    }
                    Ok(Vec::new())
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HostAllocator;

    fn view(values: &[f32]) -> BufferView {
        let host = HostTensor::from_f32(&[values.len()], values);
        BufferView::from_host(&HostAllocator::default(), &host).unwrap()
    }

    #[test]
    fn scalar_checks_record_verdicts() {
        let recorder = CheckRecorder::default();
        recorder.expect_scalar(CheckKind::ExpectTrue, 1);
        recorder.expect_scalar(CheckKind::ExpectTrue, 0);
        recorder.expect_scalar(CheckKind::ExpectFalse, 0);
        let report = recorder.report();
        assert_eq!(report.len(), 3);
        assert_eq!(report.failure_count(), 1);
        assert_eq!(report.failures().next().unwrap().index, 1);
    }

    #[test]
    fn almost_eq_reports_values_beyond_tolerance() {
        let recorder = CheckRecorder::default();
        recorder
            .expect_close(
                CheckKind::ExpectAlmostEq,
                &view(&[1.0, 2.0, 3.5]),
                &view(&[1.0, 2.00001, 3.0]),
                Some(1e-3),
            )
            .unwrap();
        let report = recorder.report();
        let outcome = &report.outcomes[0];
        assert!(!outcome.passed);
        assert_eq!(outcome.diagnostic.tolerance, Some(1e-3));
        assert_eq!(
            outcome.diagnostic.mismatches,
            vec![Mismatch {
                index: 2,
                expected: 3.0,
                actual: 3.5
            }]
        );
    }

    #[test]
    fn eq_rejects_shape_mismatch_as_failed_check() {
        let recorder = CheckRecorder::default();
        recorder
            .expect_close(CheckKind::ExpectEq, &view(&[1.0]), &view(&[1.0, 1.0]), None)
            .unwrap();
        let report = recorder.report();
        assert!(!report.all_passed());
        assert!(report.outcomes[0].diagnostic.message.contains("operand mismatch"));
    }

    #[test]
    fn mismatches_are_capped() {
        let recorder = CheckRecorder::new(2);
        recorder
            .expect_close(CheckKind::ExpectEq, &view(&[0.0; 5]), &view(&[1.0; 5]), None)
            .unwrap();
        let outcome = &recorder.report().outcomes[0];
        assert_eq!(outcome.diagnostic.mismatches.len(), 2);
        assert_eq!(outcome.diagnostic.mismatch_count, 5);
    }

    #[test]
    fn all_true_flags_zero_elements() {
        let recorder = CheckRecorder::default();
        recorder.expect_all_true(&view(&[1.0, 0.0, 2.0])).unwrap();
        let outcome = &recorder.take_report().outcomes[0];
        assert!(!outcome.passed);
        assert_eq!(outcome.diagnostic.mismatches[0].index, 1);
        assert!(recorder.report().is_empty());
    }
}
