pub mod fixtures;
pub mod hal_suite;
pub mod vm_suite;

/// Instantiates the conformance suite for one backend.
///
/// `$device_ctor` is a `fn() -> Option<Arc<dyn Device>>`; returning `None`
/// skips every test (native dependency missing). `$kernels` is a
/// `fn() -> KernelSection` implementing the `elementwise` executable.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $device_ctor:expr, $kernels:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::{hal_suite, vm_suite};

            macro_rules! device_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        $crate::fixtures::init_tracing();
                        let Some(device) = ($device_ctor)() else {
                            return;
                        };
                        $func(&device);
                    }
                };
            }

            macro_rules! kernel_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        $crate::fixtures::init_tracing();
                        let Some(device) = ($device_ctor)() else {
                            return;
                        };
                        let kernels = ($kernels)();
                        $func(&device, &kernels);
                    }
                };
            }

            device_test!(device_reports_identity, hal_suite::device_reports_identity);
            device_test!(semaphore_releases_waiters, hal_suite::semaphore_releases_waiters);
            device_test!(semaphore_wait_times_out, hal_suite::semaphore_wait_times_out);
            device_test!(command_buffer_lifecycle, hal_suite::command_buffer_lifecycle);
            device_test!(copy_and_fill_round_trip, hal_suite::copy_and_fill_round_trip);
            device_test!(transfer_ranges_are_validated, hal_suite::transfer_ranges_are_validated);
            device_test!(waits_gate_submissions, hal_suite::waits_gate_submissions);
            device_test!(
                submissions_chain_through_semaphores,
                hal_suite::submissions_chain_through_semaphores
            );
            device_test!(abandon_cancels_pending_work, hal_suite::abandon_cancels_pending_work);
            device_test!(
                wait_idle_times_out_on_blocked_work,
                hal_suite::wait_idle_times_out_on_blocked_work
            );
            device_test!(
                embedded_wait_yields_to_producer,
                hal_suite::embedded_wait_yields_to_producer
            );
            device_test!(live_resources_track_handles, hal_suite::live_resources_track_handles);

            kernel_test!(dispatch_add_matches_host, hal_suite::dispatch_add_matches_host);
            kernel_test!(
                dispatch_round_trip_settles_device,
                hal_suite::dispatch_round_trip_settles_device
            );
            kernel_test!(dispatch_validates_bindings, hal_suite::dispatch_validates_bindings);
            kernel_test!(
                failed_dispatch_leaves_signals_untouched,
                hal_suite::failed_dispatch_leaves_signals_untouched
            );
            kernel_test!(executable_cache_single_flight, hal_suite::executable_cache_single_flight);
            kernel_test!(
                malformed_executable_fails_compilation,
                hal_suite::malformed_executable_fails_compilation
            );
            kernel_test!(check_pipeline_reports_results, vm_suite::check_pipeline_reports_results);
            kernel_test!(
                unresolved_import_fails_before_work,
                vm_suite::unresolved_import_fails_before_work
            );
            kernel_test!(
                invoke_rejects_mistyped_arguments,
                vm_suite::invoke_rejects_mistyped_arguments
            );

            #[test]
            fn foreign_command_buffer_is_rejected() {
                let (Some(device), Some(other)) = (($device_ctor)(), ($device_ctor)()) else {
                    return;
                };
                hal_suite::foreign_command_buffer_is_rejected(&device, &other);
            }

            #[test]
            fn teardown_cancels_pending_work() {
                let Some(device) = ($device_ctor)() else {
                    return;
                };
                hal_suite::teardown_cancels_pending_work(device);
            }
        }
    };
}
