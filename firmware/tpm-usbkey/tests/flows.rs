//! End-to-end boot flows against the simulated module.

mod common;

use std::time::Duration;

use common::*;
use tpm_usbkey::codec::{TPM2_CC_HASH_SEQUENCE_START, TPM2_CC_NV_DEFINE_SPACE};
use tpm_usbkey::identity::{self, DeviceIdentity};
use tpm_usbkey::recovery::is_well_formed;
use tpm_usbkey::sim::{ScriptedConsole, SimBus, SimDevice, SimulatedTpm};
use tpm_usbkey::{AuthState, Error, Outcome, Tpm, TpmRc};

const WRONG_CODE: &str = "0000-0000-0000-0000-0000";

#[test]
fn registration_binds_device_and_resets() {
    let mut sim = SimulatedTpm::new();
    let run = boot(&mut sim, &[registered_device()], "1\\n");

    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert_eq!(
        run.history,
        vec![AuthState::Uninitialized, AuthState::Registering, AuthState::Bound]
    );
    assert_eq!(run.platform.resets(), 1);
    assert!(run.output.contains("Serial: 4C530001231018117092"));
    assert!(is_well_formed(&recovery_code(&run.output).unwrap()));

    let (serial, combined) = read_records(&mut sim);
    assert_eq!(serial.serial(), SERIAL.as_bytes());
    assert!(combined.is_bound());

    let expected = identity::fingerprint(
        &mut Tpm::new(&mut sim),
        &DeviceIdentity::new(VID, PID, SERIAL),
    )
    .unwrap();
    assert_eq!(combined.usb_hash, expected);
}

#[test]
fn registered_device_authenticates_on_first_cycle() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());

    let run = boot(&mut sim, &[registered_device()], "");
    assert_eq!(run.outcome.unwrap(), Outcome::Boot);
    assert_eq!(
        run.history,
        vec![AuthState::Uninitialized, AuthState::Authenticating, AuthState::Bound]
    );
    assert!(run.platform.stalls().is_empty());
    assert_eq!(run.platform.resets(), 0);
}

#[test]
fn registered_device_found_among_others() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());

    let devices = [
        SimDevice::new(0x046D, 0xC52B, "KEYBOARD"),
        SimDevice::without_serial(0x1234, 0x0001),
        registered_device(),
    ];
    let run = boot(&mut sim, &devices, "");
    assert_eq!(run.outcome.unwrap(), Outcome::Boot);
}

#[test]
fn device_differing_only_in_serial_does_not_match() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());

    let other = SimDevice::new(VID, PID, "4C530001231018117093");
    let console = ScriptedConsole::default().with_idle_polls(2);
    let run = boot_with(&mut sim, &[other], console, &config());

    // Script runs dry on the third poll
    assert!(matches!(run.outcome, Err(Error::Console(_))));
    assert_eq!(run.history, vec![AuthState::Uninitialized, AuthState::Authenticating]);
    assert_eq!(run.mismatches, 0);
    assert_eq!(run.platform.stalls(), &[Duration::from_millis(2000); 2]);
}

#[test]
fn three_hash_mismatches_lock_into_recovery() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device());

    // Same serial, different product id
    let impostor = SimDevice::new(VID, 0x5568, SERIAL);
    let run = boot(&mut sim, &[impostor], &format!("{}\\n\\n", code));

    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert_eq!(
        run.history,
        vec![
            AuthState::Uninitialized,
            AuthState::Authenticating,
            AuthState::Locked,
            AuthState::RecoveryPrompt,
        ]
    );
    assert!(run.output.contains("USB key verification failed (3/3)"));
    let mismatch_delays = run
        .platform
        .stalls()
        .iter()
        .filter(|d| **d == Duration::from_millis(1000))
        .count();
    // Two mismatch delays plus the reset delay
    assert_eq!(mismatch_delays, 3);
}

#[test]
fn genuine_key_after_two_mismatches_boots() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());

    let impostor = SimDevice::new(VID, 0x5568, SERIAL);
    let bus = SimBus::scheduled(vec![
        vec![impostor.clone()],
        vec![impostor],
        vec![registered_device()],
    ]);
    let run = boot_on(&mut sim, bus, ScriptedConsole::default(), &config());

    assert_eq!(run.outcome.unwrap(), Outcome::Boot);
    assert_eq!(run.mismatches, 0);
    assert!(!run.history.contains(&AuthState::RecoveryPrompt));
    assert!(run.output.contains("USB key verification failed (2/3)"));
    assert_eq!(run.platform.stalls(), &[Duration::from_millis(1000); 2]);
    assert_eq!(run.platform.resets(), 0);
}

#[test]
fn escape_enters_recovery_and_clears_binding() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device());

    let run = boot(&mut sim, &[], &format!("\\e{}\\n\\n", code));
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert_eq!(run.platform.resets(), 1);
    assert_eq!(run.platform.shutdowns(), 0);
    assert!(run.history.contains(&AuthState::RecoveryPrompt));

    let (serial, combined) = read_records(&mut sim);
    assert!(serial.is_sentinel());
    assert!(!combined.is_bound());
    assert!(combined.usb_hash.is_zero());
    assert!(combined.recovery_hash.is_zero());

    // Next boot registers again
    let run = boot(&mut sim, &[registered_device()], "1\\n");
    assert_eq!(run.history[1], AuthState::Registering);
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
}

#[test]
fn lower_case_recovery_code_accepted() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device()).to_ascii_lowercase();

    let run = boot(&mut sim, &[], &format!("\\e{}\\n\\n", code));
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
}

#[test]
fn correct_code_on_third_attempt() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device());

    let script = format!("\\e{w}\\n{w}\\n{c}\\n\\n", w = WRONG_CODE, c = code);
    let run = boot(&mut sim, &[], &script);
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert!(run.output.contains("Attempts remaining: 1"));
    assert!(read_records(&mut sim).0.is_sentinel());
}

#[test]
fn three_wrong_codes_shut_down() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());

    let script = format!("\\e{w}\\n{w}\\n{w}\\n", w = WRONG_CODE);
    let run = boot(&mut sim, &[], &script);

    assert!(matches!(run.outcome, Err(Error::SecurityViolation)));
    assert_eq!(run.platform.shutdowns(), 1);
    assert_eq!(run.platform.resets(), 0);
    assert!(run.platform.stalls().contains(&Duration::from_millis(2000)));

    // Binding untouched
    let (serial, combined) = read_records(&mut sim);
    assert_eq!(serial.serial(), SERIAL.as_bytes());
    assert!(combined.is_bound());
}

#[test]
fn module_fault_while_hashing_code_uses_an_attempt() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device());
    sim.fail_next(TPM2_CC_HASH_SEQUENCE_START, TpmRc::FAILURE);

    let run = boot(&mut sim, &[], &format!("\\e{c}\\n{c}\\n\\n", c = code));
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert!(run.output.contains("Failed to verify recovery code. Attempts remaining: 2"));
    assert!(read_records(&mut sim).0.is_sentinel());
}

#[test]
fn module_faults_count_toward_shutdown() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device());
    sim.fail_next(TPM2_CC_HASH_SEQUENCE_START, TpmRc::FAILURE);
    sim.fail_next(TPM2_CC_HASH_SEQUENCE_START, TpmRc::FAILURE);

    let script = format!("\\e{c}\\n{c}\\n{w}\\n", c = code, w = WRONG_CODE);
    let run = boot(&mut sim, &[], &script);
    assert!(matches!(run.outcome, Err(Error::SecurityViolation)));
    assert_eq!(run.platform.shutdowns(), 1);
    assert!(read_records(&mut sim).1.is_bound());
}

#[test]
fn unreachable_module_aborts_registration() {
    let mut sim = SimulatedTpm::new();
    sim.set_connected(false);

    let run = boot(&mut sim, &[registered_device()], "1\\n");
    assert!(matches!(run.outcome, Err(Error::Transport(_))));
    assert_eq!(run.history, vec![AuthState::Uninitialized, AuthState::Registering]);
    assert!(run.platform.stalls().is_empty());
    assert!(!run.output.contains("Registration failed"));
}

#[test]
fn short_code_entry_is_retyped() {
    let mut sim = SimulatedTpm::new();
    let code = register(&mut sim, &registered_device());

    let script = format!("\\e1234\\n{}\\n\\n", code);
    let run = boot(&mut sim, &[], &script);
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert!(run.output.contains("exactly 24 characters"));
}

#[test]
fn registration_retries_after_definition_failure() {
    let mut sim = SimulatedTpm::new();
    sim.fail_next(TPM2_CC_NV_DEFINE_SPACE, TpmRc::NV_SPACE);

    let run = boot(&mut sim, &[registered_device()], "1\\n");
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert!(run.output.contains("Registration failed"));
    assert_eq!(run.platform.stalls()[0], Duration::from_millis(3000));
}

#[test]
fn registration_without_devices_gives_up_when_bounded() {
    let mut sim = SimulatedTpm::new();
    let mut config = config();
    config.policy.registration_attempts = 2;

    let run = boot_with(&mut sim, &[], ScriptedConsole::default(), &config);
    assert!(matches!(run.outcome, Err(Error::DeviceNotFound)));
    assert_eq!(run.platform.stalls(), &[Duration::from_millis(3000)]);
    assert!(run.output.contains("No USB devices found"));
}

#[test]
fn invalid_selection_retries_registration() {
    let mut sim = SimulatedTpm::new();
    let run = boot(&mut sim, &[registered_device()], "71\\n");
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);
    assert!(run.output.contains("Invalid selection"));
}

#[test]
fn long_serial_hashes_across_chunks() {
    let mut sim = SimulatedTpm::new().with_max_buffer(128);
    let mut config = config();
    config.transport.max_buffer = 128;

    let device = SimDevice::new(VID, PID, &"S".repeat(127));
    let run = boot_with(&mut sim, &[device.clone()], ScriptedConsole::from_script("1\\n"), &config);
    assert_eq!(run.outcome.unwrap(), Outcome::WarmReset);

    let run = boot_with(&mut sim, &[device], ScriptedConsole::default(), &config);
    assert_eq!(run.outcome.unwrap(), Outcome::Boot);
}

#[test]
fn flaky_descriptor_is_retried() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());

    let flaky = registered_device().with_initial_invalid_ids(1);
    let run = boot(&mut sim, &[flaky], "");
    assert_eq!(run.outcome.unwrap(), Outcome::Boot);
    assert_eq!(run.platform.stalls(), &[Duration::from_millis(1000)]);
}

#[test]
fn module_fault_during_scan_is_reported_and_rescanned() {
    let mut sim = SimulatedTpm::new();
    register(&mut sim, &registered_device());
    sim.fail_next(TPM2_CC_HASH_SEQUENCE_START, TpmRc::RETRY);

    let console = ScriptedConsole::default().with_idle_polls(1);
    let run = boot_with(&mut sim, &[registered_device()], console, &config());
    assert_eq!(run.outcome.unwrap(), Outcome::Boot);
    assert!(run.output.contains("Authentication error"));
}
