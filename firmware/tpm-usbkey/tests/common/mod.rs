//! Shared harness for the boot-flow tests.

#![allow(dead_code)]

use tpm_usbkey::config::Config;
use tpm_usbkey::nv::{CombinedRecord, NvLayout, NvStore, SerialRecord};
use tpm_usbkey::sim::{ScriptedConsole, SimBus, SimDevice, SimPlatform, SimulatedTpm};
use tpm_usbkey::{AuthState, Authenticator, Outcome, Result, Tpm};

pub const VID: u16 = 0x0781;
pub const PID: u16 = 0x5567;
pub const SERIAL: &str = "4C530001231018117092";

/// What one boot left behind
pub struct BootRun {
    pub outcome: Result<Outcome>,
    pub history: Vec<AuthState>,
    pub output: String,
    pub platform: SimPlatform,
    pub mismatches: u32,
}

pub fn registered_device() -> SimDevice {
    SimDevice::new(VID, PID, SERIAL)
}

pub fn config() -> Config {
    Config::default()
}

/// Boot once with the given devices and escaped key script
pub fn boot(sim: &mut SimulatedTpm, devices: &[SimDevice], script: &str) -> BootRun {
    boot_with(sim, devices, ScriptedConsole::from_script(script), &config())
}

pub fn boot_with(sim: &mut SimulatedTpm, devices: &[SimDevice], console: ScriptedConsole, config: &Config) -> BootRun {
    boot_on(sim, SimBus::new(devices.to_vec()), console, config)
}

/// Boot once against a caller-built bus
pub fn boot_on(sim: &mut SimulatedTpm, mut bus: SimBus, mut console: ScriptedConsole, config: &Config) -> BootRun {
    let mut platform = SimPlatform::default();

    let (outcome, history, mismatches) = {
        let mut auth = Authenticator::new(config, &mut *sim, &mut bus, &mut console, &mut platform)
            .expect("valid configuration");
        let outcome = auth.run();
        (outcome, auth.history().to_vec(), auth.mismatch_count())
    };

    BootRun {
        outcome,
        history,
        output: console.output().to_string(),
        platform,
        mismatches,
    }
}

/// Register `device` as the only attached device; returns the recovery code
pub fn register(sim: &mut SimulatedTpm, device: &SimDevice) -> String {
    let run = boot(sim, &[device.clone()], "1\\n");
    assert_eq!(run.outcome.expect("registration succeeds"), Outcome::WarmReset);
    recovery_code(&run.output).expect("recovery code shown")
}

/// Pull the displayed recovery code out of console output
pub fn recovery_code(output: &str) -> Option<String> {
    let start = output.find("Recovery code: ")? + "Recovery code: ".len();
    output.get(start..start + 24).map(str::to_string)
}

pub fn read_records(sim: &mut SimulatedTpm) -> (SerialRecord, CombinedRecord) {
    let mut tpm = Tpm::new(sim);
    let store = NvStore::new(NvLayout::default()).expect("default layout");
    let serial = store.read_serial(&mut tpm).expect("serial readable");
    let combined = store.read_combined(&mut tpm).expect("combined readable");
    (serial, combined)
}
