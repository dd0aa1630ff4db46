//! Fuzz target: `showvminfo --machinereadable` parsing and the views over it.
//!
//! Every accessor must tolerate arbitrary hypervisor output.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vmfleet_vbox::{parser::parse_flat, MachineInfo};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let record = parse_flat(text);
    for key in record.keys() {
        assert!(!key.contains('\n'), "keys never span lines");
    }

    let info = MachineInfo::from_output(text);
    let _ = info.state();
    let next = info.next_free_volume_port();
    assert!(
        info.attached_volumes().values().all(|port| *port <= next),
        "next free port must not fall below an attached port"
    );
    let _ = info.nat_rules();
    let _ = info.shared_folders();
    let _ = info.mac_address(1);
});
