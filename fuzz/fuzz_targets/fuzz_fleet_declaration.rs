//! Fuzz target: JSON deserialization and validation of `FleetDeclaration`.
//!
//! Errors are expected; panics are not.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vmfleet_gateway::declaration::FleetDeclaration;

fuzz_target!(|data: &[u8]| {
    if let Ok(decl) = serde_json::from_slice::<FleetDeclaration>(data) {
        if let Ok(valid) = decl.validate() {
            for host in &valid.hosts {
                let _ = vmfleet_core::VmIdentity::new(host.name.clone(), valid.environment.clone())
                    .vm_name();
            }
        }
    }
});
