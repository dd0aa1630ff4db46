//! Fuzz target: blank-line separated `VBoxManage list` output.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vmfleet_vbox::{parser::parse_blocks, DhcpServer};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    for record in parse_blocks(text) {
        assert!(!record.is_empty(), "empty blocks are never emitted");
        if let Some(server) = DhcpServer::from_record(&record) {
            let _ = server.index();
        }
    }
});
